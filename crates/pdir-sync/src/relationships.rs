//! Mirrors the canonical association graph into store link records.

use std::collections::{BTreeMap, HashSet};

use pdir_core::{CanonicalGraph, EntityId, GraphError, StoreId, Variant};
use pdir_storage::TargetStore;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::pairing::{index_pairs, Pair};
use crate::report::{Stage, SyncWarnings};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelationshipReport {
    pub existing: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed_link_sets: usize,
    pub failed_links: usize,
}

pub struct RelationshipSynchronizer<'a> {
    store: &'a dyn TargetStore,
}

impl<'a> RelationshipSynchronizer<'a> {
    pub fn new(store: &'a dyn TargetStore) -> Self {
        Self { store }
    }

    /// Create every graph edge missing from the store.
    ///
    /// Each undirected edge is considered once, from whichever endpoint comes
    /// first in `pairs`. Missing links are submitted in one associate call per
    /// source entity; a failed call is recorded and the next entity proceeds.
    pub async fn synchronize(
        &self,
        graph: &CanonicalGraph,
        pairs: &[Pair],
        warnings: &mut SyncWarnings,
    ) -> Result<RelationshipReport, GraphError> {
        let by_entity = index_pairs(pairs);
        let mut visited: HashSet<(EntityId, EntityId)> = HashSet::new();
        let mut report = RelationshipReport::default();

        for pair in pairs {
            let entity = graph.entity(pair.canonical)?;
            let Some(source) = pair.store.store_ref() else {
                continue;
            };

            let mut missing: BTreeMap<Variant, Vec<StoreId>> = BTreeMap::new();
            for &neighbor in entity.links() {
                let edge = (pair.canonical.min(neighbor), pair.canonical.max(neighbor));
                if !visited.insert(edge) {
                    continue;
                }
                let Some(target) = by_entity.get(&neighbor).and_then(|p| p.store.store_ref()) else {
                    report.skipped += 1;
                    warnings.record(
                        Stage::Relationships,
                        format!(
                            "{} -> {}: counterpart has no store record, link skipped",
                            entity.kind.label(),
                            graph.entity(neighbor)?.kind.label()
                        ),
                    );
                    continue;
                };

                match self.store.relation_exists(&source, &target).await {
                    Ok(true) => report.existing += 1,
                    Ok(false) => missing.entry(target.variant).or_default().push(target.id),
                    Err(err) => {
                        report.failed_links += 1;
                        warnings.record(
                            Stage::Relationships,
                            format!("checking link {source} -> {target} failed: {err}"),
                        );
                    }
                }
            }

            if missing.is_empty() {
                continue;
            }
            let count: usize = missing.values().map(Vec::len).sum();
            match self.store.associate(&source, &missing).await {
                Ok(()) => {
                    report.created += count;
                    debug!(%source, links = count, "associated");
                }
                Err(err) => {
                    error!(%source, links = count, error = %err, "associate failed");
                    report.failed_link_sets += 1;
                    report.failed_links += count;
                    warnings.record(
                        Stage::Relationships,
                        format!("associating {count} links from {source} failed: {err}"),
                    );
                }
            }
        }

        info!(
            existing = report.existing,
            created = report.created,
            skipped = report.skipped,
            failed = report.failed_link_sets,
            "relationship synchronization complete"
        );
        Ok(report)
    }
}
