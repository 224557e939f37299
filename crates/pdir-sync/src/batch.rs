//! Pushes canonical attribute values to the store in bounded create/update batches.

use std::collections::HashMap;

use pdir_core::{
    Attribute, AttributeKind, AttributeSource, AttributeValue, CanonicalEntity, CanonicalGraph, EntityId,
    GraphError, StoreEntity, StoreId, Variant,
};
use pdir_storage::TargetStore;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::lookup::LookupContext;
use crate::pairing::{Pair, PairingOutcome};
use crate::report::{Stage, SyncWarnings};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub updated: usize,
    pub created: usize,
    pub failed_batches: usize,
    pub failed_records: usize,
}

/// Store value for one canonical attribute; option sets are resolved to their code.
pub fn store_value(
    entity: &CanonicalEntity,
    attribute: Attribute,
    lookups: &LookupContext,
    warnings: &mut SyncWarnings,
) -> Option<AttributeValue> {
    let value = entity.value(attribute)?;
    if attribute.kind() != AttributeKind::OptionSet {
        return Some(value);
    }
    let label = value.to_string();
    match lookups.option_code(attribute, &label) {
        Some(code) => Some(AttributeValue::Integer(code)),
        None => {
            warnings.record(
                Stage::Batch,
                format!("{}: no {} code for '{}'", entity.kind.label(), attribute.field(), label),
            );
            None
        }
    }
}

/// Overwrite `attributes` on `target` with the canonical values, clearing missing ones.
pub fn populate(
    target: &mut StoreEntity,
    entity: &CanonicalEntity,
    attributes: impl IntoIterator<Item = Attribute>,
    lookups: &LookupContext,
    warnings: &mut SyncWarnings,
) {
    for attribute in attributes {
        target.set(attribute, store_value(entity, attribute, lookups, warnings));
    }
}

pub struct BatchSynchronizer<'a> {
    store: &'a dyn TargetStore,
    lookups: &'a LookupContext,
    batch_size: usize,
}

impl<'a> BatchSynchronizer<'a> {
    pub fn new(store: &'a dyn TargetStore, lookups: &'a LookupContext, batch_size: usize) -> Self {
        Self {
            store,
            lookups,
            batch_size,
        }
    }

    /// Effective batch size: the configured size, capped by the store.
    pub fn batch_limit(&self) -> usize {
        self.batch_size.min(self.store.max_batch_size()).max(1)
    }

    /// Update every pair, create every unmatched entity, and return the pair
    /// set with created records folded in. Failed batches are logged and
    /// skipped; entities from a failed create batch stay unpaired.
    pub async fn synchronize(
        &self,
        graph: &CanonicalGraph,
        outcome: PairingOutcome,
        warnings: &mut SyncWarnings,
    ) -> Result<(Vec<Pair>, BatchReport), GraphError> {
        let mut report = BatchReport::default();
        let mut pairs = outcome.pairs;

        for pair in &mut pairs {
            let entity = graph.entity(pair.canonical)?;
            let variant = pair.variant();
            populate(
                &mut pair.store,
                entity,
                Attribute::writable_on_update(variant),
                self.lookups,
                warnings,
            );
        }
        for variant in Variant::ALL {
            let updates: Vec<StoreEntity> = pairs
                .iter()
                .filter(|p| p.variant() == variant)
                .map(|p| p.store.clone())
                .collect();
            self.push_updates(variant, &updates, &mut report, warnings).await;
        }

        for variant in Variant::ALL {
            let mut pending: Vec<(EntityId, StoreEntity)> = Vec::new();
            for &id in &outcome.unmatched_canonical {
                let entity = graph.entity(id)?;
                if entity.variant() != variant {
                    continue;
                }
                let mut stub = StoreEntity::new(variant);
                populate(&mut stub, entity, Attribute::for_variant(variant), self.lookups, warnings);
                pending.push((id, stub));
            }
            let created = self.push_creates(variant, pending, &mut report, warnings).await;
            pairs.extend(created);
        }

        info!(
            updated = report.updated,
            created = report.created,
            failed_batches = report.failed_batches,
            "batch synchronization complete"
        );
        Ok((pairs, report))
    }

    async fn push_updates(
        &self,
        variant: Variant,
        updates: &[StoreEntity],
        report: &mut BatchReport,
        warnings: &mut SyncWarnings,
    ) {
        for (n, chunk) in updates.chunks(self.batch_limit()).enumerate() {
            match self.store.update_many(variant, chunk).await {
                Ok(()) => {
                    report.updated += chunk.len();
                    debug!(%variant, batch = n + 1, size = chunk.len(), "updated batch");
                }
                Err(err) => {
                    error!(%variant, batch = n + 1, size = chunk.len(), error = %err, "update batch failed");
                    report.failed_batches += 1;
                    report.failed_records += chunk.len();
                    warnings.record(
                        Stage::Batch,
                        format!("{variant} update batch {} ({} records) failed: {err}", n + 1, chunk.len()),
                    );
                }
            }
        }
    }

    async fn push_creates(
        &self,
        variant: Variant,
        pending: Vec<(EntityId, StoreEntity)>,
        report: &mut BatchReport,
        warnings: &mut SyncWarnings,
    ) -> Vec<Pair> {
        let mut created = Vec::new();
        for (n, chunk) in pending.chunks(self.batch_limit()).enumerate() {
            let stubs: Vec<StoreEntity> = chunk.iter().map(|(_, stub)| stub.clone()).collect();
            let ids = match self.store.create_many(variant, &stubs).await {
                Ok(ids) => ids,
                Err(err) => {
                    error!(%variant, batch = n + 1, size = chunk.len(), error = %err, "create batch failed");
                    report.failed_batches += 1;
                    report.failed_records += chunk.len();
                    warnings.record(
                        Stage::Batch,
                        format!("{variant} create batch {} ({} records) failed: {err}", n + 1, chunk.len()),
                    );
                    continue;
                }
            };
            report.created += ids.len();
            debug!(%variant, batch = n + 1, size = ids.len(), "created batch");

            let (mut fetched, refetched): (HashMap<StoreId, StoreEntity>, bool) =
                match self.store.fetch_by_ids(variant, &ids).await {
                    Ok(records) => (
                        records
                            .into_iter()
                            .filter_map(|r| r.id.clone().map(|id| (id, r)))
                            .collect(),
                        true,
                    ),
                    Err(err) => {
                        warnings.record(
                            Stage::Batch,
                            format!("re-fetching {} created {variant} records failed: {err}", ids.len()),
                        );
                        (HashMap::new(), false)
                    }
                };

            for ((canonical, stub), id) in chunk.iter().zip(ids) {
                let store = match fetched.remove(&id) {
                    Some(record) => record,
                    None => {
                        if refetched {
                            warnings.record(Stage::Batch, format!("created {variant} {id} was not returned by re-fetch"));
                        }
                        let mut stub = stub.clone();
                        stub.id = Some(id);
                        stub
                    }
                };
                created.push(Pair {
                    canonical: *canonical,
                    store,
                });
            }
        }
        created
    }
}
