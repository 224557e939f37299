//! Folds raw source records into canonical entities and their association graph.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pdir_core::{
    CanonicalGraph, EntityId, EntityKind, EqualityPredicate, Facility, GraphError, Group, Individual,
    PredicateError, RawRecord, Variant,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Predicate(#[from] PredicateError),
}

/// Finished consolidation state, read-only for everything downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consolidation {
    pub graph: CanonicalGraph,
    pub records: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Consolidation {
    pub fn count(&self, variant: Variant) -> usize {
        self.graph.count(variant)
    }
}

/// Streaming consolidator. Records must be fed in arrival order; merge
/// conflicts resolve in favour of whichever record the rules prefer at the
/// time it arrives.
#[derive(Debug, Default)]
pub struct Consolidator {
    graph: CanonicalGraph,
    individuals: HashMap<String, EntityId>,
    groups: HashMap<String, EntityId>,
    /// Name bucket -> facilities in creation order.
    facilities: HashMap<String, Vec<EntityId>>,
    records: u64,
    last_updated: Option<DateTime<Utc>>,
}

impl Consolidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, records: &[RawRecord]) -> Result<(), ConsolidationError> {
        for record in records {
            self.ingest_record(record)?;
        }
        Ok(())
    }

    pub fn ingest_record(&mut self, record: &RawRecord) -> Result<(), ConsolidationError> {
        let individual = self.resolve_individual(record);
        let group = if record.has_group() {
            let group = self.resolve_group(record);
            self.graph.associate(group, individual)?;
            Some(group)
        } else {
            None
        };

        let facility = self.resolve_facility(record)?;
        self.graph.associate(facility, individual)?;
        if let Some(group) = group {
            self.graph.associate(facility, group)?;
        }

        self.records += 1;
        self.last_updated = Some(Utc::now());
        Ok(())
    }

    pub fn graph(&self) -> &CanonicalGraph {
        &self.graph
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn finish(self) -> Consolidation {
        Consolidation {
            graph: self.graph,
            records: self.records,
            last_updated: self.last_updated,
        }
    }

    fn resolve_individual(&mut self, record: &RawRecord) -> EntityId {
        let key = record.enrollment_id.trim().to_string();
        if let Some(id) = self.individuals.get(&key) {
            return *id;
        }
        let id = self
            .graph
            .insert(EntityKind::Individual(Individual::from_record(record)));
        self.individuals.insert(key, id);
        id
    }

    fn resolve_group(&mut self, record: &RawRecord) -> EntityId {
        let key = record.group_id.trim().to_string();
        if let Some(id) = self.groups.get(&key) {
            return *id;
        }
        let id = self.graph.insert(EntityKind::Group(Group::from_record(record)));
        self.groups.insert(key, id);
        id
    }

    fn resolve_facility(&mut self, record: &RawRecord) -> Result<EntityId, ConsolidationError> {
        let incoming = Facility::from_record(record);
        let bucket = incoming.bucket_key();
        let transient = EntityKind::Facility(incoming.clone());

        let mut matched = None;
        for &candidate in self.facilities.get(&bucket).into_iter().flatten() {
            let existing = self.graph.entity(candidate)?;
            if EqualityPredicate::for_entity(existing).evaluate(&transient)? {
                matched = Some(candidate);
                break;
            }
        }

        match matched {
            Some(id) => {
                if let EntityKind::Facility(existing) = self.graph.kind_mut(id)? {
                    merge_facility(existing, incoming);
                    debug!(facility = %id, count = existing.affiliated_count, "merged facility");
                }
                Ok(id)
            }
            None => {
                let id = self.graph.insert(EntityKind::Facility(incoming));
                self.facilities.entry(bucket).or_default().push(id);
                Ok(id)
            }
        }
    }
}

/// Count the affiliation and keep the fuller address and phone.
fn merge_facility(existing: &mut Facility, incoming: Facility) {
    existing.affiliated_count += 1;
    if existing.address.line2_suppressed && !incoming.address.line2_suppressed {
        existing.address = incoming.address;
    }
    if existing.phone.is_empty() && !incoming.phone.is_empty() {
        existing.phone = incoming.phone;
    }
}

/// Consolidate a complete record sequence in one call.
pub fn consolidate(records: &[RawRecord]) -> Result<Consolidation, ConsolidationError> {
    let mut consolidator = Consolidator::new();
    consolidator.ingest(records)?;
    Ok(consolidator.finish())
}
