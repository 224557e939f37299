//! Pairs canonical entities with store records through their equality predicates.

use std::collections::{BTreeMap, HashMap, HashSet};

use pdir_core::{
    split_by_condition_limit, CanonicalEntity, CanonicalGraph, EntityId, EqualityPredicate, PredicateError,
    StoreEntity, StoreId, Variant,
};
use pdir_storage::{StoreError, TargetStore};
use serde::Serialize;
use tracing::{debug, info};

/// One canonical entity and the store record believed to represent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pair {
    pub canonical: EntityId,
    pub store: StoreEntity,
}

impl Pair {
    pub fn new(canonical: &CanonicalEntity, store: StoreEntity) -> Result<Self, PredicateError> {
        if canonical.variant() != store.variant {
            return Err(PredicateError::VariantMismatch {
                expected: canonical.variant(),
                found: store.variant,
            });
        }
        Ok(Self {
            canonical: canonical.id,
            store,
        })
    }

    pub fn variant(&self) -> Variant {
        self.store.variant
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    /// The store record was already claimed by an earlier canonical entity.
    StoreMatchedSeveral,
    /// The canonical entity already had a pair when this store record matched it.
    CanonicalMatchedTwice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateMatch {
    pub variant: Variant,
    pub canonical: EntityId,
    pub store: Option<StoreId>,
    pub kind: DuplicateKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PairingOutcome {
    pub pairs: Vec<Pair>,
    pub duplicates: Vec<DuplicateMatch>,
    pub unmatched_canonical: Vec<EntityId>,
    pub unmatched_store: Vec<StoreEntity>,
}

impl PairingOutcome {
    pub fn pair_for(&self, canonical: EntityId) -> Option<&Pair> {
        self.pairs.iter().find(|p| p.canonical == canonical)
    }
}

/// Greedy per-variant pairing.
///
/// Store records are visited in order and each pairs with the first still
/// unpaired canonical entity whose predicate accepts it. Any further unpaired
/// match is reported as a duplicate and stays eligible. A store record that
/// only matches already-paired entities is a duplicate of the first of them.
pub fn pair_entities(
    graph: &CanonicalGraph,
    store: &BTreeMap<Variant, Vec<StoreEntity>>,
) -> Result<PairingOutcome, PredicateError> {
    let mut outcome = PairingOutcome::default();

    for variant in Variant::ALL {
        let canonical: Vec<(&CanonicalEntity, EqualityPredicate)> = graph
            .of_variant(variant)
            .map(|e| (e, EqualityPredicate::for_entity(e)))
            .collect();
        let mut paired = vec![false; canonical.len()];

        for record in store.get(&variant).into_iter().flatten() {
            let mut winner = None;
            for (i, (entity, predicate)) in canonical.iter().enumerate() {
                if paired[i] || !predicate.evaluate(record)? {
                    continue;
                }
                if winner.is_none() {
                    winner = Some(i);
                } else {
                    outcome.duplicates.push(DuplicateMatch {
                        variant,
                        canonical: entity.id,
                        store: record.id.clone(),
                        kind: DuplicateKind::StoreMatchedSeveral,
                    });
                }
            }

            if let Some(i) = winner {
                paired[i] = true;
                outcome.pairs.push(Pair::new(canonical[i].0, record.clone())?);
                continue;
            }

            let mut already = None;
            for (i, (entity, predicate)) in canonical.iter().enumerate() {
                if paired[i] && predicate.evaluate(record)? {
                    already = Some(entity.id);
                    break;
                }
            }
            match already {
                Some(canonical) => outcome.duplicates.push(DuplicateMatch {
                    variant,
                    canonical,
                    store: record.id.clone(),
                    kind: DuplicateKind::CanonicalMatchedTwice,
                }),
                None => outcome.unmatched_store.push(record.clone()),
            }
        }

        outcome.unmatched_canonical.extend(
            canonical
                .iter()
                .zip(&paired)
                .filter(|(_, paired)| !**paired)
                .map(|((entity, _), _)| entity.id),
        );
    }

    debug!(
        pairs = outcome.pairs.len(),
        duplicates = outcome.duplicates.len(),
        new = outcome.unmatched_canonical.len(),
        unmatched_store = outcome.unmatched_store.len(),
        "pairing complete"
    );
    Ok(outcome)
}

/// Fetch every store record any canonical entity could pair with.
///
/// Per variant the entity predicates are OR-ed into queries that respect the
/// store's condition ceiling. Results are de-duplicated by identifier in
/// first-seen order.
pub async fn fetch_store_snapshot(
    store: &dyn TargetStore,
    graph: &CanonicalGraph,
    max_conditions: usize,
) -> Result<BTreeMap<Variant, Vec<StoreEntity>>, StoreError> {
    let limit = max_conditions.min(store.max_conditions()).max(1);
    let mut snapshot = BTreeMap::new();

    for variant in Variant::ALL {
        let predicates: Vec<EqualityPredicate> = graph.of_variant(variant).map(EqualityPredicate::for_entity).collect();
        if predicates.is_empty() {
            continue;
        }
        let queries = split_by_condition_limit(predicates.iter().map(EqualityPredicate::root), limit);

        let mut seen: HashSet<StoreId> = HashSet::new();
        let mut records = Vec::new();
        for (n, query) in queries.iter().enumerate() {
            let fetched = store.fetch(variant, Some(query)).await?;
            debug!(%variant, query = n + 1, of = queries.len(), fetched = fetched.len(), "store query");
            for record in fetched {
                if let Some(id) = &record.id {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                }
                records.push(record);
            }
        }
        info!(%variant, canonical = predicates.len(), queries = queries.len(), found = records.len(), "fetched store records");
        snapshot.insert(variant, records);
    }
    Ok(snapshot)
}

/// Index of pairs by canonical entity.
pub fn index_pairs(pairs: &[Pair]) -> HashMap<EntityId, &Pair> {
    pairs.iter().map(|p| (p.canonical, p)).collect()
}
