//! In-process store used for dry runs and tests.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use pdir_core::{Attribute, AttributeSource, Predicate, StoreEntity, StoreId, StoreRef, Variant};
use tokio::sync::Mutex;

use crate::{check_batch, check_conditions, StoreError, TargetStore, DEFAULT_MAX_BATCH, DEFAULT_MAX_CONDITIONS};

/// Calls received, for asserting batch behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    pub fetches: usize,
    pub creates: Vec<usize>,
    pub updates: Vec<usize>,
    pub associates: usize,
    pub relation_checks: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<Variant, Vec<StoreEntity>>,
    links: BTreeSet<(StoreRef, StoreRef)>,
    next_id: u64,
    calls: CallLog,
}

impl MemoryState {
    fn allocate_id(&mut self, variant: Variant) -> StoreId {
        self.next_id += 1;
        StoreId::new(format!("{variant}-{}", self.next_id))
    }

    fn find_mut(&mut self, store_ref: &StoreRef) -> Option<&mut StoreEntity> {
        self.records
            .get_mut(&store_ref.variant)?
            .iter_mut()
            .find(|e| e.id.as_ref() == Some(&store_ref.id))
    }

    fn exists(&self, store_ref: &StoreRef) -> bool {
        self.records
            .get(&store_ref.variant)
            .is_some_and(|list| list.iter().any(|e| e.id.as_ref() == Some(&store_ref.id)))
    }
}

fn link_key(a: &StoreRef, b: &StoreRef) -> (StoreRef, StoreRef) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    max_batch: usize,
    max_conditions: usize,
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BATCH, DEFAULT_MAX_CONDITIONS)
    }

    pub fn with_limits(max_batch: usize, max_conditions: usize) -> Self {
        Self {
            max_batch: max_batch.max(1),
            max_conditions: max_conditions.max(1),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Insert a pre-existing record, assigning an identifier if it has none.
    pub async fn seed(&self, mut entity: StoreEntity) -> StoreId {
        let mut state = self.state.lock().await;
        let id = match entity.id.clone() {
            Some(id) => id,
            None => state.allocate_id(entity.variant),
        };
        entity.id = Some(id.clone());
        state.records.entry(entity.variant).or_default().push(entity);
        id
    }

    pub async fn seed_link(&self, a: &StoreRef, b: &StoreRef) {
        self.state.lock().await.links.insert(link_key(a, b));
    }

    pub async fn records(&self, variant: Variant) -> Vec<StoreEntity> {
        self.state
            .lock()
            .await
            .records
            .get(&variant)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn links(&self) -> Vec<(StoreRef, StoreRef)> {
        self.state.lock().await.links.iter().cloned().collect()
    }

    pub async fn calls(&self) -> CallLog {
        self.state.lock().await.calls.clone()
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    fn max_conditions(&self) -> usize {
        self.max_conditions
    }

    async fn fetch(
        &self,
        variant: Variant,
        filter: Option<&Predicate>,
    ) -> Result<Vec<StoreEntity>, StoreError> {
        check_conditions(filter, self.max_conditions)?;
        let mut state = self.state.lock().await;
        state.calls.fetches += 1;
        let mut out = Vec::new();
        for entity in state.records.get(&variant).into_iter().flatten() {
            let keep = match filter {
                Some(predicate) => predicate.evaluate(entity as &dyn AttributeSource)?,
                None => true,
            };
            if keep {
                out.push(entity.clone());
            }
        }
        Ok(out)
    }

    async fn fetch_by_ids(
        &self,
        variant: Variant,
        ids: &[StoreId],
    ) -> Result<Vec<StoreEntity>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.fetches += 1;
        let records = state.records.get(&variant);
        Ok(ids
            .iter()
            .filter_map(|id| {
                records?
                    .iter()
                    .find(|e| e.id.as_ref() == Some(id))
                    .cloned()
            })
            .collect())
    }

    async fn create_many(
        &self,
        variant: Variant,
        entities: &[StoreEntity],
    ) -> Result<Vec<StoreId>, StoreError> {
        check_batch(entities.len(), self.max_batch)?;
        let mut state = self.state.lock().await;
        state.calls.creates.push(entities.len());
        let mut ids = Vec::with_capacity(entities.len());
        for entity in entities {
            if entity.variant != variant {
                return Err(StoreError::Rejected(format!(
                    "{} record sent to {} create",
                    entity.variant, variant
                )));
            }
        }
        for entity in entities {
            let id = state.allocate_id(variant);
            let mut stored = entity.clone();
            stored.id = Some(id.clone());
            state.records.entry(variant).or_default().push(stored);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn update_many(&self, variant: Variant, entities: &[StoreEntity]) -> Result<(), StoreError> {
        check_batch(entities.len(), self.max_batch)?;
        let mut state = self.state.lock().await;
        state.calls.updates.push(entities.len());

        let mut refs = Vec::with_capacity(entities.len());
        for entity in entities {
            let id = entity.id.clone().ok_or(StoreError::MissingId(variant))?;
            let store_ref = StoreRef { variant, id };
            if !state.exists(&store_ref) {
                return Err(StoreError::NotFound(store_ref));
            }
            refs.push(store_ref);
        }
        // Writable attributes are overwritten, missing ones cleared; create-only fields stay.
        for (store_ref, entity) in refs.iter().zip(entities) {
            if let Some(stored) = state.find_mut(store_ref) {
                for attribute in Attribute::writable_on_update(variant) {
                    stored.set(attribute, entity.get(attribute).cloned());
                }
            }
        }
        Ok(())
    }

    async fn associate(
        &self,
        source: &StoreRef,
        targets: &BTreeMap<Variant, Vec<StoreId>>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.calls.associates += 1;
        if !state.exists(source) {
            return Err(StoreError::NotFound(source.clone()));
        }
        let mut pending = Vec::new();
        for (variant, ids) in targets {
            for id in ids {
                let target = StoreRef {
                    variant: *variant,
                    id: id.clone(),
                };
                if !state.exists(&target) {
                    return Err(StoreError::NotFound(target));
                }
                pending.push(link_key(source, &target));
            }
        }
        state.links.extend(pending);
        Ok(())
    }

    async fn relation_exists(&self, a: &StoreRef, b: &StoreRef) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.relation_checks += 1;
        Ok(state.links.contains(&link_key(a, b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdir_core::AttributeValue;

    fn group(id: &str) -> StoreEntity {
        let mut entity = StoreEntity::new(Variant::Group);
        entity.set(Attribute::GroupId, Some(AttributeValue::text(id)));
        entity
    }

    #[tokio::test]
    async fn create_rejects_oversized_batches() {
        let store = MemoryStore::with_limits(2, 10);
        let err = store
            .create_many(Variant::Group, &[group("a"), group("b"), group("c")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BatchTooLarge { size: 3, limit: 2 }));
        assert!(store.records(Variant::Group).await.is_empty());
    }

    #[tokio::test]
    async fn created_records_round_trip_by_id() {
        let store = MemoryStore::new();
        let ids = store
            .create_many(Variant::Group, &[group("a"), group("b")])
            .await
            .unwrap();
        let fetched = store.fetch_by_ids(Variant::Group, &ids).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[1].get(Attribute::GroupId), Some(&AttributeValue::text("b")));
        assert_eq!(fetched[1].id.as_ref(), Some(&ids[1]));
    }

    #[tokio::test]
    async fn filter_fetch_enforces_condition_ceiling() {
        let store = MemoryStore::with_limits(10, 1);
        store.seed(group("a")).await;
        let two = Predicate::or(vec![
            Predicate::equal(Attribute::GroupId, Some(AttributeValue::text("a"))),
            Predicate::equal(Attribute::GroupId, Some(AttributeValue::text("b"))),
        ]);
        assert!(matches!(
            store.fetch(Variant::Group, Some(&two)).await,
            Err(StoreError::TooManyConditions { count: 2, limit: 1 })
        ));
        let one = Predicate::equal(Attribute::GroupId, Some(AttributeValue::text("a")));
        assert_eq!(store.fetch(Variant::Group, Some(&one)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_fails_whole_batch_on_unknown_id() {
        let store = MemoryStore::new();
        let id = store.seed(group("a")).await;
        let mut known = StoreEntity::with_id(Variant::Group, id);
        known.set(Attribute::GroupName, Some(AttributeValue::text("Renamed")));
        let unknown = StoreEntity::with_id(Variant::Group, StoreId::new("missing"));

        assert!(store.update_many(Variant::Group, &[known.clone(), unknown]).await.is_err());
        assert!(store.records(Variant::Group).await[0].get(Attribute::GroupName).is_none());

        store.update_many(Variant::Group, &[known]).await.unwrap();
        let stored = &store.records(Variant::Group).await[0];
        assert_eq!(stored.get(Attribute::GroupName), Some(&AttributeValue::text("Renamed")));
        assert_eq!(stored.get(Attribute::GroupId), Some(&AttributeValue::text("a")));
    }

    #[tokio::test]
    async fn links_are_undirected() {
        let store = MemoryStore::new();
        let g = StoreRef {
            variant: Variant::Group,
            id: store.seed(group("a")).await,
        };
        let f = StoreRef {
            variant: Variant::Facility,
            id: store.seed(StoreEntity::new(Variant::Facility)).await,
        };
        let targets = BTreeMap::from([(Variant::Facility, vec![f.id.clone()])]);
        store.associate(&g, &targets).await.unwrap();
        assert!(store.relation_exists(&f, &g).await.unwrap());
        assert_eq!(store.links().await.len(), 1);
    }
}
