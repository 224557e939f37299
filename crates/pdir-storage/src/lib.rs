//! Target-store boundary: the `TargetStore` contract plus in-memory and HTTP implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pdir_core::{Predicate, PredicateError, StoreEntity, StoreId, StoreRef, Variant};
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod remote;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, RetryDisposition};
pub use memory::MemoryStore;
pub use remote::{HttpStore, HttpStoreConfig};

pub const CRATE_NAME: &str = "pdir-storage";

/// Upper bound on records per create/update call when the store does not say otherwise.
pub const DEFAULT_MAX_BATCH: usize = 1000;
/// Upper bound on leaf conditions per filter query.
pub const DEFAULT_MAX_CONDITIONS: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch of {size} records exceeds the store limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("query carries {count} conditions; the store accepts at most {limit}")]
    TooManyConditions { count: usize, limit: usize },
    #[error("{0} not found")]
    NotFound(StoreRef),
    #[error("{0} record has no store identifier")]
    MissingId(Variant),
    #[error("create returned {returned} identifiers for {sent} records")]
    IdCountMismatch { sent: usize, returned: usize },
    #[error(transparent)]
    Predicate(#[from] PredicateError),
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("decoding store response: {0}")]
    Decode(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
}

/// Remote structured store the engines synchronize into.
///
/// Calls are issued sequentially by the engines. Create and update calls must
/// not exceed [`TargetStore::max_batch_size`]; callers chunk.
#[async_trait]
pub trait TargetStore: Send + Sync {
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH
    }

    fn max_conditions(&self) -> usize {
        DEFAULT_MAX_CONDITIONS
    }

    /// All records of `variant` matching `filter` (all records when `None`).
    async fn fetch(
        &self,
        variant: Variant,
        filter: Option<&Predicate>,
    ) -> Result<Vec<StoreEntity>, StoreError>;

    async fn fetch_by_ids(
        &self,
        variant: Variant,
        ids: &[StoreId],
    ) -> Result<Vec<StoreEntity>, StoreError>;

    /// Returns the new identifiers in input order.
    async fn create_many(
        &self,
        variant: Variant,
        entities: &[StoreEntity],
    ) -> Result<Vec<StoreId>, StoreError>;

    async fn update_many(&self, variant: Variant, entities: &[StoreEntity]) -> Result<(), StoreError>;

    async fn associate(
        &self,
        source: &StoreRef,
        targets: &BTreeMap<Variant, Vec<StoreId>>,
    ) -> Result<(), StoreError>;

    async fn relation_exists(&self, a: &StoreRef, b: &StoreRef) -> Result<bool, StoreError>;
}

pub(crate) fn check_batch(size: usize, limit: usize) -> Result<(), StoreError> {
    if size > limit {
        return Err(StoreError::BatchTooLarge { size, limit });
    }
    Ok(())
}

pub(crate) fn check_conditions(filter: Option<&Predicate>, limit: usize) -> Result<(), StoreError> {
    let count = filter.map(Predicate::condition_count).unwrap_or(0);
    if count > limit {
        return Err(StoreError::TooManyConditions { count, limit });
    }
    Ok(())
}
