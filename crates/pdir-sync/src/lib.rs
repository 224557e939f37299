//! Sync pipeline: consolidate source records, pair them with the store, push
//! attribute batches, then mirror the association graph as store links.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use pdir_adapters::{drain_source, AdapterError, HttpRecordSource, PageCursor, RecordSource, StopReason};
use pdir_core::Variant;
use pdir_storage::{HttpClientConfig, HttpFetcher, HttpStore, HttpStoreConfig, TargetStore};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod batch;
pub mod config;
pub mod consolidate;
pub mod lookup;
pub mod pairing;
pub mod relationships;
pub mod report;

pub use batch::{BatchReport, BatchSynchronizer};
pub use config::SyncConfig;
pub use consolidate::{consolidate, Consolidation, ConsolidationError, Consolidator};
pub use lookup::LookupContext;
pub use pairing::{fetch_store_snapshot, pair_entities, DuplicateKind, DuplicateMatch, Pair, PairingOutcome};
pub use relationships::{RelationshipReport, RelationshipSynchronizer};
pub use report::{write_reports, Stage, SyncCounts, SyncRunSummary, SyncWarning, SyncWarnings};

pub const CRATE_NAME: &str = "pdir-sync";

pub struct SyncPipeline {
    config: SyncConfig,
    lookups: LookupContext,
    source: Arc<dyn RecordSource>,
    store: Arc<dyn TargetStore>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        lookups: LookupContext,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn TargetStore>,
    ) -> Self {
        Self {
            config,
            lookups,
            source,
            store,
        }
    }

    /// HTTP source and HTTP store as configured; both URLs are required.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let source_url = config.source_url.clone().context("PDIR_SOURCE_URL is not set")?;
        let Some(store_url) = config.store_url.clone() else {
            bail!("PDIR_STORE_URL is not set");
        };
        let lookups = LookupContext::load(&config.lookups_path)?;

        let http_config = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };
        let source = HttpRecordSource::new(HttpFetcher::new(http_config.clone())?, source_url);
        let store_http = HttpFetcher::new(HttpClientConfig {
            bearer_token: config.store_token.clone(),
            ..http_config
        })?;
        let store = HttpStore::new(
            store_http,
            HttpStoreConfig {
                base_url: store_url,
                max_batch: config.batch_size,
                max_conditions: config.max_conditions,
            },
        );
        Ok(Self::new(config, lookups, Arc::new(source), Arc::new(store)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Drain the source into a finished consolidation.
    pub async fn consolidate(&self, warnings: &mut SyncWarnings) -> Result<Consolidation> {
        let mut consolidator = Consolidator::new();
        let mut cursor = PageCursor::new(self.config.page_size, self.config.max_pages);
        drain_source(self.source.as_ref(), &mut cursor, |page| {
            consolidator
                .ingest(&page)
                .map_err(|e| AdapterError::Anyhow(e.into()))
        })
        .await
        .with_context(|| format!("draining source {}", self.source.source_id()))?;

        match cursor.stop_reason() {
            Some(StopReason::PageLimit) => warnings.record(
                Stage::Source,
                format!(
                    "stopped after {} pages with {} records; the source may hold more",
                    cursor.pages_fetched(),
                    cursor.records_seen()
                ),
            ),
            Some(StopReason::EmptyPage) => {
                if let Some(total) = cursor.advertised_total().filter(|t| cursor.records_seen() < *t) {
                    warnings.record(
                        Stage::Source,
                        format!("source advertised {total} records but returned {}", cursor.records_seen()),
                    );
                }
            }
            _ => {}
        }

        let consolidation = consolidator.finish();
        info!(
            records = consolidation.records,
            individuals = consolidation.count(Variant::Individual),
            facilities = consolidation.count(Variant::Facility),
            groups = consolidation.count(Variant::Group),
            links = consolidation.graph.link_count(),
            "consolidation complete"
        );
        Ok(consolidation)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let mut warnings = SyncWarnings::new();
        let store = self.store.as_ref();

        let consolidation = self.consolidate(&mut warnings).await?;
        let graph = &consolidation.graph;

        let snapshot = fetch_store_snapshot(store, graph, self.config.max_conditions)
            .await
            .context("fetching store snapshot")?;
        let store_records = snapshot.values().map(Vec::len).sum();

        let outcome = pair_entities(graph, &snapshot).context("pairing canonical entities")?;
        for duplicate in &outcome.duplicates {
            let label = graph.entity(duplicate.canonical)?.kind.label();
            let store_id = duplicate
                .store
                .as_ref()
                .map_or_else(|| "?".to_string(), ToString::to_string);
            let message = match duplicate.kind {
                DuplicateKind::StoreMatchedSeveral => {
                    format!("{label}: store record {store_id} already paired with an earlier entity")
                }
                DuplicateKind::CanonicalMatchedTwice => {
                    format!("{label}: store record {store_id} duplicates an existing pair")
                }
            };
            warnings.record(Stage::Pairing, message);
        }
        for record in &outcome.unmatched_store {
            let id = record.id.as_ref().map_or_else(|| "?".to_string(), ToString::to_string);
            warnings.record(
                Stage::Pairing,
                format!("store {} {id} has no canonical counterpart", record.variant),
            );
        }

        let mut counts = SyncCounts {
            records: consolidation.records,
            individuals: consolidation.count(Variant::Individual),
            facilities: consolidation.count(Variant::Facility),
            groups: consolidation.count(Variant::Group),
            links: graph.link_count(),
            store_records,
            pairs: outcome.pairs.len(),
            duplicates: outcome.duplicates.len(),
            unmatched_canonical: outcome.unmatched_canonical.len(),
            unmatched_store: outcome.unmatched_store.len(),
            ..Default::default()
        };

        let (pairs, batch) = BatchSynchronizer::new(store, &self.lookups, self.config.batch_size)
            .synchronize(graph, outcome, &mut warnings)
            .await?;
        counts.updated = batch.updated;
        counts.created = batch.created;
        counts.failed_batches = batch.failed_batches;
        counts.failed_records = batch.failed_records;

        let links = RelationshipSynchronizer::new(store)
            .synchronize(graph, &pairs, &mut warnings)
            .await?;
        counts.links_existing = links.existing;
        counts.links_created = links.created;
        counts.links_skipped = links.skipped;
        counts.failed_link_sets = links.failed_link_sets;
        counts.failed_links = links.failed_links;

        let mut summary = SyncRunSummary {
            run_id,
            source_id: self.source.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            consolidated_at: consolidation.last_updated,
            counts,
            warnings,
            reports_dir: String::new(),
        };
        write_reports(&self.config.reports_root(), &mut summary).await?;
        info!(
            pairs = summary.counts.pairs,
            created = summary.counts.created,
            updated = summary.counts.updated,
            links = summary.counts.links_created,
            warnings = summary.warnings.len(),
            reports = %summary.reports_dir,
            "sync run complete"
        );
        Ok(summary)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env())?;
    pipeline.run_once().await
}
