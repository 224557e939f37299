use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pdir_adapters::{load_fixture_source, FixtureRecordSource};
use pdir_core::{
    Attribute, AttributeValue, CanonicalGraph, EntityKind, Group, Predicate, RawRecord, StoreEntity, StoreId,
    StoreRef, Variant,
};
use pdir_storage::{MemoryStore, StoreError, TargetStore};
use pdir_sync::{
    consolidate, fetch_store_snapshot, pair_entities, BatchSynchronizer, LookupContext, RelationshipSynchronizer,
    Stage, SyncConfig, SyncPipeline, SyncWarnings,
};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn sample_source() -> FixtureRecordSource {
    load_fixture_source(workspace_root().join("fixtures/records/sample_pages.json")).unwrap()
}

fn lookups() -> LookupContext {
    LookupContext::load(workspace_root().join("lookups.yaml")).unwrap()
}

fn pipeline(reports: &Path, store: Arc<dyn TargetStore>, page_size: u64) -> SyncPipeline {
    let mut config = SyncConfig::for_workspace(reports);
    config.page_size = page_size;
    SyncPipeline::new(config, lookups(), Arc::new(sample_source()), store)
}

/// Wraps a memory store and refuses selected calls; everything else is delegated.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    /// 1-based create call to refuse.
    fail_create: Option<usize>,
    /// 1-based update call to refuse.
    fail_update: Option<usize>,
    fail_refetch: bool,
    fail_relation_checks: bool,
    creates: AtomicUsize,
    updates: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    fn failing_create(inner: MemoryStore, call: usize) -> Self {
        Self {
            fail_create: Some(call),
            ..Self::new(inner)
        }
    }
}

#[async_trait]
impl TargetStore for FlakyStore {
    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    fn max_conditions(&self) -> usize {
        self.inner.max_conditions()
    }

    async fn fetch(&self, variant: Variant, filter: Option<&Predicate>) -> Result<Vec<StoreEntity>, StoreError> {
        self.inner.fetch(variant, filter).await
    }

    async fn fetch_by_ids(&self, variant: Variant, ids: &[StoreId]) -> Result<Vec<StoreEntity>, StoreError> {
        if self.fail_refetch {
            return Err(StoreError::Rejected("fetch by id refused".into()));
        }
        self.inner.fetch_by_ids(variant, ids).await
    }

    async fn create_many(&self, variant: Variant, entities: &[StoreEntity]) -> Result<Vec<StoreId>, StoreError> {
        let call = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_create == Some(call) {
            return Err(StoreError::Rejected(format!("create call {call} refused")));
        }
        self.inner.create_many(variant, entities).await
    }

    async fn update_many(&self, variant: Variant, entities: &[StoreEntity]) -> Result<(), StoreError> {
        let call = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_update == Some(call) {
            return Err(StoreError::Rejected(format!("update call {call} refused")));
        }
        self.inner.update_many(variant, entities).await
    }
    async fn associate(
        &self,
        source: &StoreRef,
        targets: &BTreeMap<Variant, Vec<StoreId>>,
    ) -> Result<(), StoreError> {
        self.inner.associate(source, targets).await
    }

    async fn relation_exists(&self, a: &StoreRef, b: &StoreRef) -> Result<bool, StoreError> {
        if self.fail_relation_checks {
            return Err(StoreError::Rejected(format!("relation check {a} -> {b} refused")));
        }
        self.inner.relation_exists(a, b).await
    }
}

fn groups(ids: &[&str]) -> CanonicalGraph {
    let mut graph = CanonicalGraph::new();
    for id in ids {
        graph.insert(EntityKind::Group(Group::from_record(&RawRecord {
            group_id: (*id).into(),
            ..Default::default()
        })));
    }
    graph
}

fn record(enrollment: &str, suppressed: &str, line2: &str, facility: &str, address_id: &str) -> RawRecord {
    RawRecord {
        enrollment_id: enrollment.into(),
        facility_name: facility.into(),
        address_id: address_id.into(),
        address_line1: "100 LAKE ST".into(),
        address_line2: line2.into(),
        line2_suppressed: suppressed.into(),
        city: "SEATTLE".into(),
        state: "WA".into(),
        ..Default::default()
    }
}

#[test]
fn three_records_yield_two_facilities_and_three_individuals() {
    let suppressed = record("I1", "Y", "", "LAKESIDE FAMILY PRACTICE", "A100");
    let fuller = record("I2", "N", "SUITE 200", "LAKESIDE FAMILY PRACTICE", "A100");
    let mut independent = record("I3", "N", "", "ELM DERMATOLOGY", "A300");
    independent.address_line1 = "9 ELM RD".into();

    let c = consolidate(&[suppressed, fuller.clone(), independent]).unwrap();
    assert_eq!(c.count(Variant::Individual), 3);
    assert_eq!(c.count(Variant::Facility), 2);
    assert_eq!(c.count(Variant::Group), 0);

    let shared = c
        .graph
        .of_variant(Variant::Facility)
        .filter_map(|e| e.as_facility())
        .find(|f| f.affiliated_count == 2)
        .expect("merged facility");
    assert_eq!(shared.address, pdir_core::Address::from_record(&fuller));
    assert!(!shared.address.line2_suppressed);
}

#[test]
fn consolidating_the_same_pages_is_reproducible() {
    let records = sample_source().records().to_vec();
    let first = consolidate(&records).unwrap();
    let second = consolidate(&records).unwrap();
    assert_eq!(first.graph, second.graph);
    assert_eq!(first.records, 6);
    assert_eq!(first.count(Variant::Individual), 5);
    assert_eq!(first.count(Variant::Group), 2);
    assert_eq!(first.count(Variant::Facility), 4);
    assert_eq!(first.graph.link_count(), 13);
}

#[test]
fn blank_line_one_evaluates_like_a_missing_one() {
    let mut graph = CanonicalGraph::new();
    let mut no_line1 = record("I1", "N", "", "CLINIC", "");
    no_line1.address_line1 = String::new();
    let facility = graph.insert(EntityKind::Facility(pdir_core::Facility::from_record(&no_line1)));
    let predicate = pdir_core::EqualityPredicate::for_entity(graph.entity(facility).unwrap());

    let mut blank = StoreEntity::with_id(Variant::Facility, StoreId::new("f1"));
    blank.set(Attribute::FacilityName, Some(AttributeValue::text("CLINIC")));
    blank.set(Attribute::Line2Suppressed, Some(AttributeValue::Flag(false)));
    let mut absent = blank.clone();
    blank.set(Attribute::AddressLine1, Some(AttributeValue::text("")));
    absent.set(Attribute::AddressLine1, None);

    assert_eq!(predicate.evaluate(&blank).unwrap(), predicate.evaluate(&absent).unwrap());
    assert!(predicate.evaluate(&absent).unwrap());
}

#[tokio::test]
async fn first_run_creates_everything_and_second_run_pairs_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());

    let first = pipeline(dir.path(), store.clone(), 4).run_once().await.unwrap();
    assert_eq!(first.counts.records, 6);
    assert_eq!(first.counts.pairs, 0);
    assert_eq!(first.counts.created, 11);
    assert_eq!(first.counts.links_created, 13);
    assert!(!first.has_failures());
    assert_eq!(first.warnings.in_stage(Stage::Batch).count(), 1);

    let lakeside = store
        .records(Variant::Facility)
        .await
        .into_iter()
        .find(|f| f.get(Attribute::FacilityName) == Some(&AttributeValue::text("LAKESIDE FAMILY PRACTICE")))
        .expect("lakeside facility");
    assert_eq!(lakeside.get(Attribute::AffiliatedCount), Some(&AttributeValue::Integer(2)));
    assert_eq!(lakeside.get(Attribute::AddressLine2), Some(&AttributeValue::text("SUITE 200")));
    assert_eq!(lakeside.get(Attribute::Phone), Some(&AttributeValue::text("2065550100")));

    let second = pipeline(dir.path(), store.clone(), 500).run_once().await.unwrap();
    assert_eq!(second.counts.pairs, 11);
    assert_eq!(second.counts.created, 0);
    assert_eq!(second.counts.updated, 11);
    assert_eq!(second.counts.duplicates, 0);
    assert_eq!(second.counts.unmatched_store, 0);
    assert_eq!(second.counts.links_existing, 13);
    assert_eq!(second.counts.links_created, 0);
    assert_eq!(store.records(Variant::Individual).await.len(), 5);

    let reports = PathBuf::from(&second.reports_dir);
    assert!(reports.join("sync_summary.json").exists());
    assert!(reports.join("sync_brief.md").exists());
}

#[tokio::test]
async fn created_records_round_trip_with_written_values() {
    let store = MemoryStore::new();
    let consolidation = consolidate(sample_source().records()).unwrap();
    let graph = &consolidation.graph;
    let ctx = lookups();
    let mut warnings = SyncWarnings::new();

    let outcome = pair_entities(graph, &BTreeMap::new()).unwrap();
    let (created, _) = BatchSynchronizer::new(&store, &ctx, 3)
        .synchronize(graph, outcome, &mut warnings)
        .await
        .unwrap();

    let snapshot = fetch_store_snapshot(&store, graph, 500).await.unwrap();
    let repaired = pair_entities(graph, &snapshot).unwrap();
    assert_eq!(repaired.pairs.len(), created.len());
    assert!(repaired.unmatched_canonical.is_empty());
    for pair in &repaired.pairs {
        let written = created
            .iter()
            .find(|p| p.canonical == pair.canonical)
            .expect("created pair");
        assert_eq!(pair.store, written.store);
    }
}

#[tokio::test]
async fn pairing_is_deterministic_for_a_fixed_snapshot() {
    let store = MemoryStore::new();
    for id in ["s1", "s2"] {
        let mut g = StoreEntity::with_id(Variant::Group, StoreId::new(id));
        g.set(Attribute::GroupId, Some(AttributeValue::text("7719000001")));
        store.seed(g).await;
    }
    let consolidation = consolidate(sample_source().records()).unwrap();
    let snapshot = fetch_store_snapshot(&store, &consolidation.graph, 500).await.unwrap();

    let a = pair_entities(&consolidation.graph, &snapshot).unwrap();
    let b = pair_entities(&consolidation.graph, &snapshot).unwrap();
    assert_eq!(a, b);
    let group_pair = a.pairs.iter().find(|p| p.variant() == Variant::Group).unwrap();
    assert_eq!(group_pair.store.id, Some(StoreId::new("s1")));
    assert_eq!(a.duplicates.len(), 1);
    assert_eq!(a.duplicates[0].store, Some(StoreId::new("s2")));
}

#[tokio::test]
async fn failed_create_batch_does_not_block_the_next_one() {
    let flaky = FlakyStore::failing_create(MemoryStore::with_limits(2, 100), 2);
    let graph = groups(&["G1", "G2", "G3", "G4", "G5"]);
    let ctx = LookupContext::default();
    let mut warnings = SyncWarnings::new();

    let outcome = pair_entities(&graph, &BTreeMap::new()).unwrap();
    let (pairs, report) = BatchSynchronizer::new(&flaky, &ctx, 100)
        .synchronize(&graph, outcome, &mut warnings)
        .await
        .unwrap();

    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.failed_records, 2);
    assert_eq!(report.created, 3);
    assert_eq!(pairs.len(), 3);
    assert_eq!(flaky.inner.records(Variant::Group).await.len(), 3);
    assert_eq!(flaky.inner.calls().await.creates, vec![2, 1]);
    assert_eq!(warnings.in_stage(Stage::Batch).count(), 1);
}

#[tokio::test]
async fn failed_update_batch_does_not_block_the_next_one() {
    let flaky = FlakyStore {
        fail_update: Some(1),
        ..FlakyStore::new(MemoryStore::with_limits(2, 100))
    };
    for id in ["G1", "G2", "G3", "G4", "G5"] {
        let mut g = StoreEntity::new(Variant::Group);
        g.set(Attribute::GroupId, Some(AttributeValue::text(id)));
        g.set(Attribute::GroupName, Some(AttributeValue::text("Stale")));
        flaky.inner.seed(g).await;
    }
    let graph = groups(&["G1", "G2", "G3", "G4", "G5"]);
    let snapshot = BTreeMap::from([(Variant::Group, flaky.inner.records(Variant::Group).await)]);
    let outcome = pair_entities(&graph, &snapshot).unwrap();
    let ctx = LookupContext::default();
    let mut warnings = SyncWarnings::new();

    let (pairs, report) = BatchSynchronizer::new(&flaky, &ctx, 100)
        .synchronize(&graph, outcome, &mut warnings)
        .await
        .unwrap();

    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.failed_records, 2);
    assert_eq!(report.updated, 3);
    assert_eq!(report.created, 0);
    // a rejected update keeps the pair; only the write is lost
    assert_eq!(pairs.len(), 5);
    assert_eq!(flaky.inner.calls().await.updates, vec![2, 1]);
    assert_eq!(warnings.in_stage(Stage::Batch).count(), 1);

    let stale = flaky
        .inner
        .records(Variant::Group)
        .await
        .into_iter()
        .filter(|g| g.get(Attribute::GroupName) == Some(&AttributeValue::text("Stale")))
        .count();
    assert_eq!(stale, 2);
}

#[tokio::test]
async fn failed_refetch_falls_back_to_the_written_stub() {
    let flaky = FlakyStore {
        fail_refetch: true,
        ..FlakyStore::new(MemoryStore::new())
    };
    let graph = groups(&["G1", "G2", "G3"]);
    let outcome = pair_entities(&graph, &BTreeMap::new()).unwrap();
    let ctx = LookupContext::default();
    let mut warnings = SyncWarnings::new();

    let (pairs, report) = BatchSynchronizer::new(&flaky, &ctx, 100)
        .synchronize(&graph, outcome, &mut warnings)
        .await
        .unwrap();

    assert_eq!(report.created, 3);
    assert_eq!(report.failed_batches, 0);
    assert_eq!(pairs.len(), 3);
    let stored = flaky.inner.records(Variant::Group).await;
    for pair in &pairs {
        let id = pair.store.id.clone().expect("new store id");
        let written = stored.iter().find(|r| r.id.as_ref() == Some(&id)).expect("written record");
        assert_eq!(pair.store.get(Attribute::GroupId), written.get(Attribute::GroupId));
    }
    let batch: Vec<_> = warnings.in_stage(Stage::Batch).collect();
    assert_eq!(batch.len(), 1);
    assert!(batch[0].message.contains("re-fetching 3 created"));
}

#[tokio::test]
async fn failed_relation_checks_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyStore {
        fail_relation_checks: true,
        ..FlakyStore::new(MemoryStore::new())
    });

    let summary = pipeline(dir.path(), flaky.clone(), 500).run_once().await.unwrap();
    assert_eq!(summary.counts.created, 11);
    assert_eq!(summary.counts.links_created, 0);
    assert_eq!(summary.counts.failed_links, 13);
    assert!(summary.has_failures());
    assert_eq!(summary.warnings.in_stage(Stage::Relationships).count(), 13);
    assert!(flaky.inner.links().await.is_empty());
}

#[tokio::test]
async fn pipeline_reports_failures_and_skips_links_to_uncreated_entities() {
    let dir = tempfile::tempdir().unwrap();
    // Individuals are created first, so call 1 is the individual batch.
    let flaky = Arc::new(FlakyStore::failing_create(MemoryStore::new(), 1));

    let summary = pipeline(dir.path(), flaky.clone(), 500).run_once().await.unwrap();
    assert!(summary.has_failures());
    assert_eq!(summary.counts.failed_batches, 1);
    assert_eq!(summary.counts.failed_records, 5);
    assert_eq!(summary.counts.created, 6);

    // Every edge touching an individual is skipped; only facility-group links remain.
    assert_eq!(summary.counts.links_skipped, 10);
    assert_eq!(summary.counts.links_created, 3);
    assert_eq!(summary.warnings.in_stage(Stage::Relationships).count(), 10);
    assert_eq!(flaky.inner.links().await.len(), 3);
}

#[tokio::test]
async fn relationship_sync_skips_unpaired_neighbours() {
    let store = MemoryStore::new();
    let consolidation = consolidate(sample_source().records()).unwrap();
    let graph = &consolidation.graph;
    let mut warnings = SyncWarnings::new();

    let outcome = pair_entities(graph, &BTreeMap::new()).unwrap();
    let ctx = lookups();
    let (pairs, _) = BatchSynchronizer::new(&store, &ctx, 100)
        .synchronize(graph, outcome, &mut warnings)
        .await
        .unwrap();
    let groups_only: Vec<_> = pairs.into_iter().filter(|p| p.variant() == Variant::Group).collect();

    let report = RelationshipSynchronizer::new(&store)
        .synchronize(graph, &groups_only, &mut warnings)
        .await
        .unwrap();
    assert_eq!(report.created, 0);
    // G1: 2 individuals + 1 facility; G2: 2 individuals + 2 facilities
    assert_eq!(report.skipped, 7);
}

#[tokio::test]
async fn page_cap_is_reported_once_as_a_source_warning() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SyncConfig::for_workspace(dir.path());
    config.page_size = 2;
    config.max_pages = 1;
    let pipeline = SyncPipeline::new(config, lookups(), Arc::new(sample_source()), Arc::new(MemoryStore::new()));

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.counts.records, 2);
    let source: Vec<_> = summary.warnings.in_stage(Stage::Source).collect();
    assert_eq!(source.len(), 1);
    assert!(source[0].message.contains("stopped after 1 pages"));
}
