//! Soft-failure bookkeeping and the per-run report files.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Source,
    Pairing,
    Batch,
    Relationships,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Pairing => "pairing",
            Stage::Batch => "batch",
            Stage::Relationships => "relationships",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWarning {
    pub stage: Stage,
    pub message: String,
}

/// Warnings collected over one run. Each one is also logged when recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncWarnings {
    entries: Vec<SyncWarning>,
}

impl SyncWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        warn!(%stage, "{message}");
        self.entries.push(SyncWarning { stage, message });
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncWarning> {
        self.entries.iter()
    }

    pub fn in_stage(&self, stage: Stage) -> impl Iterator<Item = &SyncWarning> {
        self.entries.iter().filter(move |w| w.stage == stage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub records: u64,
    pub individuals: usize,
    pub facilities: usize,
    pub groups: usize,
    pub links: usize,
    pub store_records: usize,
    pub pairs: usize,
    pub duplicates: usize,
    pub unmatched_canonical: usize,
    pub unmatched_store: usize,
    pub updated: usize,
    pub created: usize,
    pub failed_batches: usize,
    pub failed_records: usize,
    pub links_existing: usize,
    pub links_created: usize,
    pub links_skipped: usize,
    pub failed_link_sets: usize,
    /// Links that were never written, either because the existence check
    /// failed or because their associate call was rejected.
    pub failed_links: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub consolidated_at: Option<DateTime<Utc>>,
    pub counts: SyncCounts,
    pub warnings: SyncWarnings,
    pub reports_dir: String,
}

impl SyncRunSummary {
    /// Remote calls that were attempted and rejected.
    pub fn has_failures(&self) -> bool {
        let c = &self.counts;
        c.failed_batches > 0 || c.failed_link_sets > 0 || c.failed_links > 0
    }
}

fn render_brief(summary: &SyncRunSummary) -> String {
    let c = &summary.counts;
    let mut lines = vec![
        "# Provider Directory Sync".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Source: {}", summary.source_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: {}", if summary.has_failures() { "completed with failures" } else { "completed" }),
        String::new(),
        "## Consolidation".to_string(),
        format!("- Records: {}", c.records),
        format!("- Individuals: {}", c.individuals),
        format!("- Facilities: {}", c.facilities),
        format!("- Groups: {}", c.groups),
        format!("- Links: {}", c.links),
        String::new(),
        "## Store".to_string(),
        format!("- Store records matched by query: {}", c.store_records),
        format!("- Pairs: {}", c.pairs),
        format!("- Duplicates: {}", c.duplicates),
        format!("- Unmatched canonical: {}", c.unmatched_canonical),
        format!("- Unmatched store: {}", c.unmatched_store),
        format!("- Updated: {}", c.updated),
        format!("- Created: {}", c.created),
        format!("- Failed batches: {} ({} records)", c.failed_batches, c.failed_records),
        format!("- Links already present: {}", c.links_existing),
        format!("- Links created: {}", c.links_created),
        format!("- Links skipped: {}", c.links_skipped),
        format!("- Failed link sets: {} ({} links)", c.failed_link_sets, c.failed_links),
        String::new(),
        format!("## Warnings ({})", summary.warnings.len()),
    ];
    lines.extend(
        summary
            .warnings
            .iter()
            .map(|w| format!("- [{}] {}", w.stage, w.message)),
    );
    lines.push(String::new());
    lines.join("\n")
}

/// Write `sync_brief.md` and `sync_summary.json` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &mut SyncRunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    summary.reports_dir = reports_dir.display().to_string();

    fs::write(reports_dir.join("sync_brief.md"), render_brief(summary))
        .await
        .context("writing sync_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(reports_dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;

    Ok(reports_dir)
}
