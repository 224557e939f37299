use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pdir_adapters::load_fixture_source;
use pdir_core::Variant;
use pdir_storage::MemoryStore;
use pdir_sync::{consolidate, LookupContext, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pdir-cli")]
#[command(about = "Provider directory sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Consolidate the source and synchronize it into the store
    Sync {
        /// Read records from a fixture file instead of the configured source
        #[arg(long)]
        fixture: Option<PathBuf>,

        /// Write to an in-memory store; implied by --fixture
        #[arg(long)]
        dry_run: bool,
    },
    /// Consolidate a fixture file and print the canonical counts
    Consolidate {
        #[arg(long)]
        fixture: PathBuf,
    },
}

fn print_summary(summary: &SyncRunSummary) {
    let c = &summary.counts;
    println!(
        "sync complete: run_id={} records={} pairs={} created={} updated={} links={} warnings={} reports={}",
        summary.run_id,
        c.records,
        c.pairs,
        c.created,
        c.updated,
        c.links_created,
        summary.warnings.len(),
        summary.reports_dir
    );
    if summary.has_failures() {
        eprintln!(
            "sync finished with failures: {} batches ({} records), {} link sets, {} links",
            c.failed_batches, c.failed_records, c.failed_link_sets, c.failed_links
        );
    }
}

async fn run(command: Commands) -> Result<bool> {
    match command {
        Commands::Sync { fixture, dry_run } => {
            let config = SyncConfig::from_env();
            let pipeline = match fixture {
                // fixture runs always land in an in-memory store
                Some(path) => {
                    let lookups = LookupContext::load(&config.lookups_path)?;
                    let source = load_fixture_source(&path)?;
                    SyncPipeline::new(config, lookups, Arc::new(source), Arc::new(MemoryStore::new()))
                }
                None if dry_run => bail!("--dry-run requires --fixture"),
                None => SyncPipeline::from_config(config)?,
            };
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
            Ok(!summary.has_failures())
        }
        Commands::Consolidate { fixture } => {
            let source = load_fixture_source(&fixture)?;
            let consolidation = consolidate(source.records())?;
            println!(
                "consolidated {} records: individuals={} facilities={} groups={} links={}",
                consolidation.records,
                consolidation.count(Variant::Individual),
                consolidation.count(Variant::Facility),
                consolidation.count(Variant::Group),
                consolidation.graph.link_count()
            );
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        fixture: None,
        dry_run: false,
    });

    if run(command).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
