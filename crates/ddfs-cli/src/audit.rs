//! `ddfs check` / `ddfs repair`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use ddfs_audit::{AuditMode, AuditStats, Auditor};
use ddfs_cas::{CasStore, ChunkStore, ClusterStore};
use ddfs_config::{log_cli_debug, DedupConfig};

use crate::progress::ProgressSink;

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Block-map root (overrides volume.dedup_db_store)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Print the run's events as JSON when done
    #[arg(long)]
    pub events: bool,

    /// Hide the progress bar
    #[arg(short, long)]
    pub quiet: bool,
}

/// Chunk store described by the volume config
fn open_store(config: &DedupConfig) -> Result<Arc<dyn ChunkStore>> {
    let volume = &config.volume;
    let store: Arc<dyn ChunkStore> = if volume.storage_nodes > 1 {
        Arc::new(
            ClusterStore::new(
                &volume.chunk_store,
                volume.storage_nodes,
                volume.cluster_copies,
                volume.cluster_member_id,
            )
            .with_context(|| format!("Failed to open cluster store at {}", volume.chunk_store.display()))?,
        )
    } else {
        Arc::new(
            CasStore::new(&volume.chunk_store)
                .with_context(|| format!("Failed to open chunk store at {}", volume.chunk_store.display()))?
                .with_member_id(volume.cluster_member_id),
        )
    };
    log_cli_debug!("Chunk store opened", store = store.name(), nodes = store.storage_node_count());
    Ok(store)
}

pub fn run(mode: AuditMode, mut config: DedupConfig, args: AuditArgs) -> Result<()> {
    if let Some(root) = args.root {
        config.volume.dedup_db_store = root;
    }

    let title = match mode {
        AuditMode::VerifyOnly => "ddfs Consistency Check",
        AuditMode::Repair => "ddfs Cluster Redundancy Check",
    };
    println!();
    println!("  {}", title);
    println!("  {}", "=".repeat(title.len()));
    println!("  Block maps:  {}", config.volume.dedup_db_store.display());
    println!("  Chunk store: {}", config.volume.chunk_store.display());
    println!();

    let store = open_store(&config)?;
    let auditor = Auditor::new(store, &config);
    let mut sink = ProgressSink::new(args.quiet);
    let outcome = auditor.run(mode, &mut sink);

    if args.events {
        let json = sink.log().to_json().context("Failed to render events")?;
        println!("{}", json);
    }

    let stats = outcome.with_context(|| format!("{} failed", mode.event_type().to_lowercase()))?;
    print_stats(mode, &stats);
    Ok(())
}

fn print_stats(mode: AuditMode, stats: &AuditStats) {
    let mark = if stats.corrupt_files == 0 && stats.failed_redundant_blocks == 0 && stats.failed_files == 0 {
        style("✓").green()
    } else {
        style("✗").red()
    };

    println!("  {} {}", mark, stats.summary());
    println!();
    println!("  Files scanned:     {}", stats.files_scanned);
    println!("  Bytes scanned:     {}", stats.bytes_scanned);
    println!("  Corrupt files:     {}", stats.corrupt_files);
    println!("  Missing blocks:    {}", stats.corrupt_blocks);
    if stats.failed_files > 0 {
        println!("  Unreadable maps:   {}", stats.failed_files);
    }
    if mode == AuditMode::Repair {
        println!("  Made redundant:    {}", stats.new_redundant_blocks);
        println!("  Failed redundant:  {}", stats.failed_redundant_blocks);
        println!("  Descriptors fixed: {}", stats.rewritten_descriptors);
    }
    println!();
}
