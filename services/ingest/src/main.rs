//! Ingest CLI - loads one vendor workbook under an ingest profile
//!
//! Responsibilities:
//! - Load and validate the profile before touching the database
//! - Record the raw file, every sheet and its stored grid
//! - Dispatch, parse and write observations sheet by sheet
//! - Print the batch summary
//!
//! Re-running the same file is safe: stored fingerprints are never
//! overwritten, so a second run only reports duplicates.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::fs;

use ingest::config::Config;
use ingest::logging::init_logging;
use ingest::store::{MemoryStore, PgStore, Store};
use ingest::{run_batch, BatchOptions, BatchSummary, IngestProfile};

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Ingests a vendor spreadsheet into the observation store")]
struct Args {
    /// Workbook to ingest (.xlsx / .xls)
    #[arg(long)]
    file: PathBuf,

    /// Ingest profile (JSON)
    #[arg(long)]
    profile: PathBuf,

    /// Override the profile's source code
    #[arg(long)]
    source_code: Option<String>,

    /// Dry run - parse into an in-memory store, nothing is saved
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Apply database migrations before ingesting
    #[arg(long, default_value = "false")]
    migrate: bool,
}

fn print_summary(summary: &BatchSummary) {
    println!("\n=== Batch {} ===", summary.batch_id);
    println!("Status: {}", summary.status);
    println!(
        "Rows: {} total, {} ok ({} inserted, {} duplicates), {} failed",
        summary.total_rows, summary.success_rows, summary.inserted, summary.duplicates, summary.failed_rows
    );
    println!("Metrics: {}", summary.metric_count);
    if summary.indicator_points > 0 {
        println!("Indicator points: {}", summary.indicator_points);
    }
    println!("Errors logged: {}", summary.error_count);
    println!("Duration: {} ms", summary.duration_ms);
    println!("\nSheets:");
    for sheet in &summary.sheets {
        println!(
            "  {} | {} | {} | {} | inserted={} dup={} failed={}{}",
            sheet.sheet_name,
            sheet.action,
            sheet.parser.as_deref().unwrap_or("-"),
            sheet.status.as_str(),
            sheet.inserted,
            sheet.duplicates,
            sheet.failed_rows,
            sheet
                .error
                .as_ref()
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env();
    let _guard = init_logging(config.log_dir.as_deref());

    let profile = IngestProfile::load(&args.profile)
        .await
        .with_context(|| format!("Failed to load profile {}", args.profile.display()))?;
    let bytes = fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let filename = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("Input path has no file name")?;

    println!("=== Ingest ===");
    println!("File: {} ({} bytes)", filename, bytes.len());
    println!("Profile: {} v{}", profile.profile_code, profile.version);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let mut options = BatchOptions::from(&config);
    options.source_code = args.source_code.clone();

    let mut store: Box<dyn Store> = if args.dry_run {
        options.raw_fs_dir = None;
        Box::new(MemoryStore::new())
    } else {
        let db_url = config.require_db_url()?;
        let store = PgStore::connect(db_url, config.db_max_connections)
            .await
            .context("Failed to connect to database")?;
        if args.migrate {
            store.migrate().await.context("Failed to run migrations")?;
            println!("Migrations applied");
        }
        Box::new(store)
    };

    let summary = run_batch(store.as_mut(), &profile, &filename, &bytes, &options)
        .await
        .context("Batch aborted")?;
    print_summary(&summary);

    if args.dry_run {
        println!("\nDry run - nothing saved to database");
    }
    Ok(())
}
