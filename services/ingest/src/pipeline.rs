//! Batch orchestration: raw provenance, then dispatch, parse, validate and
//! write for every sheet, then the status rollup.
//!
//! Each parsed sheet runs in its own transaction. A sheet that fails is
//! rolled back and logged as a `sheet_error`; the batch carries on. Only an
//! unreadable workbook fails the whole file. Any other error that escapes
//! still closes the batch as `failed` before it is returned.
//!
//! Once the sheets are written, the profile's indicator rules run over the
//! batch's new observations in their own transaction.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec::SerializeOptions;
use crate::config::Config;
use crate::dispatcher::{dispatch, Dispatch};
use crate::error::{PipelineError, Result};
use crate::errors::{ErrorCollector, ErrorKind, IngestError};
use crate::indicators::extract_indicators;
use crate::parsers::{parse_sheet, ParseContext, ParserId, ParserSpec};
use crate::profile::{IngestProfile, SheetAction};
use crate::raw_writer::{write_raw_file, write_raw_sheet};
use crate::resolver::Resolver;
use crate::store::{BatchRecord, BatchStatus, SheetOutcome, SheetStatus, Store};
use crate::upserter::upsert_observations;
use crate::validator::validate;
use crate::workbook::load_workbook;
use crate::worksheet::Worksheet;

/// Knobs for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Overrides the profile's source code.
    pub source_code: Option<String>,
    /// Keep the uploaded bytes under this directory when set.
    pub raw_fs_dir: Option<PathBuf>,
    pub chunk_size: usize,
    pub error_flush_threshold: usize,
    pub serialize: SerializeOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BatchOptions {
    fn from(config: &Config) -> Self {
        Self {
            source_code: None,
            raw_fs_dir: Some(config.raw_fs_dir.clone()),
            chunk_size: config.upsert_chunk_size,
            error_flush_threshold: config.error_flush_threshold,
            serialize: SerializeOptions {
                max_bytes: config.raw_table_max_bytes,
                ..SerializeOptions::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetSummary {
    pub sheet_name: String,
    pub action: String,
    pub parser: Option<String>,
    pub status: SheetStatus,
    /// Rows the parser looked at: drafts plus rows it could not read.
    pub total_rows: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed_rows: usize,
    pub error: Option<String>,
}

impl SheetSummary {
    fn new(ws: &Worksheet, action: SheetAction, parser: Option<ParserId>, status: SheetStatus) -> Self {
        Self {
            sheet_name: ws.name.clone(),
            action: action.to_string(),
            parser: parser.map(|p| p.to_string()),
            status,
            total_rows: 0,
            inserted: 0,
            duplicates: 0,
            failed_rows: 0,
            error: None,
        }
    }

    pub fn success_rows(&self) -> usize {
        self.inserted + self.duplicates
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_rows: usize,
    pub success_rows: usize,
    pub failed_rows: usize,
    pub inserted: usize,
    /// Always zero; stored observations are never overwritten.
    pub updated: usize,
    pub duplicates: usize,
    pub metric_count: usize,
    /// Derived indicator points written or overwritten after the sheets.
    pub indicator_points: usize,
    pub error_count: usize,
    pub duration_ms: i64,
    pub sheets: Vec<SheetSummary>,
}

/// What a committed sheet produced, before its errors are recorded.
struct SheetWork {
    drafts: usize,
    /// Rows the parser reported instead of drafting.
    unreadable: usize,
    inserted: usize,
    duplicates: usize,
    failed_rows: usize,
    metric_ids: HashSet<Uuid>,
    errors: Vec<IngestError>,
}

/// Ingests one uploaded workbook under `profile`.
pub async fn run_batch(
    store: &mut dyn Store,
    profile: &IngestProfile,
    filename: &str,
    bytes: &[u8],
    options: &BatchOptions,
) -> Result<BatchSummary> {
    run_loaded(store, profile, filename, bytes, load_workbook(bytes), options).await
}

/// [`run_batch`] with the workbook already decoded (or failed to decode).
pub async fn run_loaded(
    store: &mut dyn Store,
    profile: &IngestProfile,
    filename: &str,
    bytes: &[u8],
    workbook: Result<Vec<Worksheet>>,
    options: &BatchOptions,
) -> Result<BatchSummary> {
    let started = Instant::now();
    let source_code = options
        .source_code
        .clone()
        .unwrap_or_else(|| profile.source_code.clone());

    let mut batch = BatchRecord {
        id: Uuid::new_v4(),
        source_code: source_code.clone(),
        profile_code: profile.profile_code.clone(),
        filename: filename.to_string(),
        status: BatchStatus::Processing,
        total_rows: 0,
        success_rows: 0,
        failed_rows: 0,
        inserted_count: 0,
        updated_count: 0,
        sheet_count: 0,
        metric_count: 0,
        duration_ms: 0,
        error_summary: None,
        started_at: Utc::now(),
        finished_at: None,
    };
    store.create_batch(&batch).await?;
    info!(
        batch_id = %batch.id,
        filename,
        profile = %profile.profile_code,
        version = %profile.version,
        source = %source_code,
        "batch started"
    );
    if !profile.matches_filename(filename) {
        warn!(filename, pattern = ?profile.file_pattern, "filename does not match the profile pattern");
    }

    let mut collector = ErrorCollector::new(batch.id, options.error_flush_threshold);
    let mut progress = Progress::default();
    let outcome = ingest(
        store,
        profile,
        filename,
        bytes,
        workbook,
        options,
        &source_code,
        batch.id,
        &mut collector,
        &mut progress,
    )
    .await;

    let (status, error_summary) = match outcome {
        Ok(closing) => closing,
        Err(e) => {
            abort(store, &mut batch, &mut collector, progress, started, &e).await;
            return Err(e);
        }
    };
    let summary = progress.rollup(batch.id, status, collector.recorded(), started);
    finish(store, &mut batch, &summary, error_summary).await?;

    info!(
        batch_id = %summary.batch_id,
        status = %summary.status,
        sheets = summary.sheets.len(),
        total = summary.total_rows,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        failed = summary.failed_rows,
        errors = summary.error_count,
        indicators = summary.indicator_points,
        duration_ms = summary.duration_ms,
        "batch finished"
    );
    Ok(summary)
}

/// Per-sheet results gathered so far; survives an aborted batch.
#[derive(Default)]
struct Progress {
    sheets: Vec<SheetSummary>,
    metric_ids: HashSet<Uuid>,
    indicator_points: usize,
}

impl Progress {
    fn rollup(self, batch_id: Uuid, status: BatchStatus, error_count: usize, started: Instant) -> BatchSummary {
        BatchSummary {
            batch_id,
            status,
            total_rows: self.sheets.iter().map(|s| s.total_rows).sum(),
            success_rows: self.sheets.iter().map(SheetSummary::success_rows).sum(),
            failed_rows: self.sheets.iter().map(|s| s.failed_rows).sum(),
            inserted: self.sheets.iter().map(|s| s.inserted).sum(),
            updated: 0,
            duplicates: self.sheets.iter().map(|s| s.duplicates).sum(),
            metric_count: self.metric_ids.len(),
            indicator_points: self.indicator_points,
            error_count,
            duration_ms: elapsed_ms(started),
            sheets: self.sheets,
        }
    }
}

/// Everything between batch creation and the final status write. Returns
/// the batch status and its error summary.
#[allow(clippy::too_many_arguments)]
async fn ingest(
    store: &mut dyn Store,
    profile: &IngestProfile,
    filename: &str,
    bytes: &[u8],
    workbook: Result<Vec<Worksheet>>,
    options: &BatchOptions,
    source_code: &str,
    batch_id: Uuid,
    collector: &mut ErrorCollector,
    progress: &mut Progress,
) -> Result<(BatchStatus, Option<String>)> {
    let raw_file = write_raw_file(store, batch_id, filename, bytes, options.raw_fs_dir.as_deref()).await?;

    let sheets = match workbook {
        Ok(sheets) => sheets,
        Err(e) if e.is_fatal_input() => {
            error!(batch_id = %batch_id, error = %e, "workbook unreadable, batch failed");
            collector
                .record_immediate(
                    store,
                    IngestError::new(ErrorKind::SheetError, e.to_string()).with_context(json!({"filename": filename})),
                )
                .await?;
            return Ok((BatchStatus::Failed, Some(format!("unreadable workbook: {}", e))));
        }
        Err(e) => return Err(e),
    };

    let mut resolver = Resolver::new(source_code);

    for (index, ws) in sheets.iter().enumerate() {
        let raw_sheet = write_raw_sheet(store, raw_file.id, index, ws, &options.serialize).await?;
        let decision = dispatch(profile, ws);

        let (summary, error_count) = match decision {
            Dispatch::SkipMeta => (SheetSummary::new(ws, SheetAction::SkipMeta, None, SheetStatus::Skipped), 0),
            Dispatch::RawTableStoreOnly => (
                SheetSummary::new(ws, SheetAction::RawTableStoreOnly, None, SheetStatus::RawOnly),
                0,
            ),
            Dispatch::Parse { spec, .. } => {
                let ctx = ParseContext {
                    sheet_name: &ws.name,
                    source_code,
                    defaults: &profile.defaults,
                };
                let before = collector.recorded();
                let summary = run_sheet(
                    store,
                    &mut resolver,
                    collector,
                    batch_id,
                    ws,
                    spec,
                    &ctx,
                    options.chunk_size,
                    &mut progress.metric_ids,
                )
                .await?;
                (summary, collector.recorded() - before)
            }
        };

        store
            .update_raw_sheet(
                raw_sheet.id,
                &SheetOutcome {
                    status: summary.status,
                    parser_type: summary.parser.clone(),
                    observation_count: to_i64(summary.inserted),
                    error_count: to_i64(error_count),
                },
            )
            .await?;
        progress.sheets.push(summary);
    }
    collector.flush(store).await?;

    let parsed_sheets = progress
        .sheets
        .iter()
        .filter(|s| s.action == SheetAction::Parse.as_str())
        .count();
    let failed_sheets = progress.sheets.iter().filter(|s| s.status == SheetStatus::Failed).count();
    let status = if parsed_sheets > 0 && failed_sheets == parsed_sheets {
        BatchStatus::Failed
    } else if collector.blocking() > 0 {
        BatchStatus::Partial
    } else {
        BatchStatus::Success
    };
    let error_summary = (collector.blocking() > 0).then(|| {
        format!(
            "{} errors, {} of {} parsed sheets failed",
            collector.blocking(),
            failed_sheets,
            parsed_sheets
        )
    });
    if status != BatchStatus::Failed {
        progress.indicator_points = derive_indicators(store, &mut resolver, profile, batch_id).await;
    }
    Ok((status, error_summary))
}

/// Applies the profile's indicator rules in a transaction of their own. A
/// failure is logged and rolled back; the batch status stands.
async fn derive_indicators(
    store: &mut dyn Store,
    resolver: &mut Resolver,
    profile: &IngestProfile,
    batch_id: Uuid,
) -> usize {
    if profile.indicator_rules.is_empty() {
        return 0;
    }
    if let Err(e) = store.begin().await {
        warn!(batch_id = %batch_id, error = %e, "indicator extraction skipped");
        return 0;
    }
    resolver.checkpoint();
    let outcome = match extract_indicators(store, resolver, &profile.indicator_rules, batch_id).await {
        Ok(outcome) => store.commit().await.map(|_| outcome),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(outcome) => {
            resolver.release_checkpoint();
            info!(
                batch_id = %batch_id,
                inserted = outcome.inserted,
                updated = outcome.updated,
                "indicators derived"
            );
            outcome.points()
        }
        Err(e) => {
            if let Err(rollback) = store.rollback().await {
                if !matches!(rollback, PipelineError::NoTransaction) {
                    warn!(batch_id = %batch_id, error = %rollback, "indicator rollback failed");
                }
            }
            resolver.rollback_to_checkpoint();
            warn!(batch_id = %batch_id, error = %e, "indicator extraction failed, batch status unaffected");
            0
        }
    }
}

/// Closes a batch that hit an unrecoverable error so it never stays
/// `processing`. Secondary store failures are logged and dropped; the
/// caller propagates the original error.
async fn abort(
    store: &mut dyn Store,
    batch: &mut BatchRecord,
    collector: &mut ErrorCollector,
    progress: Progress,
    started: Instant,
    cause: &PipelineError,
) {
    error!(batch_id = %batch.id, error = %cause, "batch aborted");
    if let Err(e) = store.rollback().await {
        if !matches!(e, PipelineError::NoTransaction) {
            warn!(batch_id = %batch.id, error = %e, "rollback after abort failed");
        }
    }
    let recorded = collector
        .record_immediate(
            store,
            IngestError::new(ErrorKind::SheetError, cause.to_string()).with_context(json!({"stage": "batch"})),
        )
        .await;
    if let Err(e) = recorded.and(collector.flush(store).await.map(|_| ())) {
        warn!(batch_id = %batch.id, error = %e, "could not record batch failure");
    }
    let summary = progress.rollup(batch.id, BatchStatus::Failed, collector.recorded(), started);
    if let Err(e) = finish(store, batch, &summary, Some(format!("batch aborted: {}", cause))).await {
        warn!(batch_id = %batch.id, error = %e, "could not mark batch failed");
    }
}

/// Runs one parse-dispatched sheet inside its own transaction. Only store
/// failures outside the transaction escape; everything else fails the sheet.
#[allow(clippy::too_many_arguments)]
async fn run_sheet(
    store: &mut dyn Store,
    resolver: &mut Resolver,
    collector: &mut ErrorCollector,
    batch_id: Uuid,
    ws: &Worksheet,
    spec: &ParserSpec,
    ctx: &ParseContext<'_>,
    chunk_size: usize,
    metric_ids: &mut HashSet<Uuid>,
) -> Result<SheetSummary> {
    let mut summary = SheetSummary::new(ws, SheetAction::Parse, Some(spec.id), SheetStatus::Parsed);

    store.begin().await?;
    resolver.checkpoint();
    let work = parse_and_write(store, resolver, batch_id, ws, spec, ctx, chunk_size).await;

    let work = match work {
        Ok(work) => store.commit().await.map(|_| work),
        Err(e) => Err(e),
    };

    match work {
        Ok(work) => {
            resolver.release_checkpoint();
            summary.total_rows = work.drafts + work.unreadable;
            summary.inserted = work.inserted;
            summary.duplicates = work.duplicates;
            summary.failed_rows = work.failed_rows;
            metric_ids.extend(work.metric_ids);
            collector.record_all(store, work.errors).await?;
        }
        Err(e) => {
            // commit failures leave the transaction open too
            if let Err(rollback) = store.rollback().await {
                if !matches!(rollback, PipelineError::NoTransaction) {
                    return Err(rollback);
                }
            }
            resolver.rollback_to_checkpoint();
            let cause = if e.is_config() { "configuration" } else { "processing" };
            error!(sheet = %ws.name, parser = %spec.id, cause, error = %e, "sheet failed, rolled back");
            collector
                .record_immediate(
                    store,
                    IngestError::new(ErrorKind::SheetError, e.to_string())
                        .in_sheet(&ws.name)
                        .with_context(json!({"parser": spec.id.as_str(), "cause": cause})),
                )
                .await?;
            summary.status = SheetStatus::Failed;
            summary.error = Some(e.to_string());
        }
    }
    Ok(summary)
}

async fn parse_and_write(
    store: &mut dyn Store,
    resolver: &mut Resolver,
    batch_id: Uuid,
    ws: &Worksheet,
    spec: &ParserSpec,
    ctx: &ParseContext<'_>,
    chunk_size: usize,
) -> Result<SheetWork> {
    let output = parse_sheet(spec, ws, ctx)?;
    let drafts = output.observations.len();
    let unreadable = output.issues.iter().filter(|e| !e.kind.is_advisory()).count();

    let validation = validate(output.observations);
    let upsert = upsert_observations(store, resolver, batch_id, &ws.name, &validation.accepted, chunk_size).await?;

    let failed_rows = unreadable + validation.rejected + upsert.errors.len();
    let mut errors = output.issues;
    errors.extend(validation.errors);
    errors.extend(upsert.errors);
    Ok(SheetWork {
        drafts,
        unreadable,
        inserted: upsert.inserted,
        duplicates: upsert.duplicates,
        failed_rows,
        metric_ids: upsert.metric_ids,
        errors,
    })
}

async fn finish(
    store: &mut dyn Store,
    batch: &mut BatchRecord,
    summary: &BatchSummary,
    error_summary: Option<String>,
) -> Result<()> {
    batch.status = summary.status;
    batch.total_rows = to_i64(summary.total_rows);
    batch.success_rows = to_i64(summary.success_rows);
    batch.failed_rows = to_i64(summary.failed_rows);
    batch.inserted_count = to_i64(summary.inserted);
    batch.updated_count = to_i64(summary.updated);
    batch.sheet_count = to_i64(summary.sheets.len());
    batch.metric_count = to_i64(summary.metric_count);
    batch.duration_ms = summary.duration_ms;
    batch.error_summary = error_summary;
    batch.finished_at = Some(Utc::now());
    store.finish_batch(batch).await
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
