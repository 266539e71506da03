//! Insert-first observation persistence.
//!
//! A fingerprint that is already stored wins: the incoming draft is
//! skipped, never merged into the existing row. Drafts are written in
//! chunks, each under its own savepoint; when a chunk fails for any other
//! reason it is replayed one row at a time so a single bad record only
//! costs itself.

use std::collections::HashSet;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::errors::{ErrorKind, IngestError};
use crate::observation::DraftObservation;
use crate::resolver::Resolver;
use crate::store::{NewObservation, Store};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpsertResult {
    pub inserted: usize,
    /// Always zero: existing observations are never updated.
    pub updated: usize,
    pub duplicates: usize,
    pub errors: Vec<IngestError>,
    pub metric_ids: HashSet<Uuid>,
    pub fallback_chunks: usize,
}

impl UpsertResult {
    fn absorb(&mut self, other: UpsertResult) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.errors.extend(other.errors);
        self.metric_ids.extend(other.metric_ids);
    }
}

enum RowOutcome {
    Inserted(Uuid),
    Duplicate(Uuid),
}

/// Writes `drafts` for one sheet inside the caller's open transaction.
pub async fn upsert_observations(
    store: &mut dyn Store,
    resolver: &mut Resolver,
    batch_id: Uuid,
    sheet_name: &str,
    drafts: &[DraftObservation],
    chunk_size: usize,
) -> Result<UpsertResult> {
    let mut result = UpsertResult::default();

    for (index, chunk) in drafts.chunks(chunk_size.max(1)).enumerate() {
        let savepoint = format!("chunk_{}", index);
        store.savepoint(&savepoint).await?;
        resolver.checkpoint();

        match write_chunk(store, resolver, batch_id, chunk).await {
            Ok(chunk_result) => {
                store.release_savepoint(&savepoint).await?;
                resolver.release_checkpoint();
                result.absorb(chunk_result);
            }
            Err(e) => {
                store.rollback_to_savepoint(&savepoint).await?;
                store.release_savepoint(&savepoint).await?;
                resolver.rollback_to_checkpoint();
                warn!(
                    sheet = sheet_name,
                    chunk = index,
                    rows = chunk.len(),
                    error = %e,
                    "chunk insert failed, retrying row by row"
                );
                result.fallback_chunks += 1;
                let row_result = write_rows(store, resolver, batch_id, chunk).await?;
                result.absorb(row_result);
            }
        }
    }

    debug!(
        sheet = sheet_name,
        inserted = result.inserted,
        duplicates = result.duplicates,
        failed = result.errors.len(),
        "sheet observations written"
    );
    Ok(result)
}

async fn write_chunk(
    store: &mut dyn Store,
    resolver: &mut Resolver,
    batch_id: Uuid,
    chunk: &[DraftObservation],
) -> Result<UpsertResult> {
    let mut result = UpsertResult::default();
    for draft in chunk {
        match write_one(store, resolver, batch_id, draft).await? {
            RowOutcome::Inserted(metric_id) => {
                result.inserted += 1;
                result.metric_ids.insert(metric_id);
            }
            RowOutcome::Duplicate(metric_id) => {
                result.duplicates += 1;
                result.metric_ids.insert(metric_id);
            }
        }
    }
    Ok(result)
}

async fn write_rows(
    store: &mut dyn Store,
    resolver: &mut Resolver,
    batch_id: Uuid,
    chunk: &[DraftObservation],
) -> Result<UpsertResult> {
    let mut result = UpsertResult::default();
    for draft in chunk {
        store.savepoint("row").await?;
        resolver.checkpoint();
        match write_one(store, resolver, batch_id, draft).await {
            Ok(outcome) => {
                store.release_savepoint("row").await?;
                resolver.release_checkpoint();
                match outcome {
                    RowOutcome::Inserted(metric_id) => {
                        result.inserted += 1;
                        result.metric_ids.insert(metric_id);
                    }
                    RowOutcome::Duplicate(metric_id) => {
                        result.duplicates += 1;
                        result.metric_ids.insert(metric_id);
                    }
                }
            }
            Err(e) => {
                store.rollback_to_savepoint("row").await?;
                store.release_savepoint("row").await?;
                resolver.rollback_to_checkpoint();
                result.errors.push(
                    IngestError::new(ErrorKind::InvalidValue, format!("failed to persist row: {}", e))
                        .at(&draft.location)
                        .with_raw_value(draft.raw_value.clone().unwrap_or_default()),
                );
            }
        }
    }
    Ok(result)
}

async fn write_one(
    store: &mut dyn Store,
    resolver: &mut Resolver,
    batch_id: Uuid,
    draft: &DraftObservation,
) -> Result<RowOutcome> {
    let metric = resolver
        .get_or_create_metric(store, &draft.metric, &draft.sheet_name)
        .await?;
    // the pre-check saves a round trip; the unique index decides
    if store.observation_exists(&draft.dedup_key).await? {
        return Ok(RowOutcome::Duplicate(metric.id));
    }
    let geo_id = resolver.get_or_create_geo(store, draft.geo_code.as_deref()).await?;
    let new = NewObservation {
        batch_id,
        metric_id: metric.id,
        geo_id,
        period_type: draft.period.period_type,
        obs_date: draft.period.obs_date,
        period_start: draft.period.start,
        period_end: draft.period.end,
        value: draft.value,
        raw_value: draft.raw_value.clone(),
        dedup_key: draft.dedup_key.clone(),
        source_code: draft.source_code.clone(),
        sheet_name: draft.sheet_name.clone(),
        location: draft.location.to_string(),
        tags: draft.tags.clone(),
    };
    match store.insert_observation(&new).await? {
        Some(_) => Ok(RowOutcome::Inserted(metric.id)),
        None => Ok(RowOutcome::Duplicate(metric.id)),
    }
}
