//! Persistence seam for the pipeline.
//!
//! Batch-level rows (batch, raw file/sheet/table, ingest errors) are written
//! immediately. Dimension and fact rows go through the open sheet
//! transaction, which can be split into savepoints. Both implementations
//! enforce fingerprint uniqueness and `(raw_header, sheet_name)` metric
//! uniqueness themselves; callers treat a conflict as "someone else won".

pub mod memory;
pub mod postgres;
#[cfg(test)]
pub(crate) mod racing;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::errors::IngestError;
use crate::observation::{PeriodType, Tags};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Success,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Success => "success",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(BatchStatus::Processing),
            "success" => Some(BatchStatus::Success),
            "partial" => Some(BatchStatus::Partial),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetStatus {
    Pending,
    Parsed,
    Failed,
    Skipped,
    RawOnly,
}

impl SheetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SheetStatus::Pending => "pending",
            SheetStatus::Parsed => "parsed",
            SheetStatus::Failed => "failed",
            SheetStatus::Skipped => "skipped",
            SheetStatus::RawOnly => "raw_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SheetStatus::Pending),
            "parsed" => Some(SheetStatus::Parsed),
            "failed" => Some(SheetStatus::Failed),
            "skipped" => Some(SheetStatus::Skipped),
            "raw_only" => Some(SheetStatus::RawOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRecord {
    pub id: Uuid,
    pub source_code: String,
    pub profile_code: String,
    pub filename: String,
    pub status: BatchStatus,
    pub total_rows: i64,
    pub success_rows: i64,
    pub failed_rows: i64,
    pub inserted_count: i64,
    pub updated_count: i64,
    pub sheet_count: i64,
    pub metric_count: i64,
    pub duration_ms: i64,
    pub error_summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawFileRecord {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub filename: String,
    pub file_hash: String,
    pub file_size: i64,
    pub storage_path: Option<String>,
    pub report_date_start: Option<NaiveDate>,
    pub report_date_end: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSheetRecord {
    pub id: Uuid,
    pub raw_file_id: Uuid,
    pub sheet_name: String,
    pub sheet_index: i32,
    pub row_count: i32,
    pub col_count: i32,
    pub header_signature: String,
    pub parse_status: SheetStatus,
    pub parser_type: Option<String>,
    pub observation_count: i64,
    pub error_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawTableRecord {
    pub id: Uuid,
    pub raw_sheet_id: Uuid,
    /// Serialized grid, `None` when the sheet was too large to store.
    pub table_json: Option<serde_json::Value>,
    pub merged_cells_json: serde_json::Value,
    pub row_count: i32,
    pub col_count: i32,
    pub stored_rows: i32,
    pub truncated: bool,
    pub skipped: bool,
}

/// Final sheet outcome written back onto its raw sheet row.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetOutcome {
    pub status: SheetStatus,
    pub parser_type: Option<String>,
    pub observation_count: i64,
    pub error_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub id: Uuid,
    pub metric_key: String,
    pub metric_name: String,
    pub raw_header: String,
    pub sheet_name: String,
    pub source_code: String,
    pub metric_group: String,
    pub unit: Option<String>,
    pub freq: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMetric {
    pub metric_key: String,
    pub metric_name: String,
    pub raw_header: String,
    pub sheet_name: String,
    pub source_code: String,
    pub metric_group: String,
    pub unit: Option<String>,
    pub freq: Option<String>,
}

impl NewMetric {
    pub fn into_record(self, id: Uuid) -> MetricRecord {
        MetricRecord {
            id,
            metric_key: self.metric_key,
            metric_name: self.metric_name,
            raw_header: self.raw_header,
            sheet_name: self.sheet_name,
            source_code: self.source_code,
            metric_group: self.metric_group,
            unit: self.unit,
            freq: self.freq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoRecord {
    pub id: Uuid,
    pub province: String,
    pub region_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRecord {
    pub id: Uuid,
    pub region_code: String,
    pub region_name: String,
    pub level: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub batch_id: Uuid,
    pub metric_id: Uuid,
    pub geo_id: Option<Uuid>,
    pub period_type: PeriodType,
    pub obs_date: Option<NaiveDate>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub value: f64,
    pub raw_value: Option<String>,
    pub dedup_key: String,
    pub source_code: String,
    pub sheet_name: String,
    pub location: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationRecord {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub metric_id: Uuid,
    pub metric_key: String,
    pub geo_id: Option<Uuid>,
    pub geo_code: Option<String>,
    pub period_type: PeriodType,
    pub obs_date: Option<NaiveDate>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub value: f64,
    pub raw_value: Option<String>,
    pub dedup_key: String,
    pub location: String,
    pub tags: Tags,
}

impl ObservationRecord {
    /// Date the observation is filed under: period end, else observation date.
    pub fn key_date(&self) -> Option<NaiveDate> {
        self.period_end.or(self.obs_date)
    }
}

/// Derived indicator definition (`dim_indicator`), unique by code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorRecord {
    pub id: Uuid,
    pub indicator_code: String,
    pub indicator_name: String,
    /// `D` or `W`.
    pub freq: String,
    pub unit: Option<String>,
    pub topic: Option<String>,
    pub source_code: Option<String>,
    /// `RAW` or `DERIVED`.
    pub calc_method: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIndicator {
    pub indicator_code: String,
    pub indicator_name: String,
    pub freq: String,
    pub unit: Option<String>,
    pub topic: Option<String>,
    pub source_code: Option<String>,
    pub calc_method: String,
    pub description: Option<String>,
}

impl NewIndicator {
    pub fn into_record(self, id: Uuid) -> IndicatorRecord {
        IndicatorRecord {
            id,
            indicator_code: self.indicator_code,
            indicator_name: self.indicator_name,
            freq: self.freq,
            unit: self.unit,
            topic: self.topic,
            source_code: self.source_code,
            calc_method: self.calc_method,
            description: self.description,
        }
    }
}

/// One `fact_indicator_ts` value. Daily points carry `trade_date`, weekly
/// points `week_end` (and `week_start`). Unique by code, region, freq and
/// that date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorPoint {
    pub indicator_code: String,
    pub region_code: String,
    pub freq: String,
    pub trade_date: Option<NaiveDate>,
    pub week_start: Option<NaiveDate>,
    pub week_end: Option<NaiveDate>,
    pub value: f64,
    pub source_code: Option<String>,
    pub batch_id: Uuid,
}

impl IndicatorPoint {
    pub fn key_date(&self) -> Option<NaiveDate> {
        self.week_end.or(self.trade_date)
    }

    pub fn same_slot(&self, other: &IndicatorPoint) -> bool {
        self.indicator_code == other.indicator_code
            && self.region_code == other.region_code
            && self.freq == other.freq
            && self.key_date() == other.key_date()
    }
}

/// Query over persisted observations. Every set field must match; tags
/// must all be present with equal values.
#[derive(Debug, Clone, Default)]
pub struct ObservationFilter {
    pub metric_key: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub geo_code: Option<String>,
    pub tags: Tags,
    pub batch_id: Option<Uuid>,
    pub limit: Option<i64>,
}

impl ObservationFilter {
    pub fn matches(&self, obs: &ObservationRecord) -> bool {
        if let Some(key) = &self.metric_key {
            if &obs.metric_key != key {
                return false;
            }
        }
        if let Some(batch_id) = self.batch_id {
            if obs.batch_id != batch_id {
                return false;
            }
        }
        if let Some(geo) = &self.geo_code {
            if obs.geo_code.as_ref() != Some(geo) {
                return false;
            }
        }
        let date = obs.key_date();
        if let Some(from) = self.date_from {
            if date.map_or(true, |d| d < from) {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if date.map_or(true, |d| d > to) {
                return false;
            }
        }
        self.tags.iter().all(|(k, v)| obs.tags.get(k) == Some(v))
    }
}

#[async_trait]
pub trait Store: Send {
    // Batch-level rows, written immediately
    async fn create_batch(&mut self, batch: &BatchRecord) -> Result<()>;
    async fn finish_batch(&mut self, batch: &BatchRecord) -> Result<()>;
    async fn get_batch(&mut self, id: Uuid) -> Result<Option<BatchRecord>>;
    async fn insert_raw_file(&mut self, file: &RawFileRecord) -> Result<()>;
    async fn insert_raw_sheet(&mut self, sheet: &RawSheetRecord) -> Result<()>;
    async fn update_raw_sheet(&mut self, id: Uuid, outcome: &SheetOutcome) -> Result<()>;
    async fn insert_raw_table(&mut self, table: &RawTableRecord) -> Result<()>;
    async fn raw_sheets_for_batch(&mut self, batch_id: Uuid) -> Result<Vec<RawSheetRecord>>;
    async fn insert_errors(&mut self, errors: &[IngestError]) -> Result<()>;
    async fn errors_for_batch(&mut self, batch_id: Uuid) -> Result<Vec<IngestError>>;

    // Sheet transaction
    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;
    async fn release_savepoint(&mut self, name: &str) -> Result<()>;

    // Dimensions, inside the sheet transaction
    async fn find_metric_by_header(&mut self, raw_header: &str, sheet_name: &str) -> Result<Option<MetricRecord>>;
    async fn find_metric_by_key(&mut self, sheet_name: &str, metric_key: &str) -> Result<Option<MetricRecord>>;
    /// `None` when a row with the same `(raw_header, sheet_name)` already exists.
    async fn insert_metric(&mut self, metric: &NewMetric) -> Result<Option<MetricRecord>>;
    /// Fills unit/freq only where the stored row has none.
    async fn backfill_metric(&mut self, id: Uuid, unit: Option<&str>, freq: Option<&str>) -> Result<()>;
    async fn find_region(&mut self, region_code: &str) -> Result<Option<RegionRecord>>;
    async fn insert_region(&mut self, region_code: &str, region_name: &str, level: &str) -> Result<Option<RegionRecord>>;
    async fn find_geo(&mut self, province: &str) -> Result<Option<GeoRecord>>;
    async fn insert_geo(&mut self, province: &str, region_id: Option<Uuid>) -> Result<Option<GeoRecord>>;

    // Facts, inside the sheet transaction
    async fn observation_exists(&mut self, dedup_key: &str) -> Result<bool>;
    /// Inserts the observation and its tags. `None` when the fingerprint is
    /// already taken; the existing row is left untouched.
    async fn insert_observation(&mut self, obs: &NewObservation) -> Result<Option<Uuid>>;

    // Reads
    async fn query_observations(&mut self, filter: &ObservationFilter) -> Result<Vec<ObservationRecord>>;

    // Derived indicators; writes and lookups need the open transaction
    async fn find_indicator(&mut self, indicator_code: &str) -> Result<Option<IndicatorRecord>>;
    /// `None` when the code is already taken.
    async fn insert_indicator(&mut self, indicator: &NewIndicator) -> Result<Option<IndicatorRecord>>;
    /// Writes the point, replacing the value already stored for its slot.
    /// Returns `true` when the slot was new.
    async fn upsert_indicator_point(&mut self, point: &IndicatorPoint) -> Result<bool>;
    async fn indicator_points(&mut self, indicator_code: &str) -> Result<Vec<IndicatorPoint>>;
}
