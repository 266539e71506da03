//! Postgres store.
//!
//! Dimension and fact statements run on the open sheet transaction; batch
//! rows and ingest errors go straight to the pool so they survive a sheet
//! rollback.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{PgConnection, PgPool, QueryBuilder, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{
    BatchRecord, BatchStatus, GeoRecord, IndicatorPoint, IndicatorRecord, MetricRecord,
    NewIndicator, NewMetric, NewObservation, ObservationFilter, ObservationRecord, RawFileRecord,
    RawSheetRecord, RawTableRecord, RegionRecord, SheetOutcome, SheetStatus, Store,
};
use crate::error::{PipelineError, Result};
use crate::errors::{ErrorKind, IngestError};
use crate::observation::{PeriodType, Tags};

pub struct PgStore {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

#[derive(Debug, sqlx::FromRow)]
struct MetricRow {
    id: Uuid,
    metric_key: String,
    metric_name: String,
    raw_header: String,
    sheet_name: String,
    source_code: String,
    metric_group: String,
    unit: Option<String>,
    freq: Option<String>,
}

impl From<MetricRow> for MetricRecord {
    fn from(r: MetricRow) -> Self {
        MetricRecord {
            id: r.id,
            metric_key: r.metric_key,
            metric_name: r.metric_name,
            raw_header: r.raw_header,
            sheet_name: r.sheet_name,
            source_code: r.source_code,
            metric_group: r.metric_group,
            unit: r.unit,
            freq: r.freq,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    source_code: String,
    profile_code: String,
    filename: String,
    status: String,
    total_rows: i64,
    success_rows: i64,
    failed_rows: i64,
    inserted_count: i64,
    updated_count: i64,
    sheet_count: i64,
    metric_count: i64,
    duration_ms: i64,
    error_summary: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct RawSheetRow {
    id: Uuid,
    raw_file_id: Uuid,
    sheet_name: String,
    sheet_index: i32,
    row_count: i32,
    col_count: i32,
    header_signature: String,
    parse_status: String,
    parser_type: Option<String>,
    observation_count: i64,
    error_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ErrorRow {
    id: Uuid,
    batch_id: Uuid,
    sheet_name: Option<String>,
    row_no: Option<i32>,
    col_name: Option<String>,
    error_type: String,
    message: String,
    raw_value: Option<String>,
    context_json: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ObservationRow {
    id: Uuid,
    batch_id: Uuid,
    metric_id: Uuid,
    metric_key: String,
    geo_id: Option<Uuid>,
    geo_code: Option<String>,
    period_type: String,
    obs_date: Option<NaiveDate>,
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
    value: f64,
    raw_value: Option<String>,
    dedup_key: String,
    location: String,
    tags_json: serde_json::Value,
}

#[derive(Debug, sqlx::FromRow)]
struct IndicatorRow {
    id: Uuid,
    indicator_code: String,
    indicator_name: String,
    freq: String,
    unit: Option<String>,
    topic: Option<String>,
    source_code: Option<String>,
    calc_method: String,
    description: Option<String>,
}

impl From<IndicatorRow> for IndicatorRecord {
    fn from(r: IndicatorRow) -> Self {
        IndicatorRecord {
            id: r.id,
            indicator_code: r.indicator_code,
            indicator_name: r.indicator_name,
            freq: r.freq,
            unit: r.unit,
            topic: r.topic,
            source_code: r.source_code,
            calc_method: r.calc_method,
            description: r.description,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IndicatorPointRow {
    indicator_code: String,
    region_code: String,
    freq: String,
    trade_date: Option<NaiveDate>,
    week_start: Option<NaiveDate>,
    week_end: Option<NaiveDate>,
    value: f64,
    source_code: Option<String>,
    batch_id: Option<Uuid>,
}

impl From<IndicatorPointRow> for IndicatorPoint {
    fn from(r: IndicatorPointRow) -> Self {
        IndicatorPoint {
            indicator_code: r.indicator_code,
            region_code: r.region_code,
            freq: r.freq,
            trade_date: r.trade_date,
            week_start: r.week_start,
            week_end: r.week_end,
            value: r.value,
            source_code: r.source_code,
            batch_id: r.batch_id.unwrap_or_else(Uuid::nil),
        }
    }
}

const INDICATOR_COLUMNS: &str =
    "id, indicator_code, indicator_name, freq, unit, topic, source_code, calc_method, description";

const METRIC_COLUMNS: &str =
    "id, metric_key, metric_name, raw_header, sheet_name, source_code, metric_group, unit, freq";

impl PgStore {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, tx: None }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(PipelineError::NoTransaction)
    }
}

/// Savepoint names are interpolated into SQL, so only identifiers pass.
fn savepoint_ident(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(PipelineError::Storage(format!("invalid savepoint name '{}'", name)))
    }
}

fn tags_json(tags: &Tags) -> serde_json::Value {
    serde_json::Value::Object(
        tags.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

fn decode_status<T>(value: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T> {
    parse(value).ok_or_else(|| PipelineError::Storage(format!("unknown {} '{}'", what, value)))
}

impl TryFrom<BatchRow> for BatchRecord {
    type Error = PipelineError;

    fn try_from(r: BatchRow) -> Result<Self> {
        Ok(BatchRecord {
            id: r.id,
            source_code: r.source_code,
            profile_code: r.profile_code,
            filename: r.filename,
            status: decode_status(&r.status, BatchStatus::parse, "batch status")?,
            total_rows: r.total_rows,
            success_rows: r.success_rows,
            failed_rows: r.failed_rows,
            inserted_count: r.inserted_count,
            updated_count: r.updated_count,
            sheet_count: r.sheet_count,
            metric_count: r.metric_count,
            duration_ms: r.duration_ms,
            error_summary: r.error_summary,
            started_at: r.started_at,
            finished_at: r.finished_at,
        })
    }
}

impl TryFrom<RawSheetRow> for RawSheetRecord {
    type Error = PipelineError;

    fn try_from(r: RawSheetRow) -> Result<Self> {
        Ok(RawSheetRecord {
            id: r.id,
            raw_file_id: r.raw_file_id,
            sheet_name: r.sheet_name,
            sheet_index: r.sheet_index,
            row_count: r.row_count,
            col_count: r.col_count,
            header_signature: r.header_signature,
            parse_status: decode_status(&r.parse_status, SheetStatus::parse, "sheet status")?,
            parser_type: r.parser_type,
            observation_count: r.observation_count,
            error_count: r.error_count,
        })
    }
}

impl TryFrom<ErrorRow> for IngestError {
    type Error = PipelineError;

    fn try_from(r: ErrorRow) -> Result<Self> {
        Ok(IngestError {
            id: r.id,
            batch_id: r.batch_id,
            sheet_name: r.sheet_name,
            row_no: r.row_no,
            col_name: r.col_name,
            kind: r
                .error_type
                .parse::<ErrorKind>()
                .map_err(PipelineError::Storage)?,
            message: r.message,
            raw_value: r.raw_value,
            context: r.context_json,
            created_at: r.created_at,
        })
    }
}

impl TryFrom<ObservationRow> for ObservationRecord {
    type Error = PipelineError;

    fn try_from(r: ObservationRow) -> Result<Self> {
        Ok(ObservationRecord {
            id: r.id,
            batch_id: r.batch_id,
            metric_id: r.metric_id,
            metric_key: r.metric_key,
            geo_id: r.geo_id,
            geo_code: r.geo_code,
            period_type: r
                .period_type
                .parse::<PeriodType>()
                .map_err(PipelineError::Storage)?,
            obs_date: r.obs_date,
            period_start: r.period_start,
            period_end: r.period_end,
            value: r.value,
            raw_value: r.raw_value,
            dedup_key: r.dedup_key,
            location: r.location,
            tags: serde_json::from_value(r.tags_json)?,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_batch(&mut self, batch: &BatchRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO import_batch (id, source_code, profile_code, filename, status, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(batch.id)
        .bind(&batch.source_code)
        .bind(&batch.profile_code)
        .bind(&batch.filename)
        .bind(batch.status.as_str())
        .bind(batch.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_batch(&mut self, batch: &BatchRecord) -> Result<()> {
        sqlx::query(
            "UPDATE import_batch SET status = $2, total_rows = $3, success_rows = $4, \
             failed_rows = $5, inserted_count = $6, updated_count = $7, sheet_count = $8, \
             metric_count = $9, duration_ms = $10, error_summary = $11, finished_at = $12 \
             WHERE id = $1",
        )
        .bind(batch.id)
        .bind(batch.status.as_str())
        .bind(batch.total_rows)
        .bind(batch.success_rows)
        .bind(batch.failed_rows)
        .bind(batch.inserted_count)
        .bind(batch.updated_count)
        .bind(batch.sheet_count)
        .bind(batch.metric_count)
        .bind(batch.duration_ms)
        .bind(&batch.error_summary)
        .bind(batch.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_batch(&mut self, id: Uuid) -> Result<Option<BatchRecord>> {
        let row: Option<BatchRow> = sqlx::query_as(
            "SELECT id, source_code, profile_code, filename, status, total_rows, success_rows, \
             failed_rows, inserted_count, updated_count, sheet_count, metric_count, duration_ms, \
             error_summary, started_at, finished_at FROM import_batch WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BatchRecord::try_from).transpose()
    }

    async fn insert_raw_file(&mut self, file: &RawFileRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO raw_file (id, batch_id, filename, file_hash, file_size, storage_path, \
             report_date_start, report_date_end) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(file.id)
        .bind(file.batch_id)
        .bind(&file.filename)
        .bind(&file.file_hash)
        .bind(file.file_size)
        .bind(&file.storage_path)
        .bind(file.report_date_start)
        .bind(file.report_date_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_raw_sheet(&mut self, sheet: &RawSheetRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO raw_sheet (id, raw_file_id, sheet_name, sheet_index, row_count, col_count, \
             header_signature, parse_status, parser_type, observation_count, error_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(sheet.id)
        .bind(sheet.raw_file_id)
        .bind(&sheet.sheet_name)
        .bind(sheet.sheet_index)
        .bind(sheet.row_count)
        .bind(sheet.col_count)
        .bind(&sheet.header_signature)
        .bind(sheet.parse_status.as_str())
        .bind(&sheet.parser_type)
        .bind(sheet.observation_count)
        .bind(sheet.error_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_raw_sheet(&mut self, id: Uuid, outcome: &SheetOutcome) -> Result<()> {
        sqlx::query(
            "UPDATE raw_sheet SET parse_status = $2, parser_type = $3, observation_count = $4, \
             error_count = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(&outcome.parser_type)
        .bind(outcome.observation_count)
        .bind(outcome.error_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_raw_table(&mut self, table: &RawTableRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO raw_table (id, raw_sheet_id, table_json, merged_cells_json, row_count, \
             col_count, stored_rows, truncated, skipped) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(table.id)
        .bind(table.raw_sheet_id)
        .bind(&table.table_json)
        .bind(&table.merged_cells_json)
        .bind(table.row_count)
        .bind(table.col_count)
        .bind(table.stored_rows)
        .bind(table.truncated)
        .bind(table.skipped)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn raw_sheets_for_batch(&mut self, batch_id: Uuid) -> Result<Vec<RawSheetRecord>> {
        let rows: Vec<RawSheetRow> = sqlx::query_as(
            "SELECT s.id, s.raw_file_id, s.sheet_name, s.sheet_index, s.row_count, s.col_count, \
             s.header_signature, s.parse_status, s.parser_type, s.observation_count, s.error_count \
             FROM raw_sheet s JOIN raw_file f ON f.id = s.raw_file_id \
             WHERE f.batch_id = $1 ORDER BY s.sheet_index",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RawSheetRecord::try_from).collect()
    }

    async fn insert_errors(&mut self, errors: &[IngestError]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO ingest_error (id, batch_id, sheet_name, row_no, col_name, error_type, \
             message, raw_value, context_json, created_at) ",
        );
        qb.push_values(errors, |mut b, e| {
            b.push_bind(e.id)
                .push_bind(e.batch_id)
                .push_bind(e.sheet_name.clone())
                .push_bind(e.row_no)
                .push_bind(e.col_name.clone())
                .push_bind(e.kind.as_str())
                .push_bind(e.message.clone())
                .push_bind(e.raw_value.clone())
                .push_bind(e.context.clone())
                .push_bind(e.created_at);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn errors_for_batch(&mut self, batch_id: Uuid) -> Result<Vec<IngestError>> {
        let rows: Vec<ErrorRow> = sqlx::query_as(
            "SELECT id, batch_id, sheet_name, row_no, col_name, error_type, message, raw_value, \
             context_json, created_at FROM ingest_error WHERE batch_id = $1 ORDER BY created_at, id",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(IngestError::try_from).collect()
    }

    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(PipelineError::Storage("transaction already open".to_string()));
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(PipelineError::NoTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(PipelineError::NoTransaction)?;
        tx.rollback().await?;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("SAVEPOINT {}", savepoint_ident(name)?);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", savepoint_ident(name)?);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", savepoint_ident(name)?);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn find_metric_by_header(&mut self, raw_header: &str, sheet_name: &str) -> Result<Option<MetricRecord>> {
        let sql = format!(
            "SELECT {} FROM dim_metric WHERE raw_header = $1 AND sheet_name = $2",
            METRIC_COLUMNS
        );
        let row: Option<MetricRow> = sqlx::query_as(&sql)
            .bind(raw_header)
            .bind(sheet_name)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row.map(MetricRecord::from))
    }

    async fn find_metric_by_key(&mut self, sheet_name: &str, metric_key: &str) -> Result<Option<MetricRecord>> {
        let sql = format!(
            "SELECT {} FROM dim_metric WHERE sheet_name = $1 AND metric_key = $2 \
             ORDER BY created_at LIMIT 1",
            METRIC_COLUMNS
        );
        let row: Option<MetricRow> = sqlx::query_as(&sql)
            .bind(sheet_name)
            .bind(metric_key)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row.map(MetricRecord::from))
    }

    async fn insert_metric(&mut self, metric: &NewMetric) -> Result<Option<MetricRecord>> {
        let id = Uuid::new_v4();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO dim_metric (id, metric_key, metric_name, raw_header, sheet_name, \
             source_code, metric_group, unit, freq) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (raw_header, sheet_name) DO NOTHING RETURNING id",
        )
        .bind(id)
        .bind(&metric.metric_key)
        .bind(&metric.metric_name)
        .bind(&metric.raw_header)
        .bind(&metric.sheet_name)
        .bind(&metric.source_code)
        .bind(&metric.metric_group)
        .bind(&metric.unit)
        .bind(&metric.freq)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(inserted.map(|(id,)| metric.clone().into_record(id)))
    }

    async fn backfill_metric(&mut self, id: Uuid, unit: Option<&str>, freq: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE dim_metric SET unit = COALESCE(unit, $2), freq = COALESCE(freq, $3) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(unit)
        .bind(freq)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn find_region(&mut self, region_code: &str) -> Result<Option<RegionRecord>> {
        let row: Option<(Uuid, String, String, String)> = sqlx::query_as(
            "SELECT id, region_code, region_name, region_level FROM dim_region WHERE region_code = $1",
        )
        .bind(region_code)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(row.map(|(id, region_code, region_name, level)| RegionRecord {
            id,
            region_code,
            region_name,
            level,
        }))
    }

    async fn insert_region(&mut self, region_code: &str, region_name: &str, level: &str) -> Result<Option<RegionRecord>> {
        let id = Uuid::new_v4();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO dim_region (id, region_code, region_name, region_level) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (region_code) DO NOTHING RETURNING id",
        )
        .bind(id)
        .bind(region_code)
        .bind(region_name)
        .bind(level)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(inserted.map(|(id,)| RegionRecord {
            id,
            region_code: region_code.to_string(),
            region_name: region_name.to_string(),
            level: level.to_string(),
        }))
    }

    async fn find_geo(&mut self, province: &str) -> Result<Option<GeoRecord>> {
        let row: Option<(Uuid, String, Option<Uuid>)> =
            sqlx::query_as("SELECT id, province, region_id FROM dim_geo WHERE province = $1")
                .bind(province)
                .fetch_optional(self.conn()?)
                .await?;
        Ok(row.map(|(id, province, region_id)| GeoRecord {
            id,
            province,
            region_id,
        }))
    }

    async fn insert_geo(&mut self, province: &str, region_id: Option<Uuid>) -> Result<Option<GeoRecord>> {
        let id = Uuid::new_v4();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO dim_geo (id, province, region_id) VALUES ($1, $2, $3) \
             ON CONFLICT (province) DO NOTHING RETURNING id",
        )
        .bind(id)
        .bind(province)
        .bind(region_id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(inserted.map(|(id,)| GeoRecord {
            id,
            province: province.to_string(),
            region_id,
        }))
    }

    async fn observation_exists(&mut self, dedup_key: &str) -> Result<bool> {
        let found: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM fact_observation WHERE dedup_key = $1")
                .bind(dedup_key)
                .fetch_optional(self.conn()?)
                .await?;
        Ok(found.is_some())
    }

    async fn insert_observation(&mut self, obs: &NewObservation) -> Result<Option<Uuid>> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO fact_observation (id, batch_id, metric_id, geo_id, period_type, obs_date, \
             period_start, period_end, value, raw_value, dedup_key, source_code, sheet_name, \
             location, tags_json) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (dedup_key) DO NOTHING RETURNING id",
        )
        .bind(id)
        .bind(obs.batch_id)
        .bind(obs.metric_id)
        .bind(obs.geo_id)
        .bind(obs.period_type.as_str())
        .bind(obs.obs_date)
        .bind(obs.period_start)
        .bind(obs.period_end)
        .bind(obs.value)
        .bind(&obs.raw_value)
        .bind(&obs.dedup_key)
        .bind(&obs.source_code)
        .bind(&obs.sheet_name)
        .bind(&obs.location)
        .bind(tags_json(&obs.tags))
        .fetch_optional(&mut *conn)
        .await?;

        let Some((id,)) = inserted else {
            debug!(dedup_key = %obs.dedup_key, "fingerprint already stored");
            return Ok(None);
        };
        for (key, value) in &obs.tags {
            sqlx::query(
                "INSERT INTO fact_observation_tag (observation_id, tag_key, tag_value) \
                 VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(key)
            .bind(value)
            .execute(&mut *conn)
            .await?;
        }
        Ok(Some(id))
    }

    async fn query_observations(&mut self, filter: &ObservationFilter) -> Result<Vec<ObservationRecord>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT o.id, o.batch_id, o.metric_id, m.metric_key, o.geo_id, g.province AS geo_code, \
             o.period_type, o.obs_date, o.period_start, o.period_end, o.value::float8 AS value, \
             o.raw_value, o.dedup_key, o.location, o.tags_json \
             FROM fact_observation o \
             JOIN dim_metric m ON m.id = o.metric_id \
             LEFT JOIN dim_geo g ON g.id = o.geo_id WHERE TRUE",
        );
        if let Some(key) = &filter.metric_key {
            qb.push(" AND m.metric_key = ").push_bind(key.clone());
        }
        if let Some(batch_id) = filter.batch_id {
            qb.push(" AND o.batch_id = ").push_bind(batch_id);
        }
        if let Some(geo) = &filter.geo_code {
            qb.push(" AND g.province = ").push_bind(geo.clone());
        }
        if let Some(from) = filter.date_from {
            qb.push(" AND COALESCE(o.period_end, o.obs_date) >= ").push_bind(from);
        }
        if let Some(to) = filter.date_to {
            qb.push(" AND COALESCE(o.period_end, o.obs_date) <= ").push_bind(to);
        }
        if !filter.tags.is_empty() {
            qb.push(" AND o.tags_json @> ").push_bind(tags_json(&filter.tags));
        }
        qb.push(" ORDER BY COALESCE(o.period_end, o.obs_date), m.metric_key, o.id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows: Vec<ObservationRow> = match self.tx.as_deref_mut() {
            Some(conn) => qb.build_query_as().fetch_all(conn).await?,
            None => qb.build_query_as().fetch_all(&self.pool).await?,
        };
        rows.into_iter().map(ObservationRecord::try_from).collect()
    }

    async fn find_indicator(&mut self, indicator_code: &str) -> Result<Option<IndicatorRecord>> {
        let sql = format!("SELECT {} FROM dim_indicator WHERE indicator_code = $1", INDICATOR_COLUMNS);
        let row: Option<IndicatorRow> = sqlx::query_as(&sql)
            .bind(indicator_code)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row.map(IndicatorRecord::from))
    }

    async fn insert_indicator(&mut self, indicator: &NewIndicator) -> Result<Option<IndicatorRecord>> {
        let id = Uuid::new_v4();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO dim_indicator (id, indicator_code, indicator_name, freq, unit, topic, \
             source_code, calc_method, description) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (indicator_code) DO NOTHING RETURNING id",
        )
        .bind(id)
        .bind(&indicator.indicator_code)
        .bind(&indicator.indicator_name)
        .bind(&indicator.freq)
        .bind(&indicator.unit)
        .bind(&indicator.topic)
        .bind(&indicator.source_code)
        .bind(&indicator.calc_method)
        .bind(&indicator.description)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(inserted.map(|(id,)| indicator.clone().into_record(id)))
    }

    async fn upsert_indicator_point(&mut self, point: &IndicatorPoint) -> Result<bool> {
        // xmax is zero only on a freshly inserted tuple
        let (inserted,): (bool,) = sqlx::query_as(
            "INSERT INTO fact_indicator_ts (id, indicator_code, region_code, freq, trade_date, \
             week_start, week_end, value, source_code, batch_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (indicator_code, region_code, freq, (COALESCE(week_end, trade_date))) \
             DO UPDATE SET value = EXCLUDED.value, week_start = EXCLUDED.week_start, \
             batch_id = EXCLUDED.batch_id, updated_at = now() \
             RETURNING (xmax = 0)",
        )
        .bind(Uuid::new_v4())
        .bind(&point.indicator_code)
        .bind(&point.region_code)
        .bind(&point.freq)
        .bind(point.trade_date)
        .bind(point.week_start)
        .bind(point.week_end)
        .bind(point.value)
        .bind(&point.source_code)
        .bind(point.batch_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(inserted)
    }

    async fn indicator_points(&mut self, indicator_code: &str) -> Result<Vec<IndicatorPoint>> {
        let sql = "SELECT indicator_code, region_code, freq, trade_date, week_start, week_end, \
                   value::float8 AS value, source_code, batch_id FROM fact_indicator_ts \
                   WHERE indicator_code = $1 ORDER BY COALESCE(week_end, trade_date), region_code";
        let query = sqlx::query_as::<_, IndicatorPointRow>(sql).bind(indicator_code);
        let rows = match self.tx.as_deref_mut() {
            Some(conn) => query.fetch_all(conn).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows.into_iter().map(IndicatorPoint::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_ident_rejects_injection() {
        assert!(savepoint_ident("chunk_3").is_ok());
        assert!(savepoint_ident("row_12").is_ok());
        assert!(savepoint_ident("x; DROP TABLE dim_metric").is_err());
        assert!(savepoint_ident("9lives").is_err());
        assert!(savepoint_ident("").is_err());
    }

    #[test]
    fn test_tags_json_is_flat_object() {
        let tags: Tags = [("contract".to_string(), "LH2405".to_string())].into();
        assert_eq!(tags_json(&tags), serde_json::json!({"contract": "LH2405"}));
    }
}
