//! In-memory store for dry runs and tests.
//!
//! Transactions snapshot the dimension and fact tables on `begin` and on
//! every savepoint. Values are range-checked like the `NUMERIC(18,6)`
//! column they land in, so an oversized value fails the insert the way
//! Postgres would.

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    BatchRecord, GeoRecord, IndicatorPoint, IndicatorRecord, MetricRecord, NewIndicator, NewMetric,
    NewObservation, ObservationFilter, ObservationRecord, RawFileRecord, RawSheetRecord,
    RawTableRecord, RegionRecord, SheetOutcome, Store,
};
use crate::error::{PipelineError, Result};
use crate::errors::IngestError;

/// Exclusive bound of a `NUMERIC(18,6)` value.
const MAX_NUMERIC_ABS: f64 = 1e12;

#[derive(Debug, Clone, Default)]
struct Tables {
    metrics: Vec<MetricRecord>,
    regions: Vec<RegionRecord>,
    geos: Vec<GeoRecord>,
    observations: Vec<ObservationRecord>,
    indicators: Vec<IndicatorRecord>,
    indicator_points: Vec<IndicatorPoint>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    tx_snapshot: Option<Tables>,
    savepoints: Vec<(String, Tables)>,
    batches: Vec<BatchRecord>,
    raw_files: Vec<RawFileRecord>,
    raw_sheets: Vec<RawSheetRecord>,
    raw_tables: Vec<RawTableRecord>,
    errors: Vec<IngestError>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_tx(&self) -> Result<()> {
        if self.tx_snapshot.is_some() {
            Ok(())
        } else {
            Err(PipelineError::NoTransaction)
        }
    }

    fn savepoint_index(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| PipelineError::Storage(format!("savepoint \"{}\" does not exist", name)))
    }

    pub fn metrics(&self) -> &[MetricRecord] {
        &self.tables.metrics
    }

    pub fn geos(&self) -> &[GeoRecord] {
        &self.tables.geos
    }

    pub fn regions(&self) -> &[RegionRecord] {
        &self.tables.regions
    }

    pub fn observations(&self) -> &[ObservationRecord] {
        &self.tables.observations
    }

    pub fn indicators(&self) -> &[IndicatorRecord] {
        &self.tables.indicators
    }

    pub fn batches(&self) -> &[BatchRecord] {
        &self.batches
    }

    pub fn raw_files(&self) -> &[RawFileRecord] {
        &self.raw_files
    }

    pub fn raw_tables(&self) -> &[RawTableRecord] {
        &self.raw_tables
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_batch(&mut self, batch: &BatchRecord) -> Result<()> {
        self.batches.push(batch.clone());
        Ok(())
    }

    async fn finish_batch(&mut self, batch: &BatchRecord) -> Result<()> {
        match self.batches.iter_mut().find(|b| b.id == batch.id) {
            Some(existing) => {
                *existing = batch.clone();
                Ok(())
            }
            None => Err(PipelineError::Storage(format!("batch {} not found", batch.id))),
        }
    }

    async fn get_batch(&mut self, id: Uuid) -> Result<Option<BatchRecord>> {
        Ok(self.batches.iter().find(|b| b.id == id).cloned())
    }

    async fn insert_raw_file(&mut self, file: &RawFileRecord) -> Result<()> {
        self.raw_files.push(file.clone());
        Ok(())
    }

    async fn insert_raw_sheet(&mut self, sheet: &RawSheetRecord) -> Result<()> {
        self.raw_sheets.push(sheet.clone());
        Ok(())
    }

    async fn update_raw_sheet(&mut self, id: Uuid, outcome: &SheetOutcome) -> Result<()> {
        let sheet = self
            .raw_sheets
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| PipelineError::Storage(format!("raw sheet {} not found", id)))?;
        sheet.parse_status = outcome.status;
        sheet.parser_type = outcome.parser_type.clone();
        sheet.observation_count = outcome.observation_count;
        sheet.error_count = outcome.error_count;
        Ok(())
    }

    async fn insert_raw_table(&mut self, table: &RawTableRecord) -> Result<()> {
        self.raw_tables.push(table.clone());
        Ok(())
    }

    async fn raw_sheets_for_batch(&mut self, batch_id: Uuid) -> Result<Vec<RawSheetRecord>> {
        let file_ids: Vec<Uuid> = self
            .raw_files
            .iter()
            .filter(|f| f.batch_id == batch_id)
            .map(|f| f.id)
            .collect();
        Ok(self
            .raw_sheets
            .iter()
            .filter(|s| file_ids.contains(&s.raw_file_id))
            .cloned()
            .collect())
    }

    async fn insert_errors(&mut self, errors: &[IngestError]) -> Result<()> {
        self.errors.extend_from_slice(errors);
        Ok(())
    }

    async fn errors_for_batch(&mut self, batch_id: Uuid) -> Result<Vec<IngestError>> {
        Ok(self
            .errors
            .iter()
            .filter(|e| e.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.tx_snapshot.is_some() {
            return Err(PipelineError::Storage("transaction already open".to_string()));
        }
        self.tx_snapshot = Some(self.tables.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.in_tx()?;
        self.tx_snapshot = None;
        self.savepoints.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let snapshot = self.tx_snapshot.take().ok_or(PipelineError::NoTransaction)?;
        self.tables = snapshot;
        self.savepoints.clear();
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.in_tx()?;
        self.savepoints.push((name.to_string(), self.tables.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.in_tx()?;
        let idx = self.savepoint_index(name)?;
        self.tables = self.savepoints[idx].1.clone();
        self.savepoints.truncate(idx + 1);
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.in_tx()?;
        let idx = self.savepoint_index(name)?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    async fn find_metric_by_header(&mut self, raw_header: &str, sheet_name: &str) -> Result<Option<MetricRecord>> {
        self.in_tx()?;
        Ok(self
            .tables
            .metrics
            .iter()
            .find(|m| m.raw_header == raw_header && m.sheet_name == sheet_name)
            .cloned())
    }

    async fn find_metric_by_key(&mut self, sheet_name: &str, metric_key: &str) -> Result<Option<MetricRecord>> {
        self.in_tx()?;
        Ok(self
            .tables
            .metrics
            .iter()
            .find(|m| m.sheet_name == sheet_name && m.metric_key == metric_key)
            .cloned())
    }

    async fn insert_metric(&mut self, metric: &NewMetric) -> Result<Option<MetricRecord>> {
        self.in_tx()?;
        let taken = self
            .tables
            .metrics
            .iter()
            .any(|m| m.raw_header == metric.raw_header && m.sheet_name == metric.sheet_name);
        if taken {
            return Ok(None);
        }
        let record = metric.clone().into_record(Uuid::new_v4());
        self.tables.metrics.push(record.clone());
        Ok(Some(record))
    }

    async fn backfill_metric(&mut self, id: Uuid, unit: Option<&str>, freq: Option<&str>) -> Result<()> {
        self.in_tx()?;
        if let Some(metric) = self.tables.metrics.iter_mut().find(|m| m.id == id) {
            if metric.unit.is_none() {
                metric.unit = unit.map(str::to_string);
            }
            if metric.freq.is_none() {
                metric.freq = freq.map(str::to_string);
            }
        }
        Ok(())
    }

    async fn find_region(&mut self, region_code: &str) -> Result<Option<RegionRecord>> {
        self.in_tx()?;
        Ok(self
            .tables
            .regions
            .iter()
            .find(|r| r.region_code == region_code)
            .cloned())
    }

    async fn insert_region(&mut self, region_code: &str, region_name: &str, level: &str) -> Result<Option<RegionRecord>> {
        self.in_tx()?;
        if self.tables.regions.iter().any(|r| r.region_code == region_code) {
            return Ok(None);
        }
        let record = RegionRecord {
            id: Uuid::new_v4(),
            region_code: region_code.to_string(),
            region_name: region_name.to_string(),
            level: level.to_string(),
        };
        self.tables.regions.push(record.clone());
        Ok(Some(record))
    }

    async fn find_geo(&mut self, province: &str) -> Result<Option<GeoRecord>> {
        self.in_tx()?;
        Ok(self.tables.geos.iter().find(|g| g.province == province).cloned())
    }

    async fn insert_geo(&mut self, province: &str, region_id: Option<Uuid>) -> Result<Option<GeoRecord>> {
        self.in_tx()?;
        if self.tables.geos.iter().any(|g| g.province == province) {
            return Ok(None);
        }
        let record = GeoRecord {
            id: Uuid::new_v4(),
            province: province.to_string(),
            region_id,
        };
        self.tables.geos.push(record.clone());
        Ok(Some(record))
    }

    async fn observation_exists(&mut self, dedup_key: &str) -> Result<bool> {
        self.in_tx()?;
        Ok(self.tables.observations.iter().any(|o| o.dedup_key == dedup_key))
    }

    async fn insert_observation(&mut self, obs: &NewObservation) -> Result<Option<Uuid>> {
        self.in_tx()?;
        if !obs.value.is_finite() || obs.value.abs() >= MAX_NUMERIC_ABS {
            return Err(PipelineError::Storage(format!(
                "numeric field overflow for value {}",
                obs.value
            )));
        }
        if self.tables.observations.iter().any(|o| o.dedup_key == obs.dedup_key) {
            return Ok(None);
        }
        let metric_key = self
            .tables
            .metrics
            .iter()
            .find(|m| m.id == obs.metric_id)
            .map(|m| m.metric_key.clone())
            .ok_or_else(|| PipelineError::Storage(format!("metric {} not found", obs.metric_id)))?;
        let geo_code = match obs.geo_id {
            Some(geo_id) => Some(
                self.tables
                    .geos
                    .iter()
                    .find(|g| g.id == geo_id)
                    .map(|g| g.province.clone())
                    .ok_or_else(|| PipelineError::Storage(format!("geo {} not found", geo_id)))?,
            ),
            None => None,
        };
        let id = Uuid::new_v4();
        self.tables.observations.push(ObservationRecord {
            id,
            batch_id: obs.batch_id,
            metric_id: obs.metric_id,
            metric_key,
            geo_id: obs.geo_id,
            geo_code,
            period_type: obs.period_type,
            obs_date: obs.obs_date,
            period_start: obs.period_start,
            period_end: obs.period_end,
            value: obs.value,
            raw_value: obs.raw_value.clone(),
            dedup_key: obs.dedup_key.clone(),
            location: obs.location.clone(),
            tags: obs.tags.clone(),
        });
        Ok(Some(id))
    }

    async fn query_observations(&mut self, filter: &ObservationFilter) -> Result<Vec<ObservationRecord>> {
        let limit = filter
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);
        Ok(self
            .tables
            .observations
            .iter()
            .filter(|o| filter.matches(o))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_indicator(&mut self, indicator_code: &str) -> Result<Option<IndicatorRecord>> {
        self.in_tx()?;
        Ok(self
            .tables
            .indicators
            .iter()
            .find(|i| i.indicator_code == indicator_code)
            .cloned())
    }

    async fn insert_indicator(&mut self, indicator: &NewIndicator) -> Result<Option<IndicatorRecord>> {
        self.in_tx()?;
        if self
            .tables
            .indicators
            .iter()
            .any(|i| i.indicator_code == indicator.indicator_code)
        {
            return Ok(None);
        }
        let record = indicator.clone().into_record(Uuid::new_v4());
        self.tables.indicators.push(record.clone());
        Ok(Some(record))
    }

    async fn upsert_indicator_point(&mut self, point: &IndicatorPoint) -> Result<bool> {
        self.in_tx()?;
        if !point.value.is_finite() || point.value.abs() >= MAX_NUMERIC_ABS {
            return Err(PipelineError::Storage(format!(
                "numeric field overflow for value {}",
                point.value
            )));
        }
        if !self
            .tables
            .indicators
            .iter()
            .any(|i| i.indicator_code == point.indicator_code)
        {
            return Err(PipelineError::Storage(format!(
                "indicator {} not found",
                point.indicator_code
            )));
        }
        match self.tables.indicator_points.iter_mut().find(|p| p.same_slot(point)) {
            Some(existing) => {
                *existing = point.clone();
                Ok(false)
            }
            None => {
                self.tables.indicator_points.push(point.clone());
                Ok(true)
            }
        }
    }

    async fn indicator_points(&mut self, indicator_code: &str) -> Result<Vec<IndicatorPoint>> {
        let mut points: Vec<IndicatorPoint> = self
            .tables
            .indicator_points
            .iter()
            .filter(|p| p.indicator_code == indicator_code)
            .cloned()
            .collect();
        points.sort_by(|a, b| (a.key_date(), &a.region_code).cmp(&(b.key_date(), &b.region_code)));
        Ok(points)
    }
}
