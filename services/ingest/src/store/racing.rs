//! Test store where a concurrent writer commits the same row between our
//! lookup and our insert, so the insert hits the uniqueness conflict.

use std::collections::HashSet;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    BatchRecord, GeoRecord, IndicatorPoint, IndicatorRecord, MemoryStore, MetricRecord,
    NewIndicator, NewMetric, NewObservation, ObservationFilter, ObservationRecord, RawFileRecord,
    RawSheetRecord, RawTableRecord, RegionRecord, SheetOutcome, Store,
};
use crate::error::Result;
use crate::errors::IngestError;

pub const RIVAL_SOURCE: &str = "RIVAL";
pub const RIVAL_BATCH: Uuid = Uuid::from_u128(0x5157_a11e);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Race {
    Metric,
    Geo,
    Observation,
    Indicator,
}

/// Wraps a [`MemoryStore`]. Each armed race fires once, on the next insert
/// of its kind.
#[derive(Default)]
pub struct RacingStore {
    pub inner: MemoryStore,
    armed: HashSet<Race>,
    pub fired: Vec<Race>,
}

impl RacingStore {
    pub fn new(races: &[Race]) -> Self {
        Self {
            inner: MemoryStore::new(),
            armed: races.iter().copied().collect(),
            fired: Vec::new(),
        }
    }

    fn fire(&mut self, race: Race) -> bool {
        let fire = self.armed.remove(&race);
        if fire {
            self.fired.push(race);
        }
        fire
    }
}

#[async_trait]
impl Store for RacingStore {
    async fn create_batch(&mut self, batch: &BatchRecord) -> Result<()> {
        self.inner.create_batch(batch).await
    }

    async fn finish_batch(&mut self, batch: &BatchRecord) -> Result<()> {
        self.inner.finish_batch(batch).await
    }

    async fn get_batch(&mut self, id: Uuid) -> Result<Option<BatchRecord>> {
        self.inner.get_batch(id).await
    }

    async fn insert_raw_file(&mut self, file: &RawFileRecord) -> Result<()> {
        self.inner.insert_raw_file(file).await
    }

    async fn insert_raw_sheet(&mut self, sheet: &RawSheetRecord) -> Result<()> {
        self.inner.insert_raw_sheet(sheet).await
    }

    async fn update_raw_sheet(&mut self, id: Uuid, outcome: &SheetOutcome) -> Result<()> {
        self.inner.update_raw_sheet(id, outcome).await
    }

    async fn insert_raw_table(&mut self, table: &RawTableRecord) -> Result<()> {
        self.inner.insert_raw_table(table).await
    }

    async fn raw_sheets_for_batch(&mut self, batch_id: Uuid) -> Result<Vec<RawSheetRecord>> {
        self.inner.raw_sheets_for_batch(batch_id).await
    }

    async fn insert_errors(&mut self, errors: &[IngestError]) -> Result<()> {
        self.inner.insert_errors(errors).await
    }

    async fn errors_for_batch(&mut self, batch_id: Uuid) -> Result<Vec<IngestError>> {
        self.inner.errors_for_batch(batch_id).await
    }

    async fn begin(&mut self) -> Result<()> {
        self.inner.begin().await
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.inner.rollback().await
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.inner.savepoint(name).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.inner.rollback_to_savepoint(name).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.inner.release_savepoint(name).await
    }

    async fn find_metric_by_header(&mut self, raw_header: &str, sheet_name: &str) -> Result<Option<MetricRecord>> {
        self.inner.find_metric_by_header(raw_header, sheet_name).await
    }

    async fn find_metric_by_key(&mut self, sheet_name: &str, metric_key: &str) -> Result<Option<MetricRecord>> {
        self.inner.find_metric_by_key(sheet_name, metric_key).await
    }

    async fn insert_metric(&mut self, metric: &NewMetric) -> Result<Option<MetricRecord>> {
        if self.fire(Race::Metric) {
            let rival = NewMetric {
                source_code: RIVAL_SOURCE.to_string(),
                ..metric.clone()
            };
            self.inner.insert_metric(&rival).await?;
        }
        self.inner.insert_metric(metric).await
    }

    async fn backfill_metric(&mut self, id: Uuid, unit: Option<&str>, freq: Option<&str>) -> Result<()> {
        self.inner.backfill_metric(id, unit, freq).await
    }

    async fn find_region(&mut self, region_code: &str) -> Result<Option<RegionRecord>> {
        self.inner.find_region(region_code).await
    }

    async fn insert_region(&mut self, region_code: &str, region_name: &str, level: &str) -> Result<Option<RegionRecord>> {
        self.inner.insert_region(region_code, region_name, level).await
    }

    async fn find_geo(&mut self, province: &str) -> Result<Option<GeoRecord>> {
        self.inner.find_geo(province).await
    }

    async fn insert_geo(&mut self, province: &str, region_id: Option<Uuid>) -> Result<Option<GeoRecord>> {
        if self.fire(Race::Geo) {
            self.inner.insert_geo(province, None).await?;
        }
        self.inner.insert_geo(province, region_id).await
    }

    async fn observation_exists(&mut self, dedup_key: &str) -> Result<bool> {
        self.inner.observation_exists(dedup_key).await
    }

    async fn insert_observation(&mut self, obs: &NewObservation) -> Result<Option<Uuid>> {
        if self.fire(Race::Observation) {
            let rival = NewObservation {
                batch_id: RIVAL_BATCH,
                value: obs.value + 1.0,
                source_code: RIVAL_SOURCE.to_string(),
                ..obs.clone()
            };
            self.inner.insert_observation(&rival).await?;
        }
        self.inner.insert_observation(obs).await
    }

    async fn query_observations(&mut self, filter: &ObservationFilter) -> Result<Vec<ObservationRecord>> {
        self.inner.query_observations(filter).await
    }

    async fn find_indicator(&mut self, indicator_code: &str) -> Result<Option<IndicatorRecord>> {
        self.inner.find_indicator(indicator_code).await
    }

    async fn insert_indicator(&mut self, indicator: &NewIndicator) -> Result<Option<IndicatorRecord>> {
        if self.fire(Race::Indicator) {
            let rival = NewIndicator {
                source_code: Some(RIVAL_SOURCE.to_string()),
                ..indicator.clone()
            };
            self.inner.insert_indicator(&rival).await?;
        }
        self.inner.insert_indicator(indicator).await
    }

    async fn upsert_indicator_point(&mut self, point: &IndicatorPoint) -> Result<bool> {
        self.inner.upsert_indicator_point(point).await
    }

    async fn indicator_points(&mut self, indicator_code: &str) -> Result<Vec<IndicatorPoint>> {
        self.inner.indicator_points(indicator_code).await
    }
}
