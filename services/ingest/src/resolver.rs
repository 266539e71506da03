//! Metric, geography and indicator resolution with per-batch id caches.
//!
//! Dimension rows are looked up first and created only on a full miss.
//! A create that loses a uniqueness race re-reads the winner's row. Cache
//! entries are journaled so a rolled-back sheet or chunk also forgets the
//! ids it created.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::fingerprint::NATION;
use crate::geo::{is_national, normalize_province, region_name, region_of};
use crate::observation::MetricRef;
use crate::store::{MetricRecord, NewIndicator, NewMetric, Store};

const REGION_LEVEL: &str = "region";

/// Metric grouping used by downstream views, inferred from the metric key.
pub fn infer_metric_group(metric_key: &str) -> &'static str {
    let upper = metric_key.to_uppercase();
    if upper.contains("SLAUGHTER") {
        "warehouse"
    } else if upper.contains("SPREAD") || metric_key.contains("价差") {
        "spread"
    } else if upper.contains("PROFIT") || metric_key.contains("利润") {
        "profit"
    } else {
        "province"
    }
}

#[derive(Debug, Clone)]
enum CacheKey {
    Metric(String, String),
    Geo(String),
    Region(String),
    Indicator(String),
}

pub struct Resolver {
    source_code: String,
    metrics: HashMap<(String, String), MetricRecord>,
    geos: HashMap<String, Uuid>,
    regions: HashMap<String, Uuid>,
    indicators: HashMap<String, Uuid>,
    journal: Vec<CacheKey>,
    checkpoints: Vec<usize>,
}

impl Resolver {
    pub fn new(source_code: &str) -> Self {
        Self {
            source_code: source_code.to_string(),
            metrics: HashMap::new(),
            geos: HashMap::new(),
            regions: HashMap::new(),
            indicators: HashMap::new(),
            journal: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Marks the cache state to return to on [`Resolver::rollback_to_checkpoint`].
    pub fn checkpoint(&mut self) {
        self.checkpoints.push(self.journal.len());
    }

    /// Keeps everything cached since the last checkpoint.
    pub fn release_checkpoint(&mut self) {
        self.checkpoints.pop();
    }

    /// Forgets every entry cached since the last checkpoint.
    pub fn rollback_to_checkpoint(&mut self) {
        let mark = self.checkpoints.pop().unwrap_or(0);
        for key in self.journal.drain(mark..).rev() {
            match key {
                CacheKey::Metric(header, sheet) => {
                    self.metrics.remove(&(header, sheet));
                }
                CacheKey::Geo(province) => {
                    self.geos.remove(&province);
                }
                CacheKey::Region(code) => {
                    self.regions.remove(&code);
                }
                CacheKey::Indicator(code) => {
                    self.indicators.remove(&code);
                }
            }
        }
    }

    pub fn cached_metrics(&self) -> usize {
        self.metrics.len()
    }

    /// Resolves a metric by `(raw_header, sheet)`, then `(sheet, metric_key)`,
    /// creating it only when both miss. Missing unit/freq on an existing
    /// row is backfilled.
    pub async fn get_or_create_metric(
        &mut self,
        store: &mut dyn Store,
        metric: &MetricRef,
        sheet_name: &str,
    ) -> Result<MetricRecord> {
        let cache_key = (metric.raw_header.clone(), sheet_name.to_string());
        if let Some(found) = self.metrics.get(&cache_key) {
            return Ok(found.clone());
        }

        let existing = match store.find_metric_by_header(&metric.raw_header, sheet_name).await? {
            Some(found) => Some(found),
            None => store.find_metric_by_key(sheet_name, &metric.key).await?,
        };

        let record = match existing {
            Some(mut found) => {
                let unit_missing = found.unit.is_none() && metric.unit.is_some();
                let freq_missing = found.freq.is_none() && metric.freq.is_some();
                if unit_missing || freq_missing {
                    store
                        .backfill_metric(found.id, metric.unit.as_deref(), metric.freq.as_deref())
                        .await?;
                    found.unit = found.unit.or_else(|| metric.unit.clone());
                    found.freq = found.freq.or_else(|| metric.freq.clone());
                }
                found
            }
            None => {
                let new = NewMetric {
                    metric_key: metric.key.clone(),
                    metric_name: metric.name.clone(),
                    raw_header: metric.raw_header.clone(),
                    sheet_name: sheet_name.to_string(),
                    source_code: self.source_code.clone(),
                    metric_group: infer_metric_group(&metric.key).to_string(),
                    unit: metric.unit.clone(),
                    freq: metric.freq.clone(),
                };
                match store.insert_metric(&new).await? {
                    Some(created) => {
                        debug!(metric_key = %created.metric_key, sheet = sheet_name, "created metric");
                        created
                    }
                    None => store
                        .find_metric_by_header(&metric.raw_header, sheet_name)
                        .await?
                        .ok_or_else(|| {
                            PipelineError::Storage(format!(
                                "metric '{}' conflicted on insert but could not be re-read",
                                metric.raw_header
                            ))
                        })?,
                }
            }
        };

        self.metrics.insert(cache_key.clone(), record.clone());
        self.journal.push(CacheKey::Metric(cache_key.0, cache_key.1));
        Ok(record)
    }

    /// `None`, blank, national labels and the NATION sentinel resolve to
    /// no geography and never create a row.
    pub async fn get_or_create_geo(
        &mut self,
        store: &mut dyn Store,
        code: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        if code.eq_ignore_ascii_case(NATION) || is_national(code) {
            return Ok(None);
        }
        let province = normalize_province(code);
        if let Some(id) = self.geos.get(&province) {
            return Ok(Some(*id));
        }

        let id = match store.find_geo(&province).await? {
            Some(found) => found.id,
            None => {
                let region_id = match region_of(&province) {
                    Some(region_code) => Some(self.get_or_create_region(store, region_code).await?),
                    None => None,
                };
                match store.insert_geo(&province, region_id).await? {
                    Some(created) => created.id,
                    None => {
                        store
                            .find_geo(&province)
                            .await?
                            .ok_or_else(|| {
                                PipelineError::Storage(format!(
                                    "geo '{}' conflicted on insert but could not be re-read",
                                    province
                                ))
                            })?
                            .id
                    }
                }
            }
        };

        self.geos.insert(province.clone(), id);
        self.journal.push(CacheKey::Geo(province));
        Ok(Some(id))
    }

    pub async fn get_or_create_region(&mut self, store: &mut dyn Store, region_code: &str) -> Result<Uuid> {
        if let Some(id) = self.regions.get(region_code) {
            return Ok(*id);
        }
        let id = match store.find_region(region_code).await? {
            Some(found) => found.id,
            None => {
                let name = region_name(region_code).unwrap_or(region_code);
                match store.insert_region(region_code, name, REGION_LEVEL).await? {
                    Some(created) => created.id,
                    None => {
                        store
                            .find_region(region_code)
                            .await?
                            .ok_or_else(|| {
                                PipelineError::Storage(format!(
                                    "region '{}' conflicted on insert but could not be re-read",
                                    region_code
                                ))
                            })?
                            .id
                    }
                }
            }
        };
        self.regions.insert(region_code.to_string(), id);
        self.journal.push(CacheKey::Region(region_code.to_string()));
        Ok(id)
    }

    /// Indicator rows are keyed by code alone; an existing row is reused
    /// as stored.
    pub async fn get_or_create_indicator(&mut self, store: &mut dyn Store, indicator: &NewIndicator) -> Result<Uuid> {
        let code = &indicator.indicator_code;
        if let Some(id) = self.indicators.get(code) {
            return Ok(*id);
        }
        let id = match store.find_indicator(code).await? {
            Some(found) => found.id,
            None => match store.insert_indicator(indicator).await? {
                Some(created) => {
                    debug!(indicator = %code, "created indicator");
                    created.id
                }
                None => {
                    store
                        .find_indicator(code)
                        .await?
                        .ok_or_else(|| {
                            PipelineError::Storage(format!(
                                "indicator '{}' conflicted on insert but could not be re-read",
                                code
                            ))
                        })?
                        .id
                }
            },
        };
        self.indicators.insert(code.clone(), id);
        self.journal.push(CacheKey::Indicator(code.clone()));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::racing::{Race, RacingStore, RIVAL_SOURCE};
    use crate::store::MemoryStore;

    fn metric(key: &str, header: &str) -> MetricRef {
        MetricRef {
            key: key.to_string(),
            name: header.to_string(),
            raw_header: header.to_string(),
            unit: None,
            freq: None,
        }
    }

    // -------------------------------------------------------------------------
    // METRICS
    // -------------------------------------------------------------------------

    #[test]
    fn test_infer_metric_group() {
        assert_eq!(infer_metric_group("YY_D_SLAUGHTER_TOTAL"), "warehouse");
        assert_eq!(infer_metric_group("GL_D_REGION_SPREAD"), "spread");
        assert_eq!(infer_metric_group("GL_养殖利润"), "profit");
        assert_eq!(infer_metric_group("YY_D_PRICE"), "province");
    }

    #[tokio::test]
    async fn test_metric_created_once_and_cached() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("YONGYI");
        let a = resolver
            .get_or_create_metric(&mut store, &metric("PRICE", "价格"), "s")
            .await
            .unwrap();
        let b = resolver
            .get_or_create_metric(&mut store, &metric("PRICE", "价格"), "s")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.metrics().len(), 1);
        assert_eq!(a.metric_group, "province");
        assert_eq!(a.source_code, "YONGYI");
    }

    #[tokio::test]
    async fn test_metric_falls_back_to_key_lookup() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut first = Resolver::new("S");
        let created = first
            .get_or_create_metric(&mut store, &metric("PRICE", "价格"), "s")
            .await
            .unwrap();
        // another batch sees the same key under a respelled header
        let mut second = Resolver::new("S");
        let found = second
            .get_or_create_metric(&mut store, &metric("PRICE", "价格 "), "s")
            .await
            .unwrap();
        assert_eq!(created.id, found.id);
        assert_eq!(store.metrics().len(), 1);
    }

    #[tokio::test]
    async fn test_metric_unit_backfilled_never_overwritten() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        resolver
            .get_or_create_metric(&mut store, &metric("PRICE", "价格"), "s")
            .await
            .unwrap();

        let mut with_unit = metric("PRICE", "价格");
        with_unit.unit = Some("元/公斤".to_string());
        let mut fresh = Resolver::new("S");
        let backfilled = fresh
            .get_or_create_metric(&mut store, &with_unit, "s")
            .await
            .unwrap();
        assert_eq!(backfilled.unit.as_deref(), Some("元/公斤"));

        with_unit.unit = Some("元/吨".to_string());
        let mut third = Resolver::new("S");
        let kept = third.get_or_create_metric(&mut store, &with_unit, "s").await.unwrap();
        assert_eq!(kept.unit.as_deref(), Some("元/公斤"));
        assert_eq!(store.metrics()[0].unit.as_deref(), Some("元/公斤"));
    }

    // -------------------------------------------------------------------------
    // GEOGRAPHY
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_nation_is_pure_sentinel() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        for code in [None, Some("NATION"), Some(""), Some("全国"), Some("中国")] {
            assert_eq!(resolver.get_or_create_geo(&mut store, code).await.unwrap(), None);
        }
        assert!(store.geos().is_empty());
    }

    #[tokio::test]
    async fn test_geo_normalized_and_linked_to_region() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        let a = resolver.get_or_create_geo(&mut store, Some("河北省")).await.unwrap();
        let b = resolver.get_or_create_geo(&mut store, Some("河北")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.geos().len(), 1);
        assert_eq!(store.geos()[0].province, "河北");
        let region_id = store.geos()[0].region_id.unwrap();
        assert_eq!(store.regions()[0].id, region_id);
        assert_eq!(store.regions()[0].region_code, "NORTH");
        assert_eq!(store.regions()[0].region_name, "华北");
    }

    #[tokio::test]
    async fn test_unknown_geo_created_without_region() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        resolver.get_or_create_geo(&mut store, Some("Hebei")).await.unwrap();
        assert_eq!(store.geos()[0].region_id, None);
        assert!(store.regions().is_empty());
    }

    // -------------------------------------------------------------------------
    // CHECKPOINTS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_rollback_forgets_entries_created_since_checkpoint() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        resolver
            .get_or_create_metric(&mut store, &metric("A", "a"), "s")
            .await
            .unwrap();

        resolver.checkpoint();
        store.savepoint("chunk_0").await.unwrap();
        resolver
            .get_or_create_metric(&mut store, &metric("B", "b"), "s")
            .await
            .unwrap();
        store.rollback_to_savepoint("chunk_0").await.unwrap();
        resolver.rollback_to_checkpoint();

        assert_eq!(resolver.cached_metrics(), 1);
        // the rolled-back metric is created again rather than served stale
        let b = resolver
            .get_or_create_metric(&mut store, &metric("B", "b"), "s")
            .await
            .unwrap();
        assert!(store.metrics().iter().any(|m| m.id == b.id));
    }

    // -------------------------------------------------------------------------
    // CONCURRENT WRITERS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_metric_insert_conflict_reuses_winner() {
        let mut store = RacingStore::new(&[Race::Metric]);
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        let resolved = resolver
            .get_or_create_metric(&mut store, &metric("PRICE", "价格"), "s")
            .await
            .unwrap();

        assert_eq!(store.fired, vec![Race::Metric]);
        assert_eq!(store.inner.metrics().len(), 1);
        let winner = store.inner.metrics()[0].clone();
        assert_eq!(resolved.id, winner.id);
        assert_eq!(resolved.source_code, RIVAL_SOURCE);
        // later lookups are served from the cache
        let cached = resolver
            .get_or_create_metric(&mut store, &metric("PRICE", "价格"), "s")
            .await
            .unwrap();
        assert_eq!(cached.id, winner.id);
    }

    #[tokio::test]
    async fn test_geo_insert_conflict_reuses_winner() {
        let mut store = RacingStore::new(&[Race::Geo]);
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        let id = resolver.get_or_create_geo(&mut store, Some("河北省")).await.unwrap();

        assert_eq!(store.fired, vec![Race::Geo]);
        assert_eq!(store.inner.geos().len(), 1);
        let winner = &store.inner.geos()[0];
        assert_eq!(id, Some(winner.id));
        // the winner's row is kept as written, without our region link
        assert_eq!(winner.region_id, None);
    }

    #[tokio::test]
    async fn test_indicator_insert_conflict_reuses_winner() {
        let mut store = RacingStore::new(&[Race::Indicator]);
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        let indicator = NewIndicator {
            indicator_code: "HOG_AVG".to_string(),
            indicator_name: "全国均价".to_string(),
            freq: "D".to_string(),
            unit: None,
            topic: None,
            source_code: Some("S".to_string()),
            calc_method: "DERIVED".to_string(),
            description: None,
        };
        let id = resolver.get_or_create_indicator(&mut store, &indicator).await.unwrap();

        assert_eq!(store.fired, vec![Race::Indicator]);
        assert_eq!(store.inner.indicators().len(), 1);
        assert_eq!(store.inner.indicators()[0].id, id);
        assert_eq!(store.inner.indicators()[0].source_code.as_deref(), Some(RIVAL_SOURCE));
    }

    #[tokio::test]
    async fn test_rollback_forgets_indicator() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut resolver = Resolver::new("S");
        let indicator = NewIndicator {
            indicator_code: "HOG_AVG".to_string(),
            indicator_name: "全国均价".to_string(),
            freq: "D".to_string(),
            unit: None,
            topic: None,
            source_code: None,
            calc_method: "DERIVED".to_string(),
            description: None,
        };
        resolver.checkpoint();
        store.savepoint("indicators").await.unwrap();
        let first = resolver.get_or_create_indicator(&mut store, &indicator).await.unwrap();
        store.rollback_to_savepoint("indicators").await.unwrap();
        resolver.rollback_to_checkpoint();

        let second = resolver.get_or_create_indicator(&mut store, &indicator).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.indicators().len(), 1);
    }
}
