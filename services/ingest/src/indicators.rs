//! Derived indicators: profile rules that aggregate a batch's observations
//! into `fact_indicator_ts` points.
//!
//! Each rule selects observations by metric key, tags, geography and period
//! type, groups them by region and date, and reduces every group with one
//! aggregate. Points are upserted; a later batch may overwrite a value.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::fingerprint::NATION;
use crate::observation::{PeriodType, Tags};
use crate::resolver::Resolver;
use crate::store::{IndicatorPoint, NewIndicator, ObservationFilter, ObservationRecord, Store};

pub const CALC_DERIVED: &str = "DERIVED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IndicatorFreq {
    #[serde(rename = "D", alias = "daily")]
    Daily,
    #[serde(rename = "W", alias = "weekly")]
    Weekly,
}

impl IndicatorFreq {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorFreq::Daily => "D",
            IndicatorFreq::Weekly => "W",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggMethod {
    #[default]
    Mean,
    Sum,
    Max,
    Min,
}

impl AggMethod {
    /// `None` for an empty group.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        Some(match self {
            AggMethod::Mean => values.iter().sum::<f64>() / values.len() as f64,
            AggMethod::Sum => values.iter().sum(),
            AggMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    GeoCode,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawConditions {
    metric_key_pattern: Option<String>,
    tags: Tags,
    geo_code: Option<String>,
    geo_code_pattern: Option<String>,
    period_type: Option<PeriodType>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawIndicatorRule {
    indicator_code: String,
    indicator_name: String,
    #[serde(default)]
    source_code: Option<String>,
    freq: IndicatorFreq,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    agg_method: AggMethod,
    #[serde(default)]
    group_by: Option<GroupBy>,
    #[serde(default)]
    conditions: RawConditions,
}

/// Which observations feed a rule. Patterns are anchored at the start of
/// the value, like dispatch rule regexes.
#[derive(Debug, Clone, Default)]
pub struct RuleConditions {
    pub metric_key_pattern: Option<Regex>,
    pub tags: Tags,
    pub geo_code: Option<String>,
    pub geo_code_pattern: Option<Regex>,
    pub period_type: Option<PeriodType>,
}

fn matches_from_start(re: &Regex, text: &str) -> bool {
    re.find(text).is_some_and(|m| m.start() == 0)
}

impl RuleConditions {
    pub fn matches(&self, obs: &ObservationRecord) -> bool {
        if let Some(re) = &self.metric_key_pattern {
            if !matches_from_start(re, &obs.metric_key) {
                return false;
            }
        }
        if !self.tags.iter().all(|(k, v)| obs.tags.get(k) == Some(v)) {
            return false;
        }
        let geo = obs.geo_code.as_deref().unwrap_or(NATION);
        if let Some(code) = &self.geo_code {
            if geo != code {
                return false;
            }
        }
        if let Some(re) = &self.geo_code_pattern {
            if !matches_from_start(re, geo) {
                return false;
            }
        }
        match self.period_type {
            Some(period_type) => obs.period_type == period_type,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorRule {
    pub indicator_code: String,
    pub indicator_name: String,
    pub source_code: Option<String>,
    pub freq: IndicatorFreq,
    pub topic: Option<String>,
    pub unit: Option<String>,
    pub agg_method: AggMethod,
    pub group_by: Option<GroupBy>,
    pub conditions: RuleConditions,
}

impl IndicatorRule {
    pub(crate) fn from_raw(raw: RawIndicatorRule) -> Result<Self> {
        let code = raw.indicator_code.trim().to_string();
        if code.is_empty() {
            return Err(PipelineError::Profile("indicator rule needs an indicator_code".to_string()));
        }
        let compile = |pattern: Option<String>| pattern.as_deref().map(Regex::new).transpose();
        Ok(Self {
            indicator_code: code,
            indicator_name: raw.indicator_name,
            source_code: raw.source_code,
            freq: raw.freq,
            topic: raw.topic,
            unit: raw.unit,
            agg_method: raw.agg_method,
            group_by: raw.group_by,
            conditions: RuleConditions {
                metric_key_pattern: compile(raw.conditions.metric_key_pattern)?,
                tags: raw.conditions.tags,
                geo_code: raw.conditions.geo_code,
                geo_code_pattern: compile(raw.conditions.geo_code_pattern)?,
                period_type: raw.conditions.period_type,
            },
        })
    }

    /// The `dim_indicator` row this rule writes under.
    pub fn definition(&self) -> NewIndicator {
        NewIndicator {
            indicator_code: self.indicator_code.clone(),
            indicator_name: self.indicator_name.clone(),
            freq: self.freq.as_str().to_string(),
            unit: self.unit.clone(),
            topic: self.topic.clone(),
            source_code: self.source_code.clone(),
            calc_method: CALC_DERIVED.to_string(),
            description: Some(format!("{:?} of matching observations", self.agg_method).to_lowercase()),
        }
    }

    /// One point per (region, date) among the observations this rule selects.
    /// Ungrouped rules and national observations file under NATION.
    pub fn aggregate(&self, observations: &[ObservationRecord], batch_id: Uuid) -> Vec<IndicatorPoint> {
        let mut groups: BTreeMap<(String, NaiveDate), (Option<NaiveDate>, Vec<f64>)> = BTreeMap::new();
        for obs in observations.iter().filter(|o| self.conditions.matches(o)) {
            let Some(date) = obs.key_date() else {
                continue;
            };
            let region = match self.group_by {
                Some(GroupBy::GeoCode) => obs.geo_code.clone().unwrap_or_else(|| NATION.to_string()),
                None => NATION.to_string(),
            };
            let (start, values) = groups.entry((region, date)).or_default();
            if let Some(period_start) = obs.period_start {
                *start = Some(start.map_or(period_start, |s| s.min(period_start)));
            }
            values.push(obs.value);
        }

        groups
            .into_iter()
            .filter_map(|((region_code, date), (start, values))| {
                let value = self.agg_method.apply(&values)?;
                let (trade_date, week_start, week_end) = match self.freq {
                    IndicatorFreq::Daily => (Some(date), None, None),
                    IndicatorFreq::Weekly => (
                        None,
                        Some(start.unwrap_or(date - Duration::days(6))),
                        Some(date),
                    ),
                };
                Some(IndicatorPoint {
                    indicator_code: self.indicator_code.clone(),
                    region_code,
                    freq: self.freq.as_str().to_string(),
                    trade_date,
                    week_start,
                    week_end,
                    value,
                    source_code: self.source_code.clone(),
                    batch_id,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorOutcome {
    pub inserted: usize,
    pub updated: usize,
}

impl IndicatorOutcome {
    pub fn points(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Applies `rules` to the observations `batch_id` inserted. Runs inside the
/// caller's open transaction.
pub async fn extract_indicators(
    store: &mut dyn Store,
    resolver: &mut Resolver,
    rules: &[IndicatorRule],
    batch_id: Uuid,
) -> Result<IndicatorOutcome> {
    let mut outcome = IndicatorOutcome::default();
    if rules.is_empty() {
        return Ok(outcome);
    }
    let observations = store
        .query_observations(&ObservationFilter {
            batch_id: Some(batch_id),
            ..ObservationFilter::default()
        })
        .await?;

    for rule in rules {
        let points = rule.aggregate(&observations, batch_id);
        if points.is_empty() {
            debug!(indicator = %rule.indicator_code, "no matching observations");
            continue;
        }
        resolver.get_or_create_indicator(store, &rule.definition()).await?;
        let before = outcome.points();
        for point in &points {
            if store.upsert_indicator_point(point).await? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }
        info!(
            indicator = %rule.indicator_code,
            points = outcome.points() - before,
            "indicator derived"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn rule(value: serde_json::Value) -> IndicatorRule {
        IndicatorRule::from_raw(serde_json::from_value(value).unwrap()).unwrap()
    }

    fn obs(key: &str, geo: Option<&str>, day: u32, value: f64) -> ObservationRecord {
        ObservationRecord {
            id: Uuid::new_v4(),
            batch_id: Uuid::nil(),
            metric_id: Uuid::nil(),
            metric_key: key.to_string(),
            geo_id: None,
            geo_code: geo.map(str::to_string),
            period_type: PeriodType::Day,
            obs_date: NaiveDate::from_ymd_opt(2024, 1, day),
            period_start: None,
            period_end: None,
            value,
            raw_value: None,
            dedup_key: format!("{}-{:?}-{}", key, geo, day),
            location: String::new(),
            tags: Tags::new(),
        }
    }

    fn d(day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2024, 1, day)
    }

    // -------------------------------------------------------------------------
    // RULES
    // -------------------------------------------------------------------------

    #[test]
    fn test_aggregates() {
        let values = [3.0, 1.0, 2.0];
        assert_eq!(AggMethod::Mean.apply(&values), Some(2.0));
        assert_eq!(AggMethod::Sum.apply(&values), Some(6.0));
        assert_eq!(AggMethod::Max.apply(&values), Some(3.0));
        assert_eq!(AggMethod::Min.apply(&values), Some(1.0));
        assert_eq!(AggMethod::Mean.apply(&[]), None);
    }

    #[test]
    fn test_conditions_anchor_patterns_and_check_tags() {
        let r = rule(json!({
            "indicator_code": "HOG_AVG",
            "indicator_name": "生猪均价",
            "freq": "D",
            "conditions": {"metric_key_pattern": "YY_.*PRICE", "tags": {"scale": "规模场"}, "geo_code_pattern": "河"}
        }));
        let mut hit = obs("YY_OUT_PRICE", Some("河北"), 1, 15.0);
        hit.tags.insert("scale".to_string(), "规模场".to_string());
        assert!(r.conditions.matches(&hit));

        let mut other_tag = hit.clone();
        other_tag.tags.insert("scale".to_string(), "小散".to_string());
        assert!(!r.conditions.matches(&other_tag));

        let mut unanchored = hit.clone();
        unanchored.metric_key = "GL_YY_PRICE".to_string();
        assert!(!r.conditions.matches(&unanchored));

        let mut elsewhere = hit;
        elsewhere.geo_code = Some("山东".to_string());
        assert!(!r.conditions.matches(&elsewhere));
    }

    #[test]
    fn test_ungrouped_rule_files_under_nation_per_date() {
        let r = rule(json!({
            "indicator_code": "HOG_AVG", "indicator_name": "全国均价", "freq": "D",
            "conditions": {"metric_key_pattern": "PRICE"}
        }));
        let observations = vec![
            obs("PRICE", Some("河北"), 1, 10.0),
            obs("PRICE", Some("山东"), 1, 12.0),
            obs("PRICE", Some("河北"), 2, 20.0),
            obs("WEIGHT", Some("河北"), 1, 120.0),
        ];
        let points = r.aggregate(&observations, Uuid::nil());
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].region_code, NATION);
        assert_eq!(points[0].trade_date, d(1));
        assert_eq!(points[0].value, 11.0);
        assert_eq!(points[1].value, 20.0);
    }

    #[test]
    fn test_grouped_weekly_rule() {
        let r = rule(json!({
            "indicator_code": "HOG_W_MAX", "indicator_name": "周度最高", "freq": "W",
            "agg_method": "max", "group_by": "geo_code"
        }));
        let mut week = obs("PRICE", Some("河北"), 7, 14.0);
        week.period_type = PeriodType::Week;
        week.obs_date = None;
        week.period_start = d(1);
        week.period_end = d(7);
        let mut higher = week.clone();
        higher.value = 14.5;
        let national = obs("PRICE", None, 7, 13.0);

        let points = r.aggregate(&[week, higher, national], Uuid::nil());
        assert_eq!(points.len(), 2);
        let hebei = points.iter().find(|p| p.region_code == "河北").unwrap();
        assert_eq!(hebei.value, 14.5);
        assert_eq!(hebei.week_start, d(1));
        assert_eq!(hebei.week_end, d(7));
        assert_eq!(hebei.trade_date, None);
        let nation = points.iter().find(|p| p.region_code == NATION).unwrap();
        // no period start on a daily observation: the six days before
        assert_eq!(nation.week_start, NaiveDate::from_ymd_opt(2024, 1, 1));
    }

    #[test]
    fn test_rule_validation() {
        let raw = |v: serde_json::Value| serde_json::from_value::<RawIndicatorRule>(v).unwrap();
        let blank = raw(json!({"indicator_code": " ", "indicator_name": "x", "freq": "D"}));
        assert!(matches!(IndicatorRule::from_raw(blank), Err(PipelineError::Profile(_))));
        let bad = raw(json!({
            "indicator_code": "X", "indicator_name": "x", "freq": "W",
            "conditions": {"metric_key_pattern": "(open"}
        }));
        assert!(matches!(IndicatorRule::from_raw(bad), Err(PipelineError::Regex(_))));
        assert!(serde_json::from_value::<RawIndicatorRule>(json!({
            "indicator_code": "X", "indicator_name": "x", "freq": "M"
        }))
        .is_err());
    }

    // -------------------------------------------------------------------------
    // EXTRACTION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_extraction_creates_indicator_and_overwrites_points() {
        let mut store = MemoryStore::new();
        let mut resolver = Resolver::new("S");
        let r = rule(json!({
            "indicator_code": "HOG_AVG", "indicator_name": "全国均价", "freq": "D",
            "source_code": "S"
        }));

        store.begin().await.unwrap();
        let metric = store
            .insert_metric(&crate::store::NewMetric {
                metric_key: "PRICE".to_string(),
                metric_name: "价格".to_string(),
                raw_header: "价格".to_string(),
                sheet_name: "s".to_string(),
                source_code: "S".to_string(),
                metric_group: "province".to_string(),
                unit: None,
                freq: None,
            })
            .await
            .unwrap()
            .unwrap();
        let batch = Uuid::new_v4();
        for (key, value) in [("a", 10.0), ("b", 14.0)] {
            store
                .insert_observation(&crate::store::NewObservation {
                    batch_id: batch,
                    metric_id: metric.id,
                    geo_id: None,
                    period_type: PeriodType::Day,
                    obs_date: d(3),
                    period_start: None,
                    period_end: None,
                    value,
                    raw_value: None,
                    dedup_key: key.to_string(),
                    source_code: "S".to_string(),
                    sheet_name: "s".to_string(),
                    location: String::new(),
                    tags: Tags::new(),
                })
                .await
                .unwrap();
        }

        let first = extract_indicators(&mut store, &mut resolver, std::slice::from_ref(&r), batch)
            .await
            .unwrap();
        assert_eq!(first, IndicatorOutcome { inserted: 1, updated: 0 });
        let again = extract_indicators(&mut store, &mut resolver, std::slice::from_ref(&r), batch)
            .await
            .unwrap();
        assert_eq!(again, IndicatorOutcome { inserted: 0, updated: 1 });
        store.commit().await.unwrap();

        assert_eq!(store.indicators().len(), 1);
        assert_eq!(store.indicators()[0].calc_method, CALC_DERIVED);
        let points = store.indicator_points("HOG_AVG").await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 12.0);
        assert_eq!(points[0].source_code.as_deref(), Some("S"));
    }
}
