//! White-strip market tracking: a date column plus columns picked by header
//! pattern, each bound to an explicit metric.
//!
//! Two-row headers (a group such as 牧原 over areas such as 华东) match on
//! the lower row and keep both rows in the raw header, so equal area names
//! under different groups stay distinct metrics.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::{zero_based, DraftParts, ParseContext, ParseOutput};
use crate::dates::{in_business_range, parse_date_cell};
use crate::error::{PipelineError, Result};
use crate::observation::{MetricRef, Period, PeriodType, Tags};
use crate::values::{clean_numeric, clean_numeric_str, CleanValue};
use crate::worksheet::{Cell, Worksheet};

const DATE_LABEL: &str = "日期";

static FIRST_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

fn one() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnMetricRule {
    /// Substring of the column header.
    pub column_pattern: String,
    pub metric_key: String,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

/// Indexes are 1-based.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WhiteStripConfig {
    #[serde(default = "one")]
    pub header_row: usize,
    #[serde(default)]
    pub sub_header_row: Option<usize>,
    #[serde(default)]
    pub metrics_from_columns: Vec<ColumnMetricRule>,
}

impl WhiteStripConfig {
    pub fn validate(&self) -> Result<()> {
        zero_based(self.header_row, "header_row")?;
        if let Some(row) = self.sub_header_row {
            zero_based(row, "sub_header_row")?;
        }
        if self.metrics_from_columns.is_empty() {
            return Err(PipelineError::Profile(
                "metrics_from_columns must list at least one column".to_string(),
            ));
        }
        for rule in &self.metrics_from_columns {
            if rule.column_pattern.trim().is_empty() || rule.metric_key.trim().is_empty() {
                return Err(PipelineError::Profile(
                    "metrics_from_columns entries need column_pattern and metric_key".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Market quotes: plain numbers, `13.0 - 15.2` ranges, `14.4-14.2-14.0`
/// runs (averaged) and annotated values like `14.5(昨降)`.
pub fn clean_market_value(cell: &Cell) -> Option<CleanValue> {
    let Cell::Text(raw) = cell else {
        return clean_numeric(cell);
    };
    let text = raw.replace(['~', '～'], "");
    let text = text.trim();
    if let Some(value) = clean_numeric_str(text) {
        return Some(CleanValue {
            value,
            raw: raw.trim().to_string(),
        });
    }
    let value = if text.contains(['(', '（']) {
        FIRST_NUMBER_RE.find(text)?.as_str().parse().ok()?
    } else {
        let parts: Vec<f64> = text
            .split('-')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse::<f64>)
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        if parts.is_empty() {
            return None;
        }
        parts.iter().sum::<f64>() / parts.len() as f64
    };
    value.is_finite().then(|| CleanValue {
        value,
        raw: raw.trim().to_string(),
    })
}

/// Header text per column: `(label to match, raw header)`.
fn column_headers(ws: &Worksheet, header_row: usize, sub_row: Option<usize>) -> Vec<(String, String)> {
    let mut group = String::new();
    (0..ws.col_count())
        .map(|col| {
            let primary = ws.text(header_row, col);
            let Some(sub_row) = sub_row else {
                return (primary.clone(), primary);
            };
            if !primary.is_empty() {
                group = primary;
            }
            let sub = ws.text(sub_row, col);
            match (group.is_empty(), sub.is_empty()) {
                (_, true) => (group.clone(), group.clone()),
                (true, false) => (sub.clone(), sub),
                (false, false) => (sub.clone(), format!("{} / {}", group, sub)),
            }
        })
        .collect()
}

pub fn parse(ws: &Worksheet, config: &WhiteStripConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    if ws.row_count() == 0 {
        return Ok(out);
    }
    let header_row = zero_based(config.header_row, "header_row")?;
    let sub_row = config
        .sub_header_row
        .map(|r| zero_based(r, "sub_header_row"))
        .transpose()?;

    let date_col = (0..ws.col_count())
        .find(|&col| ws.text(header_row, col).contains(DATE_LABEL))
        .ok_or_else(|| {
            PipelineError::config(format!(
                "sheet '{}': no '{}' column in row {}",
                ws.name, DATE_LABEL, config.header_row
            ))
        })?;

    let headers = column_headers(ws, header_row, sub_row);
    let mut claimed: HashSet<usize> = HashSet::from([date_col]);
    let mut columns: Vec<(usize, MetricRef, Tags)> = Vec::new();
    for rule in &config.metrics_from_columns {
        let pattern = rule.column_pattern.trim();
        // the combined header first, then the top row alone
        let col = (0..headers.len())
            .find(|col| !claimed.contains(col) && headers[*col].0.contains(pattern))
            .or_else(|| {
                (0..ws.col_count())
                    .find(|col| !claimed.contains(col) && ws.text(header_row, *col).contains(pattern))
            });
        let Some(col) = col else {
            continue;
        };
        claimed.insert(col);
        columns.push((
            col,
            MetricRef {
                key: rule.metric_key.clone(),
                name: rule.metric_name.clone().unwrap_or_else(|| rule.metric_key.clone()),
                raw_header: headers[col].1.clone(),
                unit: rule.unit.clone(),
                freq: None,
            },
            rule.tags.clone(),
        ));
    }

    let period_type = ctx.period_type(None, PeriodType::Day);
    let data_start = header_row.max(sub_row.unwrap_or(0)) + 1;
    for row in data_start..ws.row_count() {
        let Some(date) = parse_date_cell(ws.value(row, date_col)).filter(|d| in_business_range(*d)) else {
            continue;
        };
        for (col, metric, tags) in &columns {
            let Some(value) = clean_market_value(ws.raw(row, *col)) else {
                continue;
            };
            out.observations.push(ctx.draft(DraftParts {
                metric: metric.clone(),
                period: Period::for_type(period_type, date),
                value,
                geo: None,
                tags: tags.clone(),
                row,
                col: *col,
            }));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::ProfileDefaults;
    use chrono::NaiveDate;

    fn ctx<'a>(sheet: &'a str, defaults: &'a ProfileDefaults) -> ParseContext<'a> {
        ParseContext {
            sheet_name: sheet,
            source_code: "YONGYI",
            defaults,
        }
    }

    fn rule(pattern: &str, key: &str) -> ColumnMetricRule {
        ColumnMetricRule {
            column_pattern: pattern.to_string(),
            metric_key: key.to_string(),
            metric_name: None,
            unit: Some("元/公斤".to_string()),
            tags: Tags::new(),
        }
    }

    // -------------------------------------------------------------------------
    // VALUES
    // -------------------------------------------------------------------------

    #[test]
    fn test_clean_market_value_variants() {
        let value = |s: &str| clean_market_value(&Cell::text(s)).map(|v| v.value);
        assert_eq!(value("~15.2"), Some(15.2));
        assert_eq!(value("13.0 - 15.0"), Some(14.0));
        assert_eq!(value("14-15-16"), Some(15.0));
        assert_eq!(value("14.5(昨降)"), Some(14.5));
        assert_eq!(value("（涨200）"), Some(200.0));
        assert_eq!(value("停市"), None);
        assert_eq!(clean_market_value(&Cell::Number(16.0)).map(|v| v.value), Some(16.0));
        assert_eq!(clean_market_value(&Cell::text("14.4-14.2-14.0")).unwrap().raw, "14.4-14.2-14.0");
    }

    // -------------------------------------------------------------------------
    // COLUMNS
    // -------------------------------------------------------------------------

    #[test]
    fn test_market_columns_by_pattern() {
        let ws = Worksheet::new(
            "白条市场",
            vec![
                vec![
                    Cell::text("日期"),
                    Cell::text("上海到货量"),
                    Cell::text("上海价格"),
                    Cell::text("北京价格"),
                ],
                vec![
                    Cell::text("2025.12.19"),
                    Cell::Number(1200.0),
                    Cell::text("13.0 - 15.0"),
                    Cell::Number(16.5),
                ],
                vec![Cell::text("备注")],
            ],
        );
        let config = WhiteStripConfig {
            header_row: 1,
            sub_header_row: None,
            metrics_from_columns: vec![rule("价格", "WS_SH_PRICE"), rule("价格", "WS_BJ_PRICE")],
        };
        config.validate().unwrap();
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &config, &ctx("白条市场", &defaults)).unwrap();

        assert_eq!(out.observations.len(), 2);
        assert_eq!(out.observations[0].metric.key, "WS_SH_PRICE");
        assert_eq!(out.observations[0].value, 14.0);
        assert_eq!(out.observations[1].metric.key, "WS_BJ_PRICE");
        assert_eq!(out.observations[1].metric.raw_header, "北京价格");
        assert_eq!(out.observations[1].period.obs_date, NaiveDate::from_ymd_opt(2025, 12, 19));
    }

    #[test]
    fn test_sub_header_areas_stay_apart_across_groups() {
        let ws = Worksheet::new(
            "华宝和牧原白条",
            vec![
                vec![Cell::text("日期"), Cell::text("华宝"), Cell::Empty, Cell::text("牧原")],
                vec![Cell::Empty, Cell::text("华东"), Cell::text("河南山东"), Cell::text("华东")],
                vec![
                    Cell::text("2025-12-19"),
                    Cell::Number(15.1),
                    Cell::Number(14.8),
                    Cell::Number(15.4),
                ],
            ],
        );
        let config = WhiteStripConfig {
            header_row: 1,
            sub_header_row: Some(2),
            metrics_from_columns: vec![
                rule("华东", "HUABAO_EAST"),
                rule("华东", "MUYUAN_EAST"),
                rule("河南山东", "HUABAO_HENAN_SHANDONG"),
            ],
        };
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &config, &ctx("华宝和牧原白条", &defaults)).unwrap();

        assert_eq!(out.observations.len(), 3);
        let by_key = |key: &str| out.observations.iter().find(|o| o.metric.key == key).unwrap();
        assert_eq!(by_key("HUABAO_EAST").metric.raw_header, "华宝 / 华东");
        assert_eq!(by_key("MUYUAN_EAST").metric.raw_header, "牧原 / 华东");
        assert_eq!(by_key("MUYUAN_EAST").value, 15.4);
        assert_eq!(by_key("HUABAO_HENAN_SHANDONG").metric.raw_header, "华宝 / 河南山东");
    }

    // -------------------------------------------------------------------------
    // CONFIG
    // -------------------------------------------------------------------------

    #[test]
    fn test_missing_date_column_is_config_error() {
        let ws = Worksheet::new("白条市场", vec![vec![Cell::text("时间"), Cell::text("价格")]]);
        let config = WhiteStripConfig {
            header_row: 1,
            sub_header_row: None,
            metrics_from_columns: vec![rule("价格", "WS_PRICE")],
        };
        let defaults = ProfileDefaults::default();
        let err = parse(&ws, &config, &ctx("白条市场", &defaults)).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_config_needs_metric_columns() {
        let empty: WhiteStripConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(matches!(empty.validate(), Err(PipelineError::Profile(_))));

        let blank = WhiteStripConfig {
            header_row: 1,
            sub_header_row: None,
            metrics_from_columns: vec![rule(" ", "WS_PRICE")],
        };
        assert!(blank.validate().is_err());
    }
}
