//! Narrow tables: one date per row, one value per column.

use serde::Deserialize;

use super::{zero_based, DraftParts, FieldMap, MetricTemplate, ParseContext, ParseOutput};
use crate::dates::{in_business_range, looks_like_date_label, parse_date_cell, parse_period_str};
use crate::error::{PipelineError, Result};
use crate::errors::{ErrorKind, IngestError};
use crate::observation::{MetricRef, Period, PeriodType};
use crate::values::clean_numeric;
use crate::worksheet::{Cell, Worksheet};

const HEADER_SCAN_ROWS: usize = 5;

/// What a value column's header names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    #[default]
    Metric,
    Geo,
}

/// Indexes are 1-based, as an analyst reads them in a spreadsheet.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NarrowConfig {
    pub header_row: Option<usize>,
    pub date_col: Option<usize>,
    pub value_cols: Option<Vec<usize>>,
    pub columns_are: ColumnRole,
    /// Geography for every value when columns are metrics.
    pub geo: Option<String>,
    pub metric_template: MetricTemplate,
    /// Column header to metric key.
    pub metric_keys: FieldMap,
    /// Period when neither the sheet nor the profile names one. Set from
    /// the parser id.
    #[serde(skip)]
    pub default_period: Option<PeriodType>,
}

impl NarrowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.columns_are == ColumnRole::Geo && self.metric_template.metric_key.is_none() {
            return Err(PipelineError::Profile(
                "columns_are=geo needs metric_template.metric_key".to_string(),
            ));
        }
        if let Some(row) = self.header_row {
            zero_based(row, "header_row")?;
        }
        if let Some(col) = self.date_col {
            zero_based(col, "date_col")?;
        }
        for col in self.value_cols.iter().flatten() {
            zero_based(*col, "value_cols")?;
        }
        Ok(())
    }
}

/// Period of one row: a date cell, or a `start~end` label spanning a week
/// or an arbitrary range.
fn row_period(cell: &Cell, period_type: PeriodType) -> Option<Period> {
    if let Some(date) = parse_date_cell(cell) {
        return Some(Period::for_type(period_type, date));
    }
    let (start, end) = parse_period_str(&cell.as_text())?;
    let span_type = match period_type {
        PeriodType::Week | PeriodType::Range => period_type,
        _ if end - start == chrono::Duration::days(6) => PeriodType::Week,
        _ => PeriodType::Range,
    };
    Some(Period::span(span_type, start, end))
}

/// First row holding a date-like label, else row 0.
fn detect_header(ws: &Worksheet) -> usize {
    (0..HEADER_SCAN_ROWS.min(ws.row_count()))
        .find(|&row| ws.row_texts(row).iter().any(|t| looks_like_date_label(t)))
        .unwrap_or(0)
}

pub fn parse(ws: &Worksheet, config: &NarrowConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    if ws.row_count() == 0 {
        return Ok(out);
    }

    let header_row = match config.header_row {
        Some(row) => zero_based(row, "header_row")?,
        None => detect_header(ws),
    };
    let date_col = match config.date_col {
        Some(col) => zero_based(col, "date_col")?,
        None => (0..ws.col_count())
            .find(|&col| looks_like_date_label(&ws.text(header_row, col)))
            .unwrap_or(0),
    };
    let value_cols: Vec<usize> = match &config.value_cols {
        Some(cols) => cols
            .iter()
            .map(|c| zero_based(*c, "value_cols"))
            .collect::<Result<_>>()?,
        None => (0..ws.col_count())
            .filter(|&col| col != date_col && !ws.text(header_row, col).is_empty())
            .collect(),
    };
    if value_cols.is_empty() {
        return Err(PipelineError::config(format!(
            "sheet '{}': no value columns next to the date column",
            ws.name
        )));
    }

    let period_type = ctx.period_type(
        config.metric_template.period_type,
        config.default_period.unwrap_or(PeriodType::Day),
    );
    let columns: Vec<(usize, MetricRef, Option<String>)> = value_cols
        .into_iter()
        .map(|col| {
            let header = ws.text(header_row, col);
            let header = if header.is_empty() {
                format!("Column_{}", col + 1)
            } else {
                header
            };
            match config.columns_are {
                ColumnRole::Metric => {
                    let mut metric = config.metric_template.metric_for(ctx.source_code, &header);
                    if let Some(key) = config.metric_keys.get(&header) {
                        metric.key = key.clone();
                    }
                    (col, metric, config.geo.clone())
                }
                ColumnRole::Geo => (
                    col,
                    config.metric_template.sheet_metric(ctx.source_code, ctx.sheet_name),
                    Some(header),
                ),
            }
        })
        .collect();

    for row in header_row + 1..ws.row_count() {
        if ws.is_row_empty(row) {
            continue;
        }
        let date_cell = ws.value(row, date_col);
        if date_cell.is_empty() {
            continue;
        }
        let Some(period) = row_period(date_cell, period_type) else {
            // footnotes and section titles carry no values; only a dated row
            // with data behind an unreadable date is worth reporting
            let has_values = columns.iter().any(|(col, _, _)| clean_numeric(ws.raw(row, *col)).is_some());
            if has_values {
                out.issues.push(
                    IngestError::new(
                        ErrorKind::DateParseFailed,
                        format!("cannot parse date '{}'", date_cell.as_text()),
                    )
                    .at_cell(ctx.sheet_name, row, date_col)
                    .with_raw_value(date_cell.as_text()),
                );
            }
            continue;
        };
        if !period.key_date().is_some_and(in_business_range) {
            continue;
        }

        for (col, metric, geo) in &columns {
            let Some(value) = clean_numeric(ws.raw(row, *col)) else {
                continue;
            };
            out.observations.push(ctx.draft(DraftParts {
                metric: metric.clone(),
                period,
                value,
                geo: geo.clone(),
                tags: config.metric_template.tags.clone(),
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
    use crate::fingerprint::dedup_key;
    use crate::observation::Tags;
    use crate::parsers::ProfileDefaults;
    use crate::worksheet::Cell;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn ctx<'a>(sheet: &'a str, defaults: &'a ProfileDefaults) -> ParseContext<'a> {
        ParseContext {
            sheet_name: sheet,
            source_code: "YONGYI",
            defaults,
        }
    }

    // -------------------------------------------------------------------------
    // METRIC COLUMNS
    // -------------------------------------------------------------------------

    #[test]
    fn test_narrow_single_metric_column_is_national() {
        let ws = Worksheet::new(
            "价格",
            vec![
                vec![Cell::text("日期"), Cell::text("Region A price")],
                vec![Cell::text("2024-01-01"), Cell::Number(15.2)],
            ],
        );
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &NarrowConfig::default(), &ctx("价格", &defaults)).unwrap();

        assert_eq!(out.observations.len(), 1);
        let obs = &out.observations[0];
        assert_eq!(obs.value, 15.2);
        assert_eq!(obs.geo_code, None);
        assert_eq!(obs.metric.key, "YONGYI_REGION_A_PRICE");
        assert_eq!(obs.period, Period::day(d(2024, 1, 1)));
        assert_eq!(
            obs.dedup_key,
            dedup_key("YONGYI", "价格", "YONGYI_REGION_A_PRICE", None, Some(d(2024, 1, 1)), &Tags::new())
        );
        assert_eq!(obs.location.to_string(), "xls:sheet='价格':row=2:col=2");
    }

    #[test]
    fn test_narrow_header_detected_below_title_and_keys_mapped() {
        let ws = Worksheet::new(
            "价格+宰量",
            vec![
                vec![Cell::text("涌益咨询 日度数据")],
                vec![Cell::text("日期"), Cell::text("均价"), Cell::text("宰量")],
                vec![Cell::Number(45292.0), Cell::text("15.2"), Cell::text("12,345")],
                vec![Cell::Number(45293.0), Cell::text("-"), Cell::Number(12000.0)],
            ],
        );
        let config = NarrowConfig {
            metric_keys: [
                ("均价".to_string(), "YY_PRICE".to_string()),
                ("宰量".to_string(), "YY_SLAUGHTER".to_string()),
            ]
            .into(),
            ..NarrowConfig::default()
        };
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &config, &ctx("价格+宰量", &defaults)).unwrap();

        assert_eq!(out.observations.len(), 3);
        assert!(out.issues.is_empty());
        assert_eq!(out.observations[1].metric.key, "YY_SLAUGHTER");
        assert_eq!(out.observations[1].value, 12345.0);
        assert_eq!(out.observations[1].raw_value.as_deref(), Some("12,345"));
        assert_eq!(out.observations[2].period.obs_date, Some(d(2024, 1, 2)));
    }

    #[test]
    fn test_narrow_weekly_period_from_template() {
        let ws = Worksheet::new(
            "周度",
            vec![
                vec![Cell::text("日期"), Cell::text("均重")],
                vec![Cell::text("2024-01-11"), Cell::Number(125.0)],
            ],
        );
        let config: NarrowConfig =
            serde_json::from_value(serde_json::json!({"metric_template": {"period_type": "week"}})).unwrap();
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &config, &ctx("周度", &defaults)).unwrap();
        let period = out.observations[0].period;
        assert_eq!(period.period_type, PeriodType::Week);
        assert_eq!(period.start, Some(d(2024, 1, 5)));
        assert_eq!(period.end, Some(d(2024, 1, 11)));
    }

    #[test]
    fn test_narrow_period_label_rows() {
        let ws = Worksheet::new(
            "周度",
            vec![
                vec![Cell::text("周期"), Cell::text("出栏均重")],
                vec![Cell::text("2024-01-05~2024-01-11"), Cell::Number(125.0)],
                vec![Cell::text("2024-01-12～2024-01-25"), Cell::Number(126.0)],
            ],
        );
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &NarrowConfig::default(), &ctx("周度", &defaults)).unwrap();

        assert!(out.issues.is_empty());
        let week = out.observations[0].period;
        assert_eq!(week.period_type, PeriodType::Week);
        assert_eq!(week.start, Some(d(2024, 1, 5)));
        assert_eq!(week.end, Some(d(2024, 1, 11)));
        assert_eq!(out.observations[1].period.period_type, PeriodType::Range);
    }

    #[test]
    fn test_narrow_default_period_yields_to_profile() {
        let ws = Worksheet::new(
            "周度",
            vec![
                vec![Cell::text("日期"), Cell::text("均重")],
                vec![Cell::text("2024-01-11"), Cell::Number(125.0)],
            ],
        );
        let config = NarrowConfig {
            default_period: Some(PeriodType::Week),
            ..NarrowConfig::default()
        };
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &config, &ctx("周度", &defaults)).unwrap();
        assert_eq!(out.observations[0].period.start, Some(d(2024, 1, 5)));

        let monthly = ProfileDefaults {
            period_type: Some(PeriodType::Month),
            ..ProfileDefaults::default()
        };
        let out = parse(&ws, &config, &ctx("周度", &monthly)).unwrap();
        assert_eq!(out.observations[0].period.period_type, PeriodType::Month);
    }

    // -------------------------------------------------------------------------
    // GEO COLUMNS
    // -------------------------------------------------------------------------

    #[test]
    fn test_narrow_geo_columns_share_one_metric() {
        let ws = Worksheet::new(
            "分省",
            vec![
                vec![Cell::text("日期"), Cell::text("河北省"), Cell::text("全国")],
                vec![Cell::text("2024-01-01"), Cell::Number(10.0), Cell::Number(11.0)],
            ],
        );
        let config: NarrowConfig = serde_json::from_value(serde_json::json!({
            "columns_are": "geo",
            "metric_template": {"metric_key": "YY_PROVINCE_PRICE"}
        }))
        .unwrap();
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &config, &ctx("分省", &defaults)).unwrap();

        assert_eq!(out.observations.len(), 2);
        assert!(out.observations.iter().all(|o| o.metric.key == "YY_PROVINCE_PRICE"));
        assert_eq!(out.observations[0].geo_code.as_deref(), Some("河北"));
        assert_eq!(out.observations[1].geo_code, None);
    }

    #[test]
    fn test_narrow_geo_columns_require_metric_key() {
        let config = NarrowConfig {
            columns_are: ColumnRole::Geo,
            ..NarrowConfig::default()
        };
        assert!(config.validate().is_err());
        let zero = NarrowConfig {
            date_col: Some(0),
            ..NarrowConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    // -------------------------------------------------------------------------
    // BAD ROWS
    // -------------------------------------------------------------------------

    #[test]
    fn test_narrow_bad_date_with_values_is_reported() {
        let ws = Worksheet::new(
            "价格",
            vec![
                vec![Cell::text("日期"), Cell::text("价格")],
                vec![Cell::text("2024-01-01"), Cell::Number(15.2)],
                vec![Cell::text("ABCD"), Cell::Number(15.3)],
                vec![Cell::text("2024-01-03"), Cell::Number(15.4)],
                vec![Cell::text("注：数据来源涌益"), Cell::Empty],
            ],
        );
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &NarrowConfig::default(), &ctx("价格", &defaults)).unwrap();

        assert_eq!(out.observations.len(), 2);
        assert_eq!(out.issues.len(), 1);
        let issue = &out.issues[0];
        assert_eq!(issue.kind, ErrorKind::DateParseFailed);
        assert_eq!(issue.row_no, Some(3));
        assert_eq!(issue.col_name.as_deref(), Some("1"));
        assert_eq!(issue.raw_value.as_deref(), Some("ABCD"));
    }

    #[test]
    fn test_narrow_header_only_sheet_is_empty() {
        let ws = Worksheet::new("价格", vec![vec![Cell::text("日期"), Cell::text("价格")]]);
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &NarrowConfig::default(), &ctx("价格", &defaults)).unwrap();
        assert!(out.observations.is_empty());
        assert!(out.issues.is_empty());
    }
}
