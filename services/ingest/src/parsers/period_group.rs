//! Weekly tables keyed by start and end date columns, followed by group
//! columns whose headers name a scale, weight band or farming mode.
//!
//! All group columns share one metric; the header text and the dimensions
//! read from it become tags, so every column stays its own series.

use chrono::Duration;
use serde::Deserialize;

use super::{zero_based, DraftParts, MetricTemplate, ParseContext, ParseOutput};
use crate::dates::{in_business_range, parse_date_cell};
use crate::dimensions::extract_tags_from_text;
use crate::error::{PipelineError, Result};
use crate::errors::{ErrorKind, IngestError};
use crate::observation::{Period, PeriodType, Tags};
use crate::values::clean_numeric;
use crate::worksheet::Worksheet;

const GROUP_TAG: &str = "group";

fn one() -> usize {
    1
}

fn start_label() -> String {
    "开始日期".to_string()
}

fn end_label() -> String {
    "结束日期".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PeriodGroupConfig {
    /// 1-based.
    #[serde(default = "one")]
    pub header_row: usize,
    /// Exact header labels of the period columns.
    #[serde(default = "start_label")]
    pub start_date_col: String,
    #[serde(default = "end_label")]
    pub end_date_col: String,
    #[serde(default)]
    pub metric_template: MetricTemplate,
}

impl Default for PeriodGroupConfig {
    fn default() -> Self {
        Self {
            header_row: one(),
            start_date_col: start_label(),
            end_date_col: end_label(),
            metric_template: MetricTemplate::default(),
        }
    }
}

impl PeriodGroupConfig {
    pub fn validate(&self) -> Result<()> {
        zero_based(self.header_row, "header_row")?;
        if self.start_date_col.trim().is_empty() || self.end_date_col.trim().is_empty() {
            return Err(PipelineError::Profile(
                "start_date_col and end_date_col must name header labels".to_string(),
            ));
        }
        Ok(())
    }
}

fn group_tags(template: &MetricTemplate, header: &str) -> Tags {
    let mut tags = template.tags.clone();
    tags.extend(extract_tags_from_text(header));
    tags.insert(GROUP_TAG.to_string(), header.to_string());
    tags
}

pub fn parse(ws: &Worksheet, config: &PeriodGroupConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    if ws.row_count() == 0 {
        return Ok(out);
    }
    let header_row = zero_based(config.header_row, "header_row")?;
    let find = |label: &str| {
        (0..ws.col_count())
            .find(|&col| ws.text(header_row, col) == label.trim())
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "sheet '{}': missing column '{}' in row {}",
                    ws.name, label, config.header_row
                ))
            })
    };
    let start_col = find(&config.start_date_col)?;
    let end_col = find(&config.end_date_col)?;

    let groups: Vec<(usize, Tags)> = (end_col + 1..ws.col_count())
        .filter_map(|col| {
            let header = ws.text(header_row, col);
            (!header.is_empty()).then(|| (col, group_tags(&config.metric_template, &header)))
        })
        .collect();
    if groups.is_empty() {
        return Err(PipelineError::config(format!(
            "sheet '{}': no group columns after '{}'",
            ws.name, config.end_date_col
        )));
    }

    let metric = config.metric_template.sheet_metric(ctx.source_code, ctx.sheet_name);
    let period_type = ctx.period_type(config.metric_template.period_type, PeriodType::Week);
    for row in header_row + 1..ws.row_count() {
        let end_cell = ws.value(row, end_col);
        if end_cell.is_empty() {
            continue;
        }
        let Some(end) = parse_date_cell(end_cell).filter(|d| in_business_range(*d)) else {
            if groups.iter().any(|(col, _)| clean_numeric(ws.raw(row, *col)).is_some()) {
                out.issues.push(
                    IngestError::new(
                        ErrorKind::DateParseFailed,
                        format!("cannot parse period end '{}'", end_cell.as_text()),
                    )
                    .at_cell(ctx.sheet_name, row, end_col)
                    .with_raw_value(end_cell.as_text()),
                );
            }
            continue;
        };
        let start = parse_date_cell(ws.value(row, start_col))
            .filter(|start| *start <= end)
            .unwrap_or(end - Duration::days(6));
        let period = match period_type {
            PeriodType::Week | PeriodType::Range => Period::span(period_type, start, end),
            other => Period::for_type(other, end),
        };

        for (col, tags) in &groups {
            let Some(value) = clean_numeric(ws.raw(row, *col)) else {
                continue;
            };
            out.observations.push(ctx.draft(DraftParts {
                metric: metric.clone(),
                period,
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
    use crate::worksheet::Cell;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn ctx(defaults: &ProfileDefaults) -> ParseContext<'_> {
        ParseContext {
            sheet_name: "周度-养殖利润最新",
            source_code: "YONGYI",
            defaults,
        }
    }

    fn profit_sheet() -> Worksheet {
        Worksheet::new(
            "周度-养殖利润最新",
            vec![
                vec![
                    Cell::text("开始日期"),
                    Cell::text("结束日期"),
                    Cell::text("自繁自养"),
                    Cell::text("外购仔猪"),
                ],
                vec![
                    Cell::text("2024-01-05"),
                    Cell::text("2024-01-11"),
                    Cell::Number(-120.5),
                    Cell::Number(35.0),
                ],
                vec![Cell::Empty, Cell::text("2024-01-18"), Cell::Number(-80.0), Cell::text("-")],
                vec![Cell::text("注：单位元/头")],
            ],
        )
    }

    fn config() -> PeriodGroupConfig {
        PeriodGroupConfig {
            metric_template: MetricTemplate {
                metric_key: Some("YY_FARM_PROFIT".to_string()),
                ..MetricTemplate::default()
            },
            ..PeriodGroupConfig::default()
        }
    }

    // -------------------------------------------------------------------------
    // GROUP COLUMNS
    // -------------------------------------------------------------------------

    #[test]
    fn test_group_columns_become_tagged_weekly_series() {
        let defaults = ProfileDefaults::default();
        let out = parse(&profit_sheet(), &config(), &ctx(&defaults)).unwrap();

        assert!(out.issues.is_empty());
        assert_eq!(out.observations.len(), 3);
        assert!(out.observations.iter().all(|o| o.metric.key == "YY_FARM_PROFIT"));

        let own = &out.observations[0];
        assert_eq!(own.value, -120.5);
        assert_eq!(own.period, Period::span(PeriodType::Week, d(2024, 1, 5), d(2024, 1, 11)));
        assert_eq!(own.tags.get("mode").map(String::as_str), Some("自繁自养"));
        assert_eq!(own.tags.get("group").map(String::as_str), Some("自繁自养"));

        let bought = &out.observations[1];
        assert_eq!(bought.tags.get("mode").map(String::as_str), Some("外购"));
        assert_ne!(own.dedup_key, bought.dedup_key);
    }

    #[test]
    fn test_missing_start_is_derived_from_end() {
        let defaults = ProfileDefaults::default();
        let out = parse(&profit_sheet(), &config(), &ctx(&defaults)).unwrap();
        let derived = &out.observations[2];
        assert_eq!(derived.period.start, Some(d(2024, 1, 12)));
        assert_eq!(derived.period.end, Some(d(2024, 1, 18)));
        assert_eq!(derived.location.row, 3);
    }

    // -------------------------------------------------------------------------
    // BAD INPUT
    // -------------------------------------------------------------------------

    #[test]
    fn test_unreadable_end_with_values_is_reported() {
        let ws = Worksheet::new(
            "周度-养殖利润最新",
            vec![
                vec![Cell::text("开始日期"), Cell::text("结束日期"), Cell::text("规模场")],
                vec![Cell::text("2024-01-05"), Cell::text("第2周"), Cell::Number(10.0)],
            ],
        );
        let defaults = ProfileDefaults::default();
        let out = parse(&ws, &config(), &ctx(&defaults)).unwrap();
        assert!(out.observations.is_empty());
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].kind, ErrorKind::DateParseFailed);
        assert_eq!(out.issues[0].raw_value.as_deref(), Some("第2周"));
    }

    #[test]
    fn test_missing_period_column_is_config_error() {
        let ws = Worksheet::new(
            "周度-养殖利润最新",
            vec![vec![Cell::text("日期"), Cell::text("自繁自养")]],
        );
        let defaults = ProfileDefaults::default();
        let err = parse(&ws, &config(), &ctx(&defaults)).unwrap_err();
        assert!(err.is_config());

        let blank = PeriodGroupConfig {
            end_date_col: " ".to_string(),
            ..PeriodGroupConfig::default()
        };
        assert!(blank.validate().is_err());
    }
}
