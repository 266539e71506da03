//! Enterprise group sheets: CR5 daily output, the southwest summary, the
//! ten-day summary and the key-province plan table.
//!
//! Headers are classified by keyword into fixed metric keys, so the same
//! figure keeps one key whichever vendor spelling a workbook uses. The
//! layout follows the sheet name unless the config names one.

use serde::Deserialize;

use super::{DraftParts, ParseContext, ParseOutput};
use crate::dates::{in_business_range, looks_like_date_label, parse_date_cell};
use crate::error::Result;
use crate::observation::{MetricRef, Period, Tags};
use crate::values::clean_numeric;
use crate::worksheet::Worksheet;

const CR5_COMPANIES: &[&str] = &["牧原", "温氏", "双胞胎", "新希望", "德康"];
const SOUTHWEST_REGIONS: &[&str] = &["四川", "广西", "贵州", "西南样本企业"];
const SUMMARY_REGIONS: &[&str] = &["广东", "四川", "贵州", "全国CR20", "全国CR5"];
const TOTAL_LABEL: &str = "合计";

const HEAD: &str = "头";
const KG: &str = "公斤";
const YUAN_PER_KG: &str = "元/公斤";
const PERCENT: &str = "%";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnterpriseLayout {
    /// Header row, then one row per date serial.
    Cr5Daily,
    /// Region groups over metric names, then dated rows.
    SouthwestSummary,
    /// Region groups over metric names; rows carry a period label and a date.
    PeriodSummary,
    /// Provinces over dated rows of planned output.
    ProvincePlan,
}

impl EnterpriseLayout {
    /// Layout implied by a sheet name; CR5 when nothing else matches.
    pub fn for_sheet(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("cr5") {
            EnterpriseLayout::Cr5Daily
        } else if name.contains("西南汇总") || lower.contains("southwest") {
            EnterpriseLayout::SouthwestSummary
        } else if name.trim() == "汇总" {
            EnterpriseLayout::PeriodSummary
        } else if name.contains("重点省区汇总") {
            EnterpriseLayout::ProvincePlan
        } else {
            EnterpriseLayout::Cr5Daily
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnterpriseConfig {
    pub layout: Option<EnterpriseLayout>,
    pub tags: Tags,
}

/// A value column with the metric, geography and tags it feeds.
struct ValueColumn {
    col: usize,
    metric: MetricRef,
    geo: Option<String>,
    tags: Tags,
}

fn metric(key: impl Into<String>, name: &str, unit: &str, header: &str, freq: Option<&str>) -> MetricRef {
    MetricRef {
        key: key.into(),
        name: name.to_string(),
        raw_header: header.to_string(),
        unit: Some(unit.to_string()),
        freq: freq.map(str::to_string),
    }
}

fn cr5_metric(header: &str) -> Option<(MetricRef, Tags)> {
    let mut tags = Tags::new();
    let found = if header.contains("实际出栏") || header.contains("实际成交") {
        metric("CR5_DAILY_OUTPUT", "日度出栏", HEAD, header, Some("daily"))
    } else if ["月度计划", "计划日均", "计划量"].iter().any(|k| header.contains(k)) {
        metric("CR5_MONTHLY_PLAN", "计划量", HEAD, header, Some("daily"))
    } else if header.contains("全国均价") || header.contains("价格") {
        metric("CR5_PRICE", "价格", YUAN_PER_KG, header, Some("daily"))
    } else if CR5_COMPANIES.contains(&header) {
        tags.insert("company".to_string(), header.to_string());
        metric(format!("CR5_COMPANY_{}", header), "日度出栏", HEAD, header, Some("daily"))
    } else if header.contains("均重") {
        metric("CR5_AVG_WEIGHT", "均重", KG, header, Some("daily"))
    } else {
        return None;
    };
    Some((found, tags))
}

fn southwest_metric(header: &str) -> Option<MetricRef> {
    let m = |key: &str, name: &str, unit: &str| Some(metric(key, name, unit, header, Some("daily")));
    if header.contains("实际成交") {
        m("SOUTHWEST_ACTUAL_OUTPUT", "日度出栏", HEAD)
    } else if header.contains("计划日均") {
        m("SOUTHWEST_PLAN_OUTPUT", "计划出栏", HEAD)
    } else if header.contains("成交率") || header.contains("完成率") {
        m("SOUTHWEST_COMPLETION_RATE", "完成率", PERCENT)
    } else if header.contains("价格") || header.contains("MS") || header == "价" {
        m("SOUTHWEST_PRICE", "价格", YUAN_PER_KG)
    } else if header == "量" || header.contains("出栏") {
        m("SOUTHWEST_OUTPUT", "出栏量", HEAD)
    } else if header == "重" {
        m("SOUTHWEST_AVG_WEIGHT", "均重", KG)
    } else {
        None
    }
}

fn summary_metric(header: &str) -> Option<MetricRef> {
    let m = |key: &str, name: &str, unit: &str| Some(metric(key, name, unit, header, None));
    if header.contains("出栏计划") || header.contains("计划出栏量") {
        m("PROVINCE_PLAN", "计划出栏量", HEAD)
    } else if header.contains("实际出栏量") {
        m("PROVINCE_ACTUAL", "实际出栏量", HEAD)
    } else if header.contains("计划完成率") || header.contains("计划达成率") {
        m("PROVINCE_COMPLETION_RATE", "计划完成率", PERCENT)
    } else if header.contains("实际均重") || (header.contains("均重") && !header.contains("计划")) {
        m("PROVINCE_AVG_WEIGHT", "均重", KG)
    } else if header.contains("计划均重") {
        m("PROVINCE_PLAN_WEIGHT", "计划均重", KG)
    } else if header.contains("均价") && header.contains("销售") {
        m("PROVINCE_PRICE", "销售均价", YUAN_PER_KG)
    } else {
        None
    }
}

/// Group label for every column: the nearest listed label at or left of it.
fn column_groups(ws: &Worksheet, row: usize, labels: &[&str]) -> Vec<Option<String>> {
    let mut current = None;
    (0..ws.col_count())
        .map(|col| {
            let text = ws.text(row, col);
            if labels.contains(&text.as_str()) {
                current = Some(text);
            }
            current.clone()
        })
        .collect()
}

fn cr5_columns(ws: &Worksheet) -> Vec<ValueColumn> {
    (1..ws.col_count())
        .filter_map(|col| {
            let header = ws.text(0, col);
            let (metric, tags) = cr5_metric(&header)?;
            Some(ValueColumn {
                col,
                metric,
                geo: None,
                tags,
            })
        })
        .collect()
}

fn southwest_columns(ws: &Worksheet) -> Vec<ValueColumn> {
    let regions = column_groups(ws, 0, SOUTHWEST_REGIONS);
    (0..ws.col_count())
        .filter_map(|col| {
            let metric = southwest_metric(&ws.text(1, col))?;
            let region = regions[col].clone();
            let mut tags = Tags::new();
            if let Some(region) = &region {
                tags.insert("region".to_string(), region.clone());
            }
            Some(ValueColumn {
                col,
                metric,
                geo: region,
                tags,
            })
        })
        .collect()
}

fn summary_columns(ws: &Worksheet) -> Vec<ValueColumn> {
    let regions = column_groups(ws, 0, SUMMARY_REGIONS);
    (0..ws.col_count())
        .filter_map(|col| {
            let region = regions[col].clone()?;
            let metric = summary_metric(&ws.text(1, col))?;
            Some(ValueColumn {
                col,
                metric,
                geo: Some(region.clone()),
                tags: [("region".to_string(), region)].into(),
            })
        })
        .collect()
}

fn province_columns(ws: &Worksheet) -> Vec<ValueColumn> {
    (0..ws.col_count())
        .filter_map(|col| {
            let province = ws.text(1, col);
            if province.is_empty() || province == TOTAL_LABEL || looks_like_date_label(&province) {
                return None;
            }
            Some(ValueColumn {
                col,
                metric: metric("PROVINCE_PLAN", "计划量", HEAD, "计划量", Some("daily")),
                geo: Some(province.clone()),
                tags: [("region".to_string(), province)].into(),
            })
        })
        .collect()
}

/// Rows of one layout: where data starts, which columns may hold the row
/// date and which column holds a period label.
struct RowShape {
    data_start: usize,
    date_cols: &'static [usize],
    label_col: Option<usize>,
}

pub fn parse(ws: &Worksheet, config: &EnterpriseConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    let layout = config.layout.unwrap_or_else(|| EnterpriseLayout::for_sheet(ctx.sheet_name));
    let (columns, shape) = match layout {
        EnterpriseLayout::Cr5Daily => (
            cr5_columns(ws),
            RowShape {
                data_start: 1,
                date_cols: &[0],
                label_col: None,
            },
        ),
        EnterpriseLayout::SouthwestSummary => (
            southwest_columns(ws),
            RowShape {
                data_start: 2,
                date_cols: &[0, 1],
                label_col: None,
            },
        ),
        EnterpriseLayout::PeriodSummary => (
            summary_columns(ws),
            RowShape {
                data_start: 2,
                date_cols: &[1],
                label_col: Some(0),
            },
        ),
        EnterpriseLayout::ProvincePlan => (
            province_columns(ws),
            RowShape {
                data_start: 2,
                date_cols: &[0, 1],
                label_col: None,
            },
        ),
    };
    if ws.row_count() <= shape.data_start || columns.is_empty() {
        return Ok(out);
    }

    for row in shape.data_start..ws.row_count() {
        let label = shape.label_col.map(|col| ws.text(row, col));
        if label.as_ref().is_some_and(|l| l.is_empty()) {
            continue;
        }
        let Some((date, date_col)) = shape.date_cols.iter().find_map(|&col| {
            let date = parse_date_cell(ws.value(row, col)).filter(|d| in_business_range(*d))?;
            Some((date, col))
        }) else {
            continue;
        };

        for column in &columns {
            if column.col == date_col {
                continue;
            }
            let Some(value) = clean_numeric(ws.raw(row, column.col)) else {
                continue;
            };
            let mut tags = config.tags.clone();
            tags.extend(column.tags.clone());
            if let Some(label) = &label {
                tags.insert("period_label".to_string(), label.clone());
            }
            out.observations.push(ctx.draft(DraftParts {
                metric: column.metric.clone(),
                period: Period::day(date),
                value,
                geo: column.geo.clone(),
                tags,
                row,
                col: column.col,
            }));
        }
    }
    Ok(out)
}
