//! Wide tables: dates, periods or geographies spread across columns.

use chrono::Duration;
use serde::Deserialize;

use super::{zero_based, DraftParts, FieldMap, MetricTemplate, ParseContext, ParseOutput};
use crate::codec::extract_date_grouped_subcolumns;
use crate::dates::{in_business_range, parse_date_cell};
use crate::error::{PipelineError, Result};
use crate::geo::{is_national, is_province, is_region};
use crate::observation::{MetricRef, Period, PeriodType, Tags};
use crate::reshape::{melt_wide_multirow_header, melt_wide_single_header};
use crate::values::clean_numeric;
use crate::worksheet::Worksheet;

const FIELD_TAG: &str = "field";

fn one() -> usize {
    1
}

fn two() -> usize {
    2
}

/// `[entity, date1, date2, ...]`. Indexes are 1-based.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WideSingleConfig {
    #[serde(default = "one")]
    pub header_row: usize,
    #[serde(default = "one")]
    pub entity_col: usize,
    #[serde(default)]
    pub date_col_start: Option<usize>,
    #[serde(default)]
    pub metric_template: MetricTemplate,
}

impl WideSingleConfig {
    pub fn validate(&self) -> Result<()> {
        zero_based(self.header_row, "header_row")?;
        zero_based(self.entity_col, "entity_col")?;
        if let Some(col) = self.date_col_start {
            if zero_based(col, "date_col_start")? < self.entity_col {
                return Err(PipelineError::Profile(format!(
                    "date_col_start {} must come after entity_col {}",
                    col, self.entity_col
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WideLayout {
    /// Start/end date columns, then one column per (stacked) field.
    PeriodColumns,
    /// A date spanning a run of sub-columns, one row per geography.
    DateGroups,
}

/// Multi-row header tables. Indexes are 1-based.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WideMultiConfig {
    /// Filled from the parser id when absent.
    #[serde(default)]
    pub layout: Option<WideLayout>,
    #[serde(default)]
    pub header_start_row: Option<usize>,
    #[serde(default = "two")]
    pub header_row_count: usize,
    #[serde(default)]
    pub region_col: Option<usize>,
    #[serde(default = "one")]
    pub date_row: usize,
    #[serde(default = "two")]
    pub subcol_row: usize,
    #[serde(default = "one")]
    pub row_label_col: usize,
    #[serde(default)]
    pub data_start_row: Option<usize>,
    #[serde(default)]
    pub metric_template: MetricTemplate,
    /// Field name to metric key.
    #[serde(default)]
    pub field_metrics: FieldMap,
}

impl WideMultiConfig {
    pub fn validate(&self) -> Result<()> {
        if self.header_row_count == 0 {
            return Err(PipelineError::Profile("header_row_count must be at least 1".to_string()));
        }
        for (index, what) in [
            (self.header_start_row, "header_start_row"),
            (self.region_col, "region_col"),
            (Some(self.date_row), "date_row"),
            (Some(self.subcol_row), "subcol_row"),
            (Some(self.row_label_col), "row_label_col"),
            (self.data_start_row, "data_start_row"),
        ] {
            if let Some(index) = index {
                zero_based(index, what)?;
            }
        }
        Ok(())
    }

    fn metric_for_field(&self, source_code: &str, field: &str) -> MetricRef {
        let mut metric = self.metric_template.metric_for(source_code, field);
        if let Some(key) = self.field_metrics.get(field) {
            metric.key = key.clone();
        }
        metric
    }
}

fn field_tags(template: &MetricTemplate, field: &str) -> Tags {
    let mut tags = template.tags.clone();
    tags.insert(FIELD_TAG.to_string(), field.to_string());
    tags
}

fn is_geo_label(label: &str) -> bool {
    is_province(label) || is_region(label) || is_national(label)
}

pub fn parse_single(ws: &Worksheet, config: &WideSingleConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    if ws.row_count() == 0 {
        return Ok(out);
    }
    let date_col_start = config
        .date_col_start
        .map(|c| zero_based(c, "date_col_start"))
        .transpose()?;
    let melted = melt_wide_single_header(
        ws,
        zero_based(config.header_row, "header_row")?,
        zero_based(config.entity_col, "entity_col")?,
        date_col_start,
    )?;

    let metric = config.metric_template.sheet_metric(ctx.source_code, ctx.sheet_name);
    let period_type = ctx.period_type(config.metric_template.period_type, PeriodType::Day);
    for wv in melted {
        if !in_business_range(wv.date) {
            continue;
        }
        out.observations.push(ctx.draft(DraftParts {
            metric: metric.clone(),
            period: Period::for_type(period_type, wv.date),
            value: wv.value,
            geo: Some(wv.region),
            tags: config.metric_template.tags.clone(),
            row: wv.row,
            col: wv.col,
        }));
    }
    Ok(out)
}

pub fn parse_multi(ws: &Worksheet, config: &WideMultiConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    if ws.row_count() == 0 {
        return Ok(ParseOutput::default());
    }
    match config.layout.unwrap_or(WideLayout::PeriodColumns) {
        WideLayout::PeriodColumns => parse_period_columns(ws, config, ctx),
        WideLayout::DateGroups => parse_date_groups(ws, config, ctx),
    }
}

fn parse_period_columns(ws: &Worksheet, config: &WideMultiConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    let header_start_row = config
        .header_start_row
        .map(|r| zero_based(r, "header_start_row"))
        .transpose()?;
    let region_col = config
        .region_col
        .map(|c| zero_based(c, "region_col"))
        .transpose()?;
    let melted = melt_wide_multirow_header(ws, header_start_row, config.header_row_count, region_col)?;

    for pv in melted {
        // without a region column a geography heads the stacked header
        let (geo, field) = match pv.region {
            Some(region) => (Some(region), pv.field),
            None => match pv.field_parts.split_first() {
                Some((first, rest)) if is_geo_label(first) => {
                    let field = if rest.is_empty() {
                        first.clone()
                    } else {
                        rest.join(" / ")
                    };
                    (Some(first.clone()), field)
                }
                _ => (None, pv.field),
            },
        };
        let fallback = if pv.week_end - pv.week_start == Duration::days(6) {
            PeriodType::Week
        } else {
            PeriodType::Range
        };
        let period_type = ctx.period_type(config.metric_template.period_type, fallback);
        out.observations.push(ctx.draft(DraftParts {
            metric: config.metric_for_field(ctx.source_code, &field),
            period: Period::span(period_type, pv.week_start, pv.week_end),
            value: pv.value,
            geo,
            tags: field_tags(&config.metric_template, &field),
            row: pv.row,
            col: pv.col,
        }));
    }
    Ok(out)
}

fn parse_date_groups(ws: &Worksheet, config: &WideMultiConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    let date_row = zero_based(config.date_row, "date_row")?;
    let subcol_row = zero_based(config.subcol_row, "subcol_row")?;
    let label_col = zero_based(config.row_label_col, "row_label_col")?;
    let data_start = match config.data_start_row {
        Some(row) => zero_based(row, "data_start_row")?,
        None => date_row.max(subcol_row) + 1,
    };

    let groups: Vec<_> = extract_date_grouped_subcolumns(ws, date_row, subcol_row)
        .into_iter()
        .filter_map(|g| {
            let date = parse_date_cell(ws.value(date_row, g.col_start)).filter(|d| in_business_range(*d))?;
            Some((date, g))
        })
        .collect();
    if groups.is_empty() {
        return Err(PipelineError::config(format!(
            "sheet '{}': no dated column groups in row {}",
            ws.name, config.date_row
        )));
    }

    let period_type = ctx.period_type(config.metric_template.period_type, PeriodType::Day);
    for row in data_start..ws.row_count() {
        let label = ws.text(row, label_col);
        if label.is_empty() {
            continue;
        }
        for (date, group) in &groups {
            for (offset, field) in group.subcolumns.iter().enumerate() {
                let col = group.col_start + offset;
                if col > group.col_end || col == label_col {
                    continue;
                }
                let Some(value) = clean_numeric(ws.raw(row, col)) else {
                    continue;
                };
                out.observations.push(ctx.draft(DraftParts {
                    metric: config.metric_for_field(ctx.source_code, field),
                    period: Period::for_type(period_type, *date),
                    value,
                    geo: Some(label.clone()),
                    tags: field_tags(&config.metric_template, field),
                    row,
                    col,
                }));
            }
        }
    }
    Ok(out)
}
