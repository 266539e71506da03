//! Delivery-city matrices: a province column grouping city rows, optional
//! metadata columns (premium, average weight) and one column per date.

use serde::Deserialize;

use super::{zero_based, DraftParts, MetricTemplate, ParseContext, ParseOutput};
use crate::dates::{in_business_range, parse_date_cell};
use crate::error::{PipelineError, Result};
use crate::observation::{Period, PeriodType, Tags};
use crate::values::clean_numeric;
use crate::worksheet::Worksheet;

fn one() -> usize {
    1
}

fn two() -> usize {
    2
}

fn three() -> usize {
    3
}

fn five() -> usize {
    5
}

/// Indexes are 1-based.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CityMatrixConfig {
    /// Row holding the date headers and the metadata column labels.
    #[serde(default = "one")]
    pub date_row: usize,
    #[serde(default = "one")]
    pub province_col: usize,
    #[serde(default = "two")]
    pub city_col: usize,
    /// First date column; columns between the city and this one are metadata.
    #[serde(default = "three")]
    pub date_start_col: usize,
    #[serde(default = "five")]
    pub city_start_row: usize,
    #[serde(default)]
    pub metric_template: MetricTemplate,
}

impl Default for CityMatrixConfig {
    fn default() -> Self {
        Self {
            date_row: one(),
            province_col: one(),
            city_col: two(),
            date_start_col: three(),
            city_start_row: five(),
            metric_template: MetricTemplate::default(),
        }
    }
}

impl CityMatrixConfig {
    pub fn validate(&self) -> Result<()> {
        zero_based(self.date_row, "date_row")?;
        zero_based(self.province_col, "province_col")?;
        zero_based(self.city_col, "city_col")?;
        zero_based(self.date_start_col, "date_start_col")?;
        zero_based(self.city_start_row, "city_start_row")?;
        if self.city_col == self.province_col {
            return Err(PipelineError::Profile(
                "city_col and province_col must differ".to_string(),
            ));
        }
        if self.date_start_col <= self.city_col.max(self.province_col) {
            return Err(PipelineError::Profile(format!(
                "date_start_col {} must come after the province and city columns",
                self.date_start_col
            )));
        }
        if self.city_start_row <= self.date_row {
            return Err(PipelineError::Profile(format!(
                "city_start_row {} must come after date_row {}",
                self.city_start_row, self.date_row
            )));
        }
        Ok(())
    }
}

pub fn parse(ws: &Worksheet, config: &CityMatrixConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    if ws.row_count() == 0 {
        return Ok(out);
    }
    let date_row = zero_based(config.date_row, "date_row")?;
    let province_col = zero_based(config.province_col, "province_col")?;
    let city_col = zero_based(config.city_col, "city_col")?;
    let date_start = zero_based(config.date_start_col, "date_start_col")?;
    let city_start = zero_based(config.city_start_row, "city_start_row")?;

    let dates: Vec<_> = (date_start..ws.col_count())
        .filter_map(|col| {
            let date = parse_date_cell(ws.value(date_row, col)).filter(|d| in_business_range(*d))?;
            Some((col, date))
        })
        .collect();
    if dates.is_empty() {
        return Err(PipelineError::config(format!(
            "sheet '{}': no date headers in row {} from column {}",
            ws.name, config.date_row, config.date_start_col
        )));
    }
    let meta_cols: Vec<(usize, String)> = (city_col + 1..date_start)
        .filter(|col| *col != province_col)
        .filter_map(|col| {
            let label = ws.text(date_row, col);
            (!label.is_empty()).then(|| (col, label.to_lowercase()))
        })
        .collect();

    let metric = config.metric_template.sheet_metric(ctx.source_code, ctx.sheet_name);
    let period_type = ctx.period_type(config.metric_template.period_type, PeriodType::Day);
    let mut province: Option<String> = None;
    for row in city_start..ws.row_count() {
        // merged province cells read through to every city row they span
        let label = ws.text(row, province_col);
        if !label.is_empty() {
            province = Some(label);
        }
        let city = ws.text(row, city_col);
        let Some(province) = province.as_ref().filter(|_| !city.is_empty()) else {
            continue;
        };

        let mut tags: Tags = config.metric_template.tags.clone();
        tags.insert("province".to_string(), province.clone());
        tags.insert("city".to_string(), city.clone());
        for (col, key) in &meta_cols {
            let value = ws.text(row, *col);
            if !value.is_empty() {
                tags.insert(key.clone(), value);
            }
        }

        for (col, date) in &dates {
            let Some(value) = clean_numeric(ws.raw(row, *col)) else {
                continue;
            };
            out.observations.push(ctx.draft(DraftParts {
                metric: metric.clone(),
                period: Period::for_type(period_type, *date),
                value,
                geo: Some(city.clone()),
                tags: tags.clone(),
                row,
                col: *col,
            }));
        }
    }
    Ok(out)
}
