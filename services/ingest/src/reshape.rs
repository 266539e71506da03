//! Wide-table reshaping: classify layouts and melt wide sheets into long tuples.

use chrono::NaiveDate;
use serde::Serialize;

use crate::dates::parse_date_cell;
use crate::error::{PipelineError, Result};
use crate::values::{clean_numeric, CleanValue};
use crate::worksheet::{Cell, Worksheet};

const START_ANCHORS: &[&str] = &["开始日期", "起始日期", "start"];
const END_ANCHORS: &[&str] = &["结束日期", "end"];
const HEADER_SCAN_ROWS: usize = 10;
const HEADER_SCAN_COLS: usize = 20;
const FIELD_SEPARATOR: &str = " / ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableShape {
    /// One date per row.
    Narrow,
    /// Dates or entities spread across columns.
    Wide,
}

/// Narrow when more than half of the non-empty first-column values are dates.
pub fn classify(sample_rows: &[Vec<Cell>]) -> TableShape {
    let firsts: Vec<&Cell> = sample_rows
        .iter()
        .filter_map(|row| row.first())
        .filter(|c| !c.is_empty())
        .collect();
    if firsts.is_empty() {
        return TableShape::Wide;
    }
    let dated = firsts.iter().filter(|c| parse_date_cell(c).is_some()).count();
    if dated * 2 > firsts.len() {
        TableShape::Narrow
    } else {
        TableShape::Wide
    }
}

/// One melted value of a single-header wide table. Positions are 0-based.
#[derive(Debug, Clone, PartialEq)]
pub struct WideValue {
    pub region: String,
    pub date: NaiveDate,
    pub value: CleanValue,
    pub row: usize,
    pub col: usize,
}

/// Melts `[entity, date1, date2, ...]` into (entity, date, value).
///
/// When `date_col_start` is unset the first header cell right of the entity
/// column that parses as a date marks the boundary. Header cells after the
/// boundary that are not dates are ignored, as are absent values.
pub fn melt_wide_single_header(
    ws: &Worksheet,
    header_row: usize,
    entity_col: usize,
    date_col_start: Option<usize>,
) -> Result<Vec<WideValue>> {
    let width = ws.col_count();
    let start = match date_col_start {
        Some(col) => col,
        None => (entity_col + 1..width)
            .find(|&col| parse_date_cell(ws.value(header_row, col)).is_some())
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "sheet '{}': no date columns found in header row {}; set date_col_start",
                    ws.name,
                    header_row + 1
                ))
            })?,
    };

    let date_cols: Vec<(usize, NaiveDate)> = (start..width)
        .filter_map(|col| parse_date_cell(ws.value(header_row, col)).map(|d| (col, d)))
        .collect();
    if date_cols.is_empty() {
        return Err(PipelineError::config(format!(
            "sheet '{}': date_col_start {} has no parseable date headers",
            ws.name,
            start + 1
        )));
    }

    let mut out = Vec::new();
    for row in header_row + 1..ws.row_count() {
        let region = ws.text(row, entity_col);
        if region.is_empty() {
            continue;
        }
        for &(col, date) in &date_cols {
            if let Some(value) = clean_numeric(ws.raw(row, col)) {
                out.push(WideValue {
                    region: region.clone(),
                    date,
                    value,
                    row,
                    col,
                });
            }
        }
    }
    Ok(out)
}

/// One melted value of a multi-row-header wide table.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodValue {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    /// Row label from `region_col`, when one is configured.
    pub region: Option<String>,
    /// All stacked header fragments joined with " / ".
    pub field: String,
    pub field_parts: Vec<String>,
    pub value: CleanValue,
    pub row: usize,
    pub col: usize,
}

/// Layout located by [`locate_period_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodHeader {
    pub header_row: usize,
    pub start_col: usize,
    pub end_col: usize,
}

/// CJK anchors match anywhere in the label; ASCII anchors only as a whole
/// word, so `trend` or `weekend` never read as `end`.
fn has_anchor(label: &str, anchors: &[&str]) -> bool {
    let label = label.to_lowercase();
    anchors.iter().any(|anchor| {
        if anchor.is_ascii() {
            label
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|word| word == *anchor)
        } else {
            label.contains(anchor)
        }
    })
}

/// Finds the header row and its start/end date columns. Missing either
/// column is a configuration error, never a guess.
pub fn locate_period_header(ws: &Worksheet, header_start_row: Option<usize>) -> Result<PeriodHeader> {
    let header_row = match header_start_row {
        Some(row) => row,
        None => (0..HEADER_SCAN_ROWS.min(ws.row_count()))
            .find(|&row| {
                (0..HEADER_SCAN_COLS.min(ws.col_count())).any(|col| {
                    let text = ws.text(row, col);
                    has_anchor(&text, START_ANCHORS) || has_anchor(&text, END_ANCHORS)
                })
            })
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "sheet '{}': no start/end date header in the first {} rows; set header_start_row",
                    ws.name, HEADER_SCAN_ROWS
                ))
            })?,
    };

    let mut start_col = None;
    let mut end_col = None;
    for col in 0..ws.col_count() {
        let text = ws.text(header_row, col);
        if text.is_empty() {
            continue;
        }
        if has_anchor(&text, START_ANCHORS) {
            start_col.get_or_insert(col);
        } else if has_anchor(&text, END_ANCHORS) {
            end_col.get_or_insert(col);
        }
    }
    match (start_col, end_col) {
        (Some(start_col), Some(end_col)) => Ok(PeriodHeader {
            header_row,
            start_col,
            end_col,
        }),
        _ => Err(PipelineError::config(format!(
            "sheet '{}': could not locate both start and end date columns in row {}",
            ws.name,
            header_row + 1
        ))),
    }
}

/// Melts `[start, end, field columns...]` under `header_row_count` stacked
/// header rows into one tuple per (data row, field column).
pub fn melt_wide_multirow_header(
    ws: &Worksheet,
    header_start_row: Option<usize>,
    header_row_count: usize,
    region_col: Option<usize>,
) -> Result<Vec<PeriodValue>> {
    let header = locate_period_header(ws, header_start_row)?;
    let header_rows = header_row_count.max(1);
    let first_field_col = header.start_col.max(header.end_col) + 1;
    let width = ws.col_count();

    // Forward-fill the top header row so unmerged spans still label every column.
    let mut top: Vec<String> = Vec::with_capacity(width);
    let mut prev = String::new();
    for col in 0..width {
        let text = ws.text(header.header_row, col);
        if !text.is_empty() {
            prev = text.clone();
        }
        top.push(if text.is_empty() { prev.clone() } else { text });
    }

    let field_parts: Vec<Vec<String>> = (0..width)
        .map(|col| {
            let mut parts = vec![top[col].clone()];
            for row in header.header_row + 1..header.header_row + header_rows {
                parts.push(ws.text(row, col));
            }
            parts.retain(|p| !p.is_empty());
            parts
        })
        .collect();

    let mut out = Vec::new();
    for row in header.header_row + header_rows..ws.row_count() {
        let week_start = parse_date_cell(ws.value(row, header.start_col));
        let week_end = parse_date_cell(ws.value(row, header.end_col));
        let (Some(week_start), Some(week_end)) = (week_start, week_end) else {
            continue;
        };
        let region = match region_col {
            Some(col) => {
                let label = ws.text(row, col);
                if label.is_empty() {
                    continue;
                }
                Some(label)
            }
            None => None,
        };
        for col in first_field_col..width {
            if Some(col) == region_col || field_parts[col].is_empty() {
                continue;
            }
            let Some(value) = clean_numeric(ws.raw(row, col)) else {
                continue;
            };
            out.push(PeriodValue {
                week_start,
                week_end,
                region: region.clone(),
                field: field_parts[col].join(FIELD_SEPARATOR),
                field_parts: field_parts[col].clone(),
                value,
                row,
                col,
            });
        }
    }
    Ok(out)
}
