//! Workbook loading: spreadsheet bytes to [`Worksheet`]s in file-declaration order.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Dimensions, Range, Reader, Sheets};
use tracing::{debug, warn};

use crate::dates::from_excel_serial;
use crate::error::{PipelineError, Result};
use crate::worksheet::{Cell, MergeRect, Worksheet};

/// Opens xls/xlsx/xlsb/ods content. Any failure here means the file is
/// unreadable and the whole batch fails.
pub fn load_workbook(bytes: &[u8]) -> Result<Vec<Worksheet>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| PipelineError::Workbook(e.to_string()))?;

    if let Sheets::Xlsx(ref mut xlsx) = workbook {
        if let Err(e) = xlsx.load_merged_regions() {
            warn!(error = %e, "Failed to load merged regions, continuing without merge geometry");
        }
    }

    let names = workbook.sheet_names().to_vec();
    let mut sheets = Vec::with_capacity(names.len());
    for name in names {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| PipelineError::Workbook(format!("sheet '{}': {}", name, e)))?;
        let merges = merged_regions(&workbook, &name);
        let sheet = worksheet_from_range(&name, &range).with_merges(merges);
        debug!(
            sheet = %name,
            rows = sheet.row_count(),
            cols = sheet.col_count(),
            merges = sheet.merges.len(),
            "Loaded sheet"
        );
        sheets.push(sheet);
    }

    if sheets.is_empty() {
        return Err(PipelineError::Workbook("workbook has no sheets".to_string()));
    }
    Ok(sheets)
}

fn merged_regions<RS>(workbook: &Sheets<RS>, name: &str) -> Vec<MergeRect>
where
    RS: std::io::Read + std::io::Seek,
{
    let dims: Vec<Dimensions> = match workbook {
        Sheets::Xlsx(xlsx) => xlsx
            .merged_regions_by_sheet(name)
            .into_iter()
            .map(|(_, _, d)| d.clone())
            .collect(),
        Sheets::Xls(xls) => xls.worksheet_merge_cells(name).unwrap_or_default(),
        _ => Vec::new(),
    };
    dims.into_iter()
        .map(|d| {
            MergeRect::new(
                d.start.0 as usize,
                d.start.1 as usize,
                d.end.0 as usize,
                d.end.1 as usize,
            )
        })
        .collect()
}

/// Builds a grid anchored at A1 so cell positions stay absolute even when
/// the used range starts further down.
fn worksheet_from_range(name: &str, range: &Range<Data>) -> Worksheet {
    let (row_off, col_off) = match range.start() {
        Some((r, c)) => (r as usize, c as usize),
        None => return Worksheet::new(name, Vec::new()),
    };
    let (height, width) = range.get_size();
    let mut rows = vec![vec![Cell::Empty; col_off + width]; row_off + height];
    for (r, c, data) in range.cells() {
        rows[row_off + r][col_off + c] = cell_from_data(data);
    }
    Worksheet::new(name, rows)
}

pub fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            match from_excel_serial(serial) {
                Some(date) => {
                    let secs = ((serial.fract() * 86_400.0).round() as u32).min(86_399);
                    let time = chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
                        .unwrap_or(chrono::NaiveTime::MIN);
                    Cell::DateTime(date.and_time(time))
                }
                None => Cell::Number(serial),
            }
        }
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
    }
}
