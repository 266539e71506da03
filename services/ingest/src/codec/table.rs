//! Audit-grade serialization of a worksheet grid with merge geometry.

use serde::{Deserialize, Serialize};

use crate::worksheet::{Cell, MergeRect, Worksheet};

/// Bytes assumed per non-empty cell when estimating serialized size.
const BYTES_PER_CELL: usize = 50;
const ESTIMATE_SAMPLE_ROWS: usize = 100;
const SPARSE_MAX_COLS: usize = 100;
const SPARSE_MAX_STRING: usize = 200;
const SPARSE_TRUNCATED_LEN: usize = 197;

#[derive(Debug, Clone)]
pub struct SerializeOptions {
    /// Explicit row cap; `None` picks one from the sheet size.
    pub max_rows: Option<usize>,
    pub sparse: bool,
    /// Estimated size above which the grid is not stored at all.
    pub max_bytes: usize,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            max_rows: None,
            sparse: true,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseCell {
    pub r: usize,
    pub c: usize,
    pub v: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum TableGrid {
    Dense { rows: Vec<Vec<serde_json::Value>> },
    Sparse { cells: Vec<SparseCell> },
}

/// Stored form of a sheet. `row_count`/`col_count` always describe the
/// full sheet even when rows were dropped or the grid skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedTable {
    pub grid: Option<TableGrid>,
    pub merges: Vec<MergeRect>,
    pub row_count: usize,
    pub col_count: usize,
    pub stored_rows: usize,
    pub truncated: bool,
    pub skipped: bool,
    pub estimated_bytes: usize,
}

/// Rows kept when no explicit cap is given, by sheet size.
pub fn auto_row_cap(rows: usize, cols: usize) -> usize {
    if rows > 1000 || cols > 1000 {
        10
    } else if rows > 500 {
        20
    } else if rows > 100 {
        50
    } else {
        rows
    }
}

/// 50 bytes per non-empty cell, sampled from the first 100 rows and scaled
/// to the full row count.
pub fn estimate_bytes(ws: &Worksheet) -> usize {
    let total_rows = ws.row_count();
    if total_rows == 0 {
        return 0;
    }
    let sample = total_rows.min(ESTIMATE_SAMPLE_ROWS);
    let non_empty: usize = ws
        .rows
        .iter()
        .take(sample)
        .map(|row| row.iter().filter(|c| !c.is_empty()).count())
        .sum();
    non_empty * BYTES_PER_CELL * total_rows / sample
}

pub fn serialize(ws: &Worksheet, options: &SerializeOptions) -> SerializedTable {
    let row_count = ws.row_count();
    let col_count = ws.col_count();
    let estimated_bytes = estimate_bytes(ws);

    if estimated_bytes > options.max_bytes {
        return SerializedTable {
            grid: None,
            merges: ws.merges.clone(),
            row_count,
            col_count,
            stored_rows: 0,
            truncated: true,
            skipped: true,
            estimated_bytes,
        };
    }

    let cap = options
        .max_rows
        .unwrap_or_else(|| auto_row_cap(row_count, col_count));
    let stored_rows = row_count.min(cap);

    let grid = if options.sparse {
        let mut cells = Vec::new();
        for (r, row) in ws.rows.iter().take(stored_rows).enumerate() {
            for (c, cell) in row.iter().take(SPARSE_MAX_COLS).enumerate() {
                if cell.is_empty() {
                    continue;
                }
                cells.push(SparseCell {
                    r,
                    c,
                    v: sparse_value(cell),
                });
            }
        }
        TableGrid::Sparse { cells }
    } else {
        let rows = ws
            .rows
            .iter()
            .take(stored_rows)
            .map(|row| {
                (0..col_count)
                    .map(|c| row.get(c).map(Cell::to_json).unwrap_or(serde_json::Value::Null))
                    .collect()
            })
            .collect();
        TableGrid::Dense { rows }
    };

    SerializedTable {
        grid: Some(grid),
        merges: ws.merges.clone(),
        row_count,
        col_count,
        stored_rows,
        truncated: stored_rows < row_count
            || (options.sparse && col_count > SPARSE_MAX_COLS),
        skipped: false,
        estimated_bytes,
    }
}

fn sparse_value(cell: &Cell) -> serde_json::Value {
    match cell {
        Cell::Text(s) if s.chars().count() > SPARSE_MAX_STRING => {
            let head: String = s.chars().take(SPARSE_TRUNCATED_LEN).collect();
            serde_json::Value::String(format!("{}...", head))
        }
        other => other.to_json(),
    }
}

impl SerializedTable {
    /// Rebuilds a worksheet from the stored grid. Dropped rows come back
    /// empty; a skipped grid yields only the merge geometry.
    pub fn to_worksheet(&self, name: &str) -> Worksheet {
        let mut rows = vec![vec![Cell::Empty; self.col_count]; self.stored_rows];
        match &self.grid {
            Some(TableGrid::Dense { rows: stored }) => {
                for (r, row) in stored.iter().enumerate() {
                    for (c, value) in row.iter().enumerate() {
                        if let Some(slot) = rows.get_mut(r).and_then(|row| row.get_mut(c)) {
                            *slot = Cell::from_json(value);
                        }
                    }
                }
            }
            Some(TableGrid::Sparse { cells }) => {
                for cell in cells {
                    if let Some(slot) = rows.get_mut(cell.r).and_then(|row| row.get_mut(cell.c)) {
                        *slot = Cell::from_json(&cell.v);
                    }
                }
            }
            None => {}
        }
        Worksheet::new(name, rows).with_merges(self.merges.clone())
    }
}
