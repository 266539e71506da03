//! In-memory worksheet: a rectangular grid of cells plus merge geometry.
//!
//! Everything downstream of workbook loading (codec, reshaper, dispatcher,
//! parsers) reads this model, never calamine types directly.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

impl Cell {
    pub fn text(s: impl Into<String>) -> Self {
        Cell::Text(s.into())
    }

    pub fn date(d: NaiveDate) -> Self {
        Cell::DateTime(d.and_time(chrono::NaiveTime::MIN))
    }

    /// Blank strings count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Display text for headers, labels and raw values.
    pub fn as_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(n) => format_number(*n),
            Cell::Bool(b) => b.to_string(),
            Cell::DateTime(dt) => {
                if dt.time() == chrono::NaiveTime::MIN {
                    dt.date().format("%Y-%m-%d").to_string()
                } else {
                    dt.format("%Y-%m-%d %H:%M:%S").to_string()
                }
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Empty => serde_json::Value::Null,
            Cell::Text(s) => serde_json::Value::String(s.clone()),
            Cell::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Cell::Bool(b) => serde_json::Value::Bool(*b),
            Cell::DateTime(_) => serde_json::Value::String(self.as_text()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Cell::Empty,
            serde_json::Value::Bool(b) => Cell::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(Cell::Number).unwrap_or(Cell::Empty),
            serde_json::Value::String(s) => Cell::Text(s.clone()),
            other => Cell::Text(other.to_string()),
        }
    }
}

/// Integral floats print without a trailing ".0" so "2024" stays "2024".
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Inclusive, 0-based merge rectangle. The top-left cell is the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRect {
    pub first_row: usize,
    pub first_col: usize,
    pub last_row: usize,
    pub last_col: usize,
}

impl MergeRect {
    pub fn new(first_row: usize, first_col: usize, last_row: usize, last_col: usize) -> Self {
        Self {
            first_row,
            first_col,
            last_row,
            last_col,
        }
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.first_row && row <= self.last_row && col >= self.first_col && col <= self.last_col
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Worksheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
    pub merges: Vec<MergeRect>,
}

impl Worksheet {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            name: name.into(),
            rows,
            merges: Vec::new(),
        }
    }

    pub fn with_merges(mut self, merges: Vec<MergeRect>) -> Self {
        self.merges = merges;
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn col_count(&self) -> usize {
        let from_rows = self.rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let from_merges = self.merges.iter().map(|m| m.last_col + 1).max().unwrap_or(0);
        from_rows.max(from_merges)
    }

    /// Raw cell without merge resolution.
    pub fn raw(&self, row: usize, col: usize) -> &Cell {
        static EMPTY: Cell = Cell::Empty;
        self.rows.get(row).and_then(|r| r.get(col)).unwrap_or(&EMPTY)
    }

    pub fn merge_at(&self, row: usize, col: usize) -> Option<&MergeRect> {
        self.merges.iter().find(|m| m.contains(row, col))
    }

    pub fn is_merge_anchor(&self, row: usize, col: usize) -> bool {
        self.merge_at(row, col)
            .map(|m| m.first_row == row && m.first_col == col)
            .unwrap_or(false)
    }

    /// Cell value with merged cells inheriting their anchor's value.
    pub fn value(&self, row: usize, col: usize) -> &Cell {
        match self.merge_at(row, col) {
            Some(m) => self.raw(m.first_row, m.first_col),
            None => self.raw(row, col),
        }
    }

    pub fn text(&self, row: usize, col: usize) -> String {
        self.value(row, col).as_text()
    }

    pub fn row_texts(&self, row: usize) -> Vec<String> {
        (0..self.col_count()).map(|c| self.text(row, c)).collect()
    }

    pub fn is_row_empty(&self, row: usize) -> bool {
        self.rows
            .get(row)
            .map(|r| r.iter().all(Cell::is_empty))
            .unwrap_or(true)
    }
}
