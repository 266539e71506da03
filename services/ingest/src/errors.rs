//! Row- and sheet-level ingest errors and their buffered collector.
//!
//! Nothing recorded here stops a batch. Errors are written outside the
//! sheet transaction, so a rolled-back sheet keeps its error trail.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::observation::SourceLocation;
use crate::store::Store;

pub const MAX_MESSAGE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingRequired,
    InvalidValue,
    DateParseFailed,
    DuplicateKey,
    /// Advisory: the row is still imported.
    OutOfRange,
    SheetError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingRequired => "missing_required",
            ErrorKind::InvalidValue => "invalid_value",
            ErrorKind::DateParseFailed => "date_parse_failed",
            ErrorKind::DuplicateKey => "duplicate_key",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::SheetError => "sheet_error",
        }
    }

    pub fn is_advisory(&self) -> bool {
        matches!(self, ErrorKind::OutOfRange)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "missing_required" => Ok(ErrorKind::MissingRequired),
            "invalid_value" => Ok(ErrorKind::InvalidValue),
            "date_parse_failed" => Ok(ErrorKind::DateParseFailed),
            "duplicate_key" => Ok(ErrorKind::DuplicateKey),
            "out_of_range" => Ok(ErrorKind::OutOfRange),
            "sheet_error" => Ok(ErrorKind::SheetError),
            other => Err(format!("unknown error kind '{}'", other)),
        }
    }
}

/// One recorded issue. Rows and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestError {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub sheet_name: Option<String>,
    pub row_no: Option<i32>,
    pub col_name: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub raw_value: Option<String>,
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl IngestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id: Uuid::nil(),
            sheet_name: None,
            row_no: None,
            col_name: None,
            kind,
            message: truncate_message(&message.into()),
            raw_value: None,
            context: None,
            created_at: Utc::now(),
        }
    }

    pub fn in_sheet(mut self, sheet: &str) -> Self {
        self.sheet_name = Some(sheet.to_string());
        self
    }

    /// Sheet, row and column taken from a draft's provenance.
    pub fn at(mut self, location: &SourceLocation) -> Self {
        self.sheet_name = Some(location.sheet.clone());
        self.row_no = i32::try_from(location.row).ok();
        self.col_name = Some(location.col.to_string());
        self
    }

    /// 0-based grid position.
    pub fn at_cell(mut self, sheet: &str, row: usize, col: usize) -> Self {
        self.sheet_name = Some(sheet.to_string());
        self.row_no = i32::try_from(row + 1).ok();
        self.col_name = Some((col + 1).to_string());
        self
    }

    pub fn with_raw_value(mut self, raw: impl Into<String>) -> Self {
        self.raw_value = Some(raw.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        message.to_string()
    } else {
        message.chars().take(MAX_MESSAGE_CHARS).collect()
    }
}

/// Buffers errors for one batch and writes them in bulk.
pub struct ErrorCollector {
    batch_id: Uuid,
    flush_threshold: usize,
    buffer: Vec<IngestError>,
    recorded: usize,
    blocking: usize,
}

impl ErrorCollector {
    pub fn new(batch_id: Uuid, flush_threshold: usize) -> Self {
        Self {
            batch_id,
            flush_threshold: flush_threshold.max(1),
            buffer: Vec::new(),
            recorded: 0,
            blocking: 0,
        }
    }

    fn stamp(&mut self, mut error: IngestError) -> IngestError {
        error.batch_id = self.batch_id;
        self.recorded += 1;
        if !error.kind.is_advisory() {
            self.blocking += 1;
        }
        error
    }

    /// Buffers `error`, flushing once the buffer reaches the threshold.
    pub async fn record(&mut self, store: &mut dyn Store, error: IngestError) -> Result<()> {
        let error = self.stamp(error);
        self.buffer.push(error);
        if self.buffer.len() >= self.flush_threshold {
            self.flush(store).await?;
        }
        Ok(())
    }

    pub async fn record_all(
        &mut self,
        store: &mut dyn Store,
        errors: impl IntoIterator<Item = IngestError>,
    ) -> Result<()> {
        for error in errors {
            self.record(store, error).await?;
        }
        Ok(())
    }

    /// Writes `error` at once, ahead of anything buffered.
    pub async fn record_immediate(&mut self, store: &mut dyn Store, error: IngestError) -> Result<()> {
        let error = self.stamp(error);
        store.insert_errors(std::slice::from_ref(&error)).await
    }

    pub async fn flush(&mut self, store: &mut dyn Store) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut self.buffer);
        store.insert_errors(&pending).await?;
        debug!(count = pending.len(), "flushed ingest errors");
        Ok(pending.len())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Errors recorded so far, advisory ones included.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Errors that fail a row or a sheet.
    pub fn blocking(&self) -> usize {
        self.blocking
    }
}
