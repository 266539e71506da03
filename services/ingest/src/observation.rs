//! Draft observations produced by parsers and consumed by the validator and upserter.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::dates::month_bounds;

/// Open tag set. Ordered so canonical forms never depend on insertion order.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    #[serde(alias = "daily")]
    Day,
    #[serde(alias = "weekly")]
    Week,
    #[serde(alias = "monthly")]
    Month,
    /// Arbitrary [start, end] span.
    Range,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Day => "day",
            PeriodType::Week => "week",
            PeriodType::Month => "month",
            PeriodType::Range => "range",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeriodType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" => Ok(PeriodType::Day),
            "week" | "weekly" => Ok(PeriodType::Week),
            "month" | "monthly" => Ok(PeriodType::Month),
            "range" => Ok(PeriodType::Range),
            other => Err(format!("unknown period type '{}'", other)),
        }
    }
}

/// Time axis of an observation: a single date or an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub period_type: PeriodType,
    pub obs_date: Option<NaiveDate>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl Period {
    pub fn day(date: NaiveDate) -> Self {
        Self {
            period_type: PeriodType::Day,
            obs_date: Some(date),
            start: None,
            end: None,
        }
    }

    /// Week labelled by its last day; the start is derived six days earlier.
    pub fn week_ending(end: NaiveDate) -> Self {
        Self::span(PeriodType::Week, end - Duration::days(6), end)
    }

    pub fn span(period_type: PeriodType, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            period_type,
            obs_date: Some(end),
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn month_of(date: NaiveDate) -> Self {
        match month_bounds(date) {
            Some((start, end)) => Self::span(PeriodType::Month, start, end),
            None => Self::day(date),
        }
    }

    /// Builds a period of `period_type` around a row date.
    pub fn for_type(period_type: PeriodType, date: NaiveDate) -> Self {
        match period_type {
            PeriodType::Day => Self::day(date),
            PeriodType::Week => Self::week_ending(date),
            PeriodType::Month => Self::month_of(date),
            PeriodType::Range => Self::span(PeriodType::Range, date, date),
        }
    }

    /// Date that identifies the period in the dedup fingerprint.
    pub fn key_date(&self) -> Option<NaiveDate> {
        self.end.or(self.obs_date)
    }
}

/// Cell a draft was read from. Rows and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub sheet: String,
    pub row: usize,
    pub col: usize,
}

impl SourceLocation {
    /// From 0-based grid coordinates.
    pub fn at(sheet: &str, row: usize, col: usize) -> Self {
        Self {
            sheet: sheet.to_string(),
            row: row + 1,
            col: col + 1,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xls:sheet='{}':row={}:col={}", self.sheet, self.row, self.col)
    }
}

/// Metric identity carried by a draft until the resolver assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRef {
    pub key: String,
    pub name: String,
    pub raw_header: String,
    pub unit: Option<String>,
    pub freq: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftObservation {
    pub source_code: String,
    pub sheet_name: String,
    pub metric: MetricRef,
    pub period: Period,
    pub value: f64,
    pub raw_value: Option<String>,
    /// Geography label, `None` for national/unspecified.
    pub geo_code: Option<String>,
    pub tags: Tags,
    pub dedup_key: String,
    pub location: SourceLocation,
}
