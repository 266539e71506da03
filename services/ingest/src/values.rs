//! Numeric cleaning for vendor cells.
//!
//! Cleaning never fails: anything that does not yield a finite number is
//! treated as an absent value.

use regex::Regex;
use std::sync::LazyLock;

use crate::worksheet::{format_number, Cell};

const NULL_TOKENS: &[&str] = &["na", "n/a", "#n/a", "null", "none", "-", "--", "——", "nan", "/"];

/// Unit suffixes that turn a number into a bound ("100以下") rather than a reading.
const BOUND_SUFFIXES: &[&str] = &["以下", "以上"];

static INTERVAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-?\d+(?:\.\d+)?)\s*[-~～—]\s*(-?\d+(?:\.\d+)?)$").unwrap()
});

static LEADING_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-?\d+(?:\.\d+)?)\s*(\S*)$").unwrap());

/// A cleaned numeric value with the text it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanValue {
    pub value: f64,
    pub raw: String,
}

pub fn is_null_token(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    t.is_empty() || NULL_TOKENS.contains(&t.as_str())
}

pub fn clean_numeric(cell: &Cell) -> Option<CleanValue> {
    match cell {
        Cell::Number(n) if n.is_finite() => Some(CleanValue {
            value: *n,
            raw: format_number(*n),
        }),
        Cell::Text(s) => clean_numeric_str(s).map(|value| CleanValue {
            value,
            raw: s.trim().to_string(),
        }),
        _ => None,
    }
}

pub fn clean_numeric_str(raw: &str) -> Option<f64> {
    if is_null_token(raw) {
        return None;
    }
    let s: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '，' && *c != '%' && !c.is_whitespace())
        .collect();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<f64>() {
        return finite(v);
    }
    if let Some(caps) = INTERVAL_RE.captures(&s) {
        let a: f64 = caps[1].parse().ok()?;
        let b: f64 = caps[2].parse().ok()?;
        return finite((a + b) / 2.0);
    }
    if let Some(caps) = LEADING_NUMBER_RE.captures(&s) {
        let unit = &caps[2];
        if BOUND_SUFFIXES.iter().any(|suffix| unit.ends_with(suffix)) {
            return None;
        }
        if unit
            .chars()
            .next()
            .map(|c| c.is_ascii_digit() || c == '-' || c == '.')
            .unwrap_or(false)
        {
            return None;
        }
        return finite(caps[1].parse().ok()?);
    }
    None
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}
