//! Exchange daily history sheets (futures and options) with a fixed column set.
//!
//! Every numeric field of a row becomes its own observation, keyed by
//! contract through tags. Unlike the bulk parsers, a trade date that cannot
//! be read is reported as a row error with its location.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::{zero_based, DraftParts, ParseContext, ParseOutput};
use crate::codec::detect_header_row;
use crate::dates::{in_business_range, parse_date_cell};
use crate::error::{PipelineError, Result};
use crate::errors::{ErrorKind, IngestError};
use crate::observation::{MetricRef, Period, Tags};
use crate::values::clean_numeric;
use crate::worksheet::{format_number, Worksheet};

const HEADER_SCAN_ROWS: usize = 10;
const CONTRACT_LABEL: &str = "合约名称";
const TRADE_DATE_LABEL: &str = "交易日期";

/// Numeric columns shared by futures and options, with their metric codes.
const COMMON_FIELDS: &[(&str, &str)] = &[
    ("开盘价", "OPEN"),
    ("最高价", "HIGH"),
    ("最低价", "LOW"),
    ("收盘价", "CLOSE"),
    ("前结算价", "PRE_SETTLE"),
    ("结算价", "SETTLE"),
    ("涨跌", "CHG"),
    ("涨跌1", "CHG1"),
    ("成交量", "VOLUME"),
    ("持仓量", "OPEN_INTEREST"),
    ("持仓量变化", "OI_CHG"),
    ("成交额", "TURNOVER"),
];

const OPTION_FIELDS: &[(&str, &str)] = &[
    ("Delta", "DELTA"),
    ("隐含波动率(%)", "IV"),
    ("行权量", "EXERCISE_VOLUME"),
];

static FUTURES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([a-z]+)(\d{2})(\d{2})$").unwrap());

static OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z]+\d{4})-([CP])-(\d+(?:\.\d+)?)$").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrument {
    #[default]
    Futures,
    Options,
}

impl Instrument {
    pub fn as_str(&self) -> &'static str {
        match self {
            Instrument::Futures => "FUTURES",
            Instrument::Options => "OPTIONS",
        }
    }

    fn fields(&self) -> Vec<(&'static str, &'static str)> {
        let mut fields = COMMON_FIELDS.to_vec();
        if *self == Instrument::Options {
            fields.extend_from_slice(OPTION_FIELDS);
        }
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FixedColumnConfig {
    /// Set from the parser id, never read from the profile.
    #[serde(skip)]
    pub instrument: Instrument,
    /// 1-based; located by the contract column label when unset.
    pub header_row: Option<usize>,
    /// Metric codes to keep, e.g. `["CLOSE", "SETTLE"]`. All when unset.
    pub fields: Option<Vec<String>>,
    pub tags: Tags,
}

impl FixedColumnConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(row) = self.header_row {
            zero_based(row, "header_row")?;
        }
        let known = self.instrument.fields();
        for field in self.fields.iter().flatten() {
            if !known.iter().any(|(_, code)| code.eq_ignore_ascii_case(field)) {
                return Err(PipelineError::Profile(format!(
                    "unknown {} field '{}'",
                    self.instrument.as_str().to_lowercase(),
                    field
                )));
            }
        }
        Ok(())
    }

    fn keeps(&self, code: &str) -> bool {
        match &self.fields {
            Some(fields) => fields.iter().any(|f| f.eq_ignore_ascii_case(code)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuturesContract {
    pub instrument: String,
    pub year: i32,
    pub month: u32,
}

/// `lh2603` → LH, 2026, 3.
pub fn parse_futures_contract(code: &str) -> Option<FuturesContract> {
    let lower = code.trim().to_lowercase();
    let caps = FUTURES_RE.captures(&lower)?;
    let month: u32 = caps[3].parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some(FuturesContract {
        instrument: caps[1].to_uppercase(),
        year: 2000 + caps[2].parse::<i32>().ok()?,
        month,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionContract {
    pub underlying: String,
    pub option_type: char,
    pub strike: f64,
}

/// `lh2603-C-10000` → underlying lh2603, call, strike 10000.
pub fn parse_option_contract(code: &str) -> Option<OptionContract> {
    let upper = code.trim().to_uppercase();
    let caps = OPTION_RE.captures(&upper)?;
    Some(OptionContract {
        underlying: caps[1].to_lowercase(),
        option_type: caps[2].chars().next()?,
        strike: caps[3].parse().ok()?,
    })
}

/// Contract tags for one row, `None` when the code does not parse.
fn contract_tags(instrument: Instrument, code: &str) -> Option<Tags> {
    let mut tags = Tags::new();
    tags.insert("contract".to_string(), code.trim().to_lowercase());
    match instrument {
        Instrument::Futures => {
            let contract = parse_futures_contract(code)?;
            tags.insert("instrument".to_string(), contract.instrument);
        }
        Instrument::Options => {
            let option = parse_option_contract(code)?;
            let letters: String = option
                .underlying
                .chars()
                .take_while(|c| c.is_ascii_alphabetic())
                .collect();
            tags.insert("instrument".to_string(), letters.to_uppercase());
            tags.insert("option_type".to_string(), option.option_type.to_string());
            tags.insert("strike".to_string(), format_number(option.strike));
        }
    }
    Some(tags)
}

fn normalize_label(text: &str) -> String {
    text.trim().replace('（', "(").replace('）', ")")
}

pub fn parse(ws: &Worksheet, config: &FixedColumnConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    if ws.row_count() == 0 {
        return Ok(out);
    }
    let header_row = match config.header_row {
        Some(row) => zero_based(row, "header_row")?,
        None => detect_header_row(ws, &[CONTRACT_LABEL], HEADER_SCAN_ROWS, ws.col_count()).ok_or_else(|| {
            PipelineError::config(format!(
                "sheet '{}': no '{}' column in the first {} rows",
                ws.name, CONTRACT_LABEL, HEADER_SCAN_ROWS
            ))
        })?,
    };

    let positions: HashMap<String, usize> = (0..ws.col_count())
        .map(|col| (normalize_label(&ws.text(header_row, col)), col))
        .filter(|(label, _)| !label.is_empty())
        .rev()
        .collect();
    let find = |label: &str| {
        positions.get(label).copied().ok_or_else(|| {
            PipelineError::config(format!(
                "sheet '{}': missing column '{}' in row {}",
                ws.name,
                label,
                header_row + 1
            ))
        })
    };
    let contract_col = find(CONTRACT_LABEL)?;
    let date_col = find(TRADE_DATE_LABEL)?;

    let family = config.instrument.as_str();
    let fields: Vec<(usize, MetricRef)> = config
        .instrument
        .fields()
        .into_iter()
        .filter(|(_, code)| config.keeps(code))
        .filter_map(|(label, code)| {
            let col = *positions.get(label)?;
            Some((
                col,
                MetricRef {
                    key: format!("{}_{}_{}", ctx.source_code.to_uppercase(), family, code),
                    name: label.to_string(),
                    // futures and options share labels on the same sheet name
                    raw_header: format!("{}:{}", family, label),
                    unit: None,
                    freq: Some("daily".to_string()),
                },
            ))
        })
        .collect();

    for row in header_row + 1..ws.row_count() {
        let code = ws.text(row, contract_col);
        if code.is_empty() {
            continue;
        }
        let Some(mut tags) = contract_tags(config.instrument, &code) else {
            out.issues.push(
                IngestError::new(
                    ErrorKind::InvalidValue,
                    format!("cannot parse {} contract '{}'", family.to_lowercase(), code),
                )
                .at_cell(ctx.sheet_name, row, contract_col)
                .with_raw_value(code),
            );
            continue;
        };
        tags.extend(config.tags.clone());

        let date_cell = ws.value(row, date_col);
        let date = parse_date_cell(date_cell).filter(|d| in_business_range(*d));
        let Some(date) = date else {
            let message = if date_cell.is_empty() {
                "trade date is empty".to_string()
            } else {
                format!("cannot parse trade date '{}'", date_cell.as_text())
            };
            out.issues.push(
                IngestError::new(ErrorKind::DateParseFailed, message)
                    .at_cell(ctx.sheet_name, row, date_col)
                    .with_raw_value(date_cell.as_text()),
            );
            continue;
        };

        for (col, metric) in &fields {
            let Some(value) = clean_numeric(ws.raw(row, *col)) else {
                continue;
            };
            out.observations.push(ctx.draft(DraftParts {
                metric: metric.clone(),
                period: Period::day(date),
                value,
                geo: None,
                tags: tags.clone(),
                row,
                col: *col,
            }));
        }
    }
    Ok(out)
}
