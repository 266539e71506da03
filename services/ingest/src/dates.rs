//! Date recognition for cells and header labels.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

use crate::worksheet::Cell;

/// Accepted textual layouts, tried in order.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y年%m月%d日",
    "%m/%d/%Y",
    "%d/%m/%Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

/// Labels that mark a date column or a header row.
const DATE_LABELS: &[&str] = &[
    "date",
    "start date",
    "end date",
    "日期",
    "开始日期",
    "起始日期",
    "结束日期",
    "交易日期",
    "时间",
    "周期",
];

/// Separators between the two ends of a period label like `2024-01-01~2024-01-07`.
const PERIOD_SEPARATORS: &[&str] = &["~", "～", "至", "—", " - ", "--"];

/// Largest serial Excel can represent (9999-12-31).
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

/// Excel day serial (1900 system, 1899-12-30 epoch) to a calendar date.
pub fn from_excel_serial(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > MAX_EXCEL_SERIAL {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(Duration::days(serial.trunc() as i64))
}

pub fn parse_date_str(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    // "2024-01-01 00:00:00.000" and similar: retry on the date part alone
    if let Some((head, _)) = s.split_once([' ', 'T']) {
        for fmt in DATE_FORMATS {
            if let Ok(d) = NaiveDate::parse_from_str(head, fmt) {
                return Some(d);
            }
        }
    }
    parse_compact(s)
}

/// Start and end of a period label; `None` unless both ends parse and are ordered.
pub fn parse_period_str(raw: &str) -> Option<(NaiveDate, NaiveDate)> {
    let s = raw.trim();
    let (start, end) = PERIOD_SEPARATORS.iter().find_map(|sep| s.split_once(sep))?;
    let start = parse_date_str(start)?;
    let end = parse_date_str(end)?;
    (start <= end).then_some((start, end))
}

/// `YYYYMMDD` with a plausible year.
fn parse_compact(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    if !(2000..=2100).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, s[4..6].parse().ok()?, s[6..8].parse().ok()?)
}

/// Date from any cell: native datetime, serial number or text.
///
/// Bare numbers only count as serials when they land in the business range,
/// otherwise every price column would read as dates in 1900.
pub fn parse_date_cell(cell: &Cell) -> Option<NaiveDate> {
    match cell {
        Cell::DateTime(dt) => Some(dt.date()),
        Cell::Number(n) => {
            let compact = crate::worksheet::format_number(*n);
            parse_compact(&compact)
                .or_else(|| from_excel_serial(*n))
                .filter(|d| in_business_range(*d))
        }
        Cell::Text(s) => parse_date_str(s),
        _ => None,
    }
}

pub fn looks_like_date_label(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return false;
    }
    DATE_LABELS.iter().any(|label| lower.contains(label))
}

/// Plausible business year for vendor data.
pub fn in_business_range(date: NaiveDate) -> bool {
    (2000..=2100).contains(&date.year())
}

pub fn month_bounds(date: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
    let next = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)?
    };
    Some((start, next - Duration::days(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_date_str_formats() {
        assert_eq!(parse_date_str("2024-01-05"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date_str("2024/1/5"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date_str("2024.01.05"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date_str("2024年1月5日"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date_str("01/05/2024"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date_str("2024-01-05 08:30:00"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date_str("20240105"), Some(d(2024, 1, 5)));
    }

    #[test]
    fn test_parse_date_str_rejects_garbage() {
        assert_eq!(parse_date_str("ABCD"), None);
        assert_eq!(parse_date_str(""), None);
        assert_eq!(parse_date_str("19991231"), None);
        assert_eq!(parse_date_str("河北"), None);
    }

    #[test]
    fn test_parse_period_str() {
        assert_eq!(
            parse_period_str("2024-01-01~2024-01-07"),
            Some((d(2024, 1, 1), d(2024, 1, 7)))
        );
        assert_eq!(
            parse_period_str("2024年1月1日至2024年1月7日"),
            Some((d(2024, 1, 1), d(2024, 1, 7)))
        );
        assert_eq!(parse_period_str("2024-01-07 - 2024-01-01"), None);
        assert_eq!(parse_period_str("2024-01-07"), None);
    }

    #[test]
    fn test_excel_serial() {
        assert_eq!(from_excel_serial(45292.0), Some(d(2024, 1, 1)));
        assert_eq!(from_excel_serial(0.0), None);
        assert_eq!(from_excel_serial(f64::NAN), None);
    }

    #[test]
    fn test_parse_date_cell_variants() {
        assert_eq!(parse_date_cell(&Cell::Number(45292.0)), Some(d(2024, 1, 1)));
        assert_eq!(parse_date_cell(&Cell::Number(20240101.0)), Some(d(2024, 1, 1)));
        assert_eq!(parse_date_cell(&Cell::date(d(2024, 3, 1))), Some(d(2024, 3, 1)));
        assert_eq!(parse_date_cell(&Cell::Empty), None);
        assert_eq!(parse_date_cell(&Cell::Number(15.2)), None);
    }

    #[test]
    fn test_date_labels() {
        assert!(looks_like_date_label("日期"));
        assert!(looks_like_date_label("Start Date"));
        assert!(looks_like_date_label("交易日期"));
        assert!(!looks_like_date_label("河北"));
        assert!(!looks_like_date_label(""));
    }

    #[test]
    fn test_month_bounds() {
        assert_eq!(month_bounds(d(2024, 2, 10)), Some((d(2024, 2, 1), d(2024, 2, 29))));
        assert_eq!(month_bounds(d(2024, 12, 3)), Some((d(2024, 12, 1), d(2024, 12, 31))));
    }
}
