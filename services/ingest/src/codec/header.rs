//! Header flattening and header-row detection.

use serde::Serialize;

use crate::worksheet::Worksheet;

/// Separator between stacked header fragments.
pub const HEADER_SEPARATOR: &str = "|";

const SIGNATURE_ROWS: usize = 3;
const SIGNATURE_COLS: usize = 20;
const SIGNATURE_VALUE_CHARS: usize = 50;
const SIGNATURE_MAX_CHARS: usize = 500;

/// Flattens the first `header_row_count` rows into one name per column.
pub fn flatten(ws: &Worksheet, header_row_count: usize) -> Vec<String> {
    flatten_rows(ws, 0, header_row_count)
}

/// Flattens `header_row_count` rows starting at `start_row` (0-based).
///
/// Merged cells inherit their anchor's value, a fragment equal to the one
/// directly above it is dropped, and columns with no text become `Column_{n}`.
pub fn flatten_rows(ws: &Worksheet, start_row: usize, header_row_count: usize) -> Vec<String> {
    (0..ws.col_count())
        .map(|col| {
            let mut parts: Vec<String> = Vec::new();
            for row in start_row..start_row + header_row_count {
                let text = ws.text(row, col);
                if text.is_empty() || parts.last() == Some(&text) {
                    continue;
                }
                parts.push(text);
            }
            if parts.is_empty() {
                format!("Column_{}", col + 1)
            } else {
                parts.join(HEADER_SEPARATOR)
            }
        })
        .collect()
}

/// One date spanning a run of sub-columns, e.g. a merged "2024-01-01"
/// over "规模场 | 小散 | 均价". Columns are 0-based and inclusive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateGroup {
    pub date: String,
    pub subcolumns: Vec<String>,
    pub col_start: usize,
    pub col_end: usize,
}

/// Groups sub-columns under their spanning date cell.
///
/// A group starts at a merge anchor on the date row, or, outside merges,
/// where the date text changes. The last group ends after its own
/// sub-columns rather than at the sheet edge.
pub fn extract_date_grouped_subcolumns(
    ws: &Worksheet,
    date_row: usize,
    subcol_row: usize,
) -> Vec<DateGroup> {
    let width = ws.col_count();
    let mut groups: Vec<DateGroup> = Vec::new();
    let mut current: Option<DateGroup> = None;
    let mut prev_date: Option<String> = None;

    for col in 0..width {
        let date_text = ws.text(date_row, col);
        let starts_group = !date_text.is_empty()
            && match ws.merge_at(date_row, col) {
                Some(m) => m.first_col == col,
                None => prev_date.as_deref() != Some(date_text.as_str()),
            };

        if starts_group {
            if let Some(mut group) = current.take() {
                group.col_end = col.saturating_sub(1).max(group.col_start);
                groups.push(group);
            }
            current = Some(DateGroup {
                date: date_text.clone(),
                subcolumns: Vec::new(),
                col_start: col,
                col_end: col,
            });
            prev_date = Some(date_text);
        }

        let sub = ws.text(subcol_row, col);
        if let (Some(group), false) = (current.as_mut(), sub.is_empty()) {
            group.subcolumns.push(sub);
        }
    }

    if let Some(mut group) = current {
        group.col_end = if group.subcolumns.is_empty() {
            width.saturating_sub(1)
        } else {
            (group.col_start + group.subcolumns.len() - 1).min(width.saturating_sub(1))
        };
        groups.push(group);
    }
    groups
}

/// First row (0-based) within the scan window holding any anchor phrase.
pub fn detect_header_row(
    ws: &Worksheet,
    anchors: &[&str],
    scan_rows: usize,
    scan_cols: usize,
) -> Option<usize> {
    let anchors: Vec<String> = anchors.iter().map(|a| a.to_lowercase()).collect();
    (0..scan_rows.min(ws.row_count())).find(|&row| {
        (0..scan_cols.min(ws.col_count())).any(|col| {
            let text = ws.text(row, col).to_lowercase();
            !text.is_empty() && anchors.iter().any(|a| text.contains(a.as_str()))
        })
    })
}

/// Compact fingerprint of the top-left header area, stored with each raw sheet.
pub fn header_signature(ws: &Worksheet) -> String {
    let rows: Vec<Vec<String>> = (0..SIGNATURE_ROWS.min(ws.row_count()))
        .map(|row| {
            (0..SIGNATURE_COLS.min(ws.col_count()))
                .map(|col| ws.text(row, col).chars().take(SIGNATURE_VALUE_CHARS).collect())
                .collect()
        })
        .collect();
    let json = serde_json::to_string(&rows).unwrap_or_default();
    truncate_chars(&json, SIGNATURE_MAX_CHARS)
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worksheet::{Cell, MergeRect};

    /// Two-row header: a merged date over three sub-columns, a second date
    /// over two, and a vertically merged "区域" label.
    fn grouped_sheet() -> Worksheet {
        Worksheet::new(
            "grouped",
            vec![
                vec![
                    Cell::text("区域"),
                    Cell::text("2024-01-01"),
                    Cell::Empty,
                    Cell::Empty,
                    Cell::text("2024-01-02"),
                    Cell::Empty,
                ],
                vec![
                    Cell::Empty,
                    Cell::text("规模场"),
                    Cell::text("小散"),
                    Cell::text("均价"),
                    Cell::text("规模场"),
                    Cell::text("小散"),
                ],
                vec![
                    Cell::text("河北"),
                    Cell::Number(15.0),
                    Cell::Number(14.8),
                    Cell::Number(14.9),
                    Cell::Number(15.1),
                    Cell::Number(14.9),
                ],
            ],
        )
        .with_merges(vec![
            MergeRect::new(0, 0, 1, 0),
            MergeRect::new(0, 1, 0, 3),
            MergeRect::new(0, 4, 0, 5),
        ])
    }

    // -------------------------------------------------------------------------
    // FLATTEN
    // -------------------------------------------------------------------------

    #[test]
    fn test_flatten_joins_stacked_rows_and_inherits_merges() {
        let names = flatten(&grouped_sheet(), 2);
        assert_eq!(
            names,
            vec![
                "区域",
                "2024-01-01|规模场",
                "2024-01-01|小散",
                "2024-01-01|均价",
                "2024-01-02|规模场",
                "2024-01-02|小散",
            ]
        );
    }

    #[test]
    fn test_flatten_names_empty_columns() {
        let ws = Worksheet::new(
            "s",
            vec![vec![Cell::text("日期"), Cell::Empty, Cell::text("价格")]],
        );
        assert_eq!(flatten(&ws, 1), vec!["日期", "Column_2", "价格"]);
    }

    #[test]
    fn test_flatten_suppresses_consecutive_duplicates_only() {
        let ws = Worksheet::new(
            "s",
            vec![
                vec![Cell::text("A")],
                vec![Cell::text("A")],
                vec![Cell::text("B")],
                vec![Cell::text("A")],
            ],
        );
        assert_eq!(flatten(&ws, 4), vec!["A|B|A"]);
    }

    // -------------------------------------------------------------------------
    // DATE GROUPS
    // -------------------------------------------------------------------------

    #[test]
    fn test_date_groups_start_at_merge_anchors() {
        let groups = extract_date_grouped_subcolumns(&grouped_sheet(), 0, 1);
        assert_eq!(groups.len(), 3);
        // the vertical "区域" merge anchors a group of its own with no sub-columns
        assert_eq!(groups[0].date, "区域");
        assert_eq!(groups[1].date, "2024-01-01");
        assert_eq!(groups[1].subcolumns, vec!["规模场", "小散", "均价"]);
        assert_eq!((groups[1].col_start, groups[1].col_end), (1, 3));
        assert_eq!(groups[2].subcolumns, vec!["规模场", "小散"]);
        assert_eq!((groups[2].col_start, groups[2].col_end), (4, 5));
    }

    #[test]
    fn test_date_groups_without_merges_split_on_value_change() {
        let ws = Worksheet::new(
            "s",
            vec![
                vec![
                    Cell::text("2024-01-01"),
                    Cell::text("2024-01-01"),
                    Cell::text("2024-01-08"),
                ],
                vec![Cell::text("价格"), Cell::text("涨跌"), Cell::text("价格")],
            ],
        );
        let groups = extract_date_grouped_subcolumns(&ws, 0, 1);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].subcolumns, vec!["价格", "涨跌"]);
        assert_eq!((groups[0].col_start, groups[0].col_end), (0, 1));
        assert_eq!((groups[1].col_start, groups[1].col_end), (2, 2));
    }

    // -------------------------------------------------------------------------
    // HEADER DETECTION / SIGNATURE
    // -------------------------------------------------------------------------

    #[test]
    fn test_detect_header_row_first_match_wins() {
        let ws = Worksheet::new(
            "s",
            vec![
                vec![Cell::text("生猪周度数据")],
                vec![Cell::text("开始日期"), Cell::text("结束日期")],
                vec![Cell::text("开始日期")],
            ],
        );
        assert_eq!(detect_header_row(&ws, &["开始日期", "start"], 10, 20), Some(1));
        assert_eq!(detect_header_row(&ws, &["missing"], 10, 20), None);
    }

    #[test]
    fn test_header_signature_is_capped() {
        let long = "x".repeat(80);
        let ws = Worksheet::new("s", vec![vec![Cell::text(long.clone()); 30]; 5]);
        let sig = header_signature(&ws);
        assert!(sig.chars().count() <= 500);
        assert!(!sig.contains(&long));
    }
}
