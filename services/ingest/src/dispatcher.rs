//! Resolves a worksheet to exactly one parser or terminal action.
//!
//! Order: exact sheet-name rule, then dispatch rules by ascending priority,
//! then `RAW_TABLE_STORE_ONLY`. Nothing here writes anywhere.

use tracing::{info, warn};

use crate::parsers::{ParserId, ParserSpec};
use crate::profile::{IngestProfile, RuleTarget, SheetAction, SheetDirective};
use crate::worksheet::Worksheet;

const SIGNATURE_SCAN_ROWS: usize = 5;
const SIGNATURE_MAX_COLS: usize = 50;

/// Header cells that mark a row as the column-signature row.
const DATE_LABELS: &[&str] = &[
    "开始日期", "结束日期", "日期", "起始日期", "date", "start date", "end date",
];

/// Where a parse decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchVia {
    SheetName,
    /// Matched a dispatch rule; `by_parser_type` means the config was
    /// borrowed from another sheet using the same parser.
    Rule { priority: i32, by_parser_type: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dispatch<'a> {
    Parse { spec: &'a ParserSpec, via: DispatchVia },
    SkipMeta,
    RawTableStoreOnly,
}

impl Dispatch<'_> {
    pub fn action(&self) -> SheetAction {
        match self {
            Dispatch::Parse { .. } => SheetAction::Parse,
            Dispatch::SkipMeta => SheetAction::SkipMeta,
            Dispatch::RawTableStoreOnly => SheetAction::RawTableStoreOnly,
        }
    }

    pub fn parser(&self) -> Option<ParserId> {
        match self {
            Dispatch::Parse { spec, .. } => Some(spec.id),
            _ => None,
        }
    }
}

fn terminal<'a>(action: SheetAction) -> Dispatch<'a> {
    match action {
        SheetAction::SkipMeta => Dispatch::SkipMeta,
        // a bare PARSE never reaches here; profile loading pairs it with a parser
        SheetAction::RawTableStoreOnly | SheetAction::Parse => Dispatch::RawTableStoreOnly,
    }
}

/// Column signature: the first row in the top five carrying a date label,
/// else the first row. Blank cells are dropped.
pub fn extract_column_names(ws: &Worksheet) -> Vec<String> {
    let cols = ws.col_count().min(SIGNATURE_MAX_COLS);
    let header_row = (0..ws.row_count().min(SIGNATURE_SCAN_ROWS))
        .find(|&r| {
            (0..cols).any(|c| {
                let text = ws.text(r, c).to_lowercase();
                DATE_LABELS.contains(&text.as_str())
            })
        })
        .unwrap_or(0);
    (0..cols)
        .map(|c| ws.text(header_row, c))
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn dispatch<'a>(profile: &'a IngestProfile, ws: &Worksheet) -> Dispatch<'a> {
    let decision = resolve(profile, ws);
    info!(
        sheet = %ws.name,
        action = %decision.action(),
        parser = decision.parser().map(|p| p.as_str()).unwrap_or("-"),
        "sheet dispatched"
    );
    decision
}

fn resolve<'a>(profile: &'a IngestProfile, ws: &Worksheet) -> Dispatch<'a> {
    let by_name = profile.sheet(&ws.name);
    match by_name.map(|s| &s.directive) {
        Some(SheetDirective::Parse(spec)) => {
            return Dispatch::Parse {
                spec,
                via: DispatchVia::SheetName,
            }
        }
        Some(SheetDirective::Action(action)) => return terminal(*action),
        // config-only entries wait for a dispatch rule to name the parser
        Some(SheetDirective::Config(_)) | None => {}
    }

    if profile.dispatch_rules.is_empty() {
        return Dispatch::RawTableStoreOnly;
    }
    let columns = extract_column_names(ws);
    let Some(rule) = profile
        .dispatch_rules
        .iter()
        .find(|r| r.when.matches(ws.name.trim(), &columns))
    else {
        return Dispatch::RawTableStoreOnly;
    };

    let id = match rule.target {
        RuleTarget::Action(action) => return terminal(action),
        RuleTarget::Parser(id) => id,
    };
    if let Some(SheetDirective::Config(specs)) = by_name.map(|s| &s.directive) {
        if let Some(spec) = specs.get(&id) {
            return Dispatch::Parse {
                spec,
                via: DispatchVia::Rule {
                    priority: rule.priority,
                    by_parser_type: false,
                },
            };
        }
    }
    match profile.spec_for_parser(id) {
        Some(spec) => {
            warn!(
                sheet = %ws.name,
                parser = %id,
                "no config for this sheet; using the config of another sheet with the same parser, possibly incomplete"
            );
            Dispatch::Parse {
                spec,
                via: DispatchVia::Rule {
                    priority: rule.priority,
                    by_parser_type: true,
                },
            }
        }
        None => {
            warn!(sheet = %ws.name, parser = %id, "dispatch rule parser has no config");
            Dispatch::RawTableStoreOnly
        }
    }
}
