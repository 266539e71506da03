//! Ingest profiles: per-vendor, versioned JSON rulesets.
//!
//! A profile is parsed into raw serde structs and then validated into an
//! [`IngestProfile`] whose parser references and configs are all typed, so
//! a bad profile is rejected when it is loaded rather than halfway through
//! a batch.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::indicators::{IndicatorRule, RawIndicatorRule};
use crate::observation::{PeriodType, Tags};
use crate::parsers::{ParserId, ParserSpec, ProfileDefaults};

const DEFAULT_PRIORITY: i32 = 100;

/// Terminal outcome for a sheet that is not parsed, or `Parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetAction {
    Parse,
    SkipMeta,
    RawTableStoreOnly,
}

impl SheetAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SheetAction::Parse => "PARSE",
            SheetAction::SkipMeta => "SKIP_META",
            SheetAction::RawTableStoreOnly => "RAW_TABLE_STORE_ONLY",
        }
    }
}

impl fmt::Display for SheetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SheetAction {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "PARSE" => Ok(SheetAction::Parse),
            "SKIP_META" => Ok(SheetAction::SkipMeta),
            "RAW_TABLE_STORE_ONLY" => Ok(SheetAction::RawTableStoreOnly),
            other => Err(PipelineError::Profile(format!("unknown action '{}'", other))),
        }
    }
}

/// What a sheet rule says about its sheet.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetDirective {
    Parse(ParserSpec),
    /// `SkipMeta` or `RawTableStoreOnly`.
    Action(SheetAction),
    /// Config without a parser; the parser comes from a dispatch rule.
    /// Holds the config validated for every parser that could pick it up.
    Config(BTreeMap<ParserId, ParserSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetRule {
    pub sheet_name: String,
    pub directive: SheetDirective,
    pub priority: i32,
    pub note: Option<String>,
}

/// Predicates of a dispatch rule; every one present must hold.
#[derive(Debug, Clone, Default)]
pub struct RuleWhen {
    pub sheet_name_in: Option<Vec<String>>,
    pub sheet_name_regex: Option<Regex>,
    pub has_columns: Option<Vec<String>>,
}

impl RuleWhen {
    /// Whether the name predicates alone admit `sheet_name`.
    pub fn admits_name(&self, sheet_name: &str) -> bool {
        if let Some(names) = &self.sheet_name_in {
            if !names.iter().any(|n| n == sheet_name) {
                return false;
            }
        }
        if let Some(re) = &self.sheet_name_regex {
            // anchored at the start of the name, not searched
            if !re.find(sheet_name).is_some_and(|m| m.start() == 0) {
                return false;
            }
        }
        true
    }

    pub fn matches(&self, sheet_name: &str, columns: &[String]) -> bool {
        if !self.admits_name(sheet_name) {
            return false;
        }
        match &self.has_columns {
            Some(required) => required.iter().all(|c| columns.iter().any(|col| col == c)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    Parser(ParserId),
    Action(SheetAction),
}

#[derive(Debug, Clone)]
pub struct DispatchRule {
    pub when: RuleWhen,
    pub target: RuleTarget,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct IngestProfile {
    pub profile_code: String,
    pub profile_name: Option<String>,
    pub version: String,
    pub source_code: String,
    pub dataset_type: String,
    pub file_pattern: Option<String>,
    pub target: String,
    pub defaults: ProfileDefaults,
    /// Ascending priority; ties keep file order.
    pub dispatch_rules: Vec<DispatchRule>,
    pub sheets: Vec<SheetRule>,
    /// Applied to each batch's observations once its sheets are written.
    pub indicator_rules: Vec<IndicatorRule>,
}

// ---------------------------------------------------------------------------
// On-disk format
// ---------------------------------------------------------------------------

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_target() -> String {
    "fact_observation".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    profile_code: String,
    #[serde(default)]
    profile_name: Option<String>,
    source_code: String,
    dataset_type: String,
    #[serde(default)]
    file_pattern: Option<String>,
    #[serde(default = "default_target")]
    target: String,
    #[serde(default)]
    defaults: serde_json::Map<String, Value>,
    #[serde(default)]
    dispatch_rules: Vec<RawDispatchRule>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    sheets: Vec<RawSheetRule>,
    #[serde(default)]
    indicator_rules: Vec<RawIndicatorRule>,
}

#[derive(Debug, Deserialize)]
struct RawSheetRule {
    sheet_name: String,
    #[serde(default)]
    parser: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    config: Value,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWhen {
    #[serde(default)]
    sheet_name_in: Option<Vec<String>>,
    #[serde(default)]
    sheet_name_regex: Option<String>,
    #[serde(default)]
    has_columns: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawDispatchRule {
    #[serde(default)]
    when: RawWhen,
    #[serde(default)]
    parser: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default = "default_priority")]
    priority: i32,
}

/// A parser string may also name a terminal action.
fn parse_target(parser: Option<&str>, action: Option<&str>, what: &str) -> Result<Option<RuleTarget>> {
    if let Some(action) = action {
        let action: SheetAction = action.parse()?;
        return match (action, parser) {
            (SheetAction::Parse, Some(p)) => Ok(Some(RuleTarget::Parser(p.parse()?))),
            (SheetAction::Parse, None) => Err(PipelineError::Profile(format!(
                "{}: action PARSE needs a parser",
                what
            ))),
            (action, _) => Ok(Some(RuleTarget::Action(action))),
        };
    }
    match parser {
        Some(p) => match p.parse::<SheetAction>() {
            Ok(action) if action != SheetAction::Parse => Ok(Some(RuleTarget::Action(action))),
            _ => Ok(Some(RuleTarget::Parser(p.parse()?))),
        },
        None => Ok(None),
    }
}

fn parse_defaults(raw: serde_json::Map<String, Value>) -> Result<ProfileDefaults> {
    let mut defaults = ProfileDefaults::default();
    for (key, value) in raw {
        match (key.as_str(), value) {
            ("period_type", Value::String(s)) => {
                defaults.period_type = Some(s.parse::<PeriodType>().map_err(PipelineError::Profile)?);
            }
            ("unit", Value::String(s)) => defaults.unit = Some(s),
            ("tags", Value::Object(map)) => {
                for (k, v) in map {
                    defaults.tags.insert(k.clone(), scalar_tag(&k, v)?);
                }
            }
            (_, Value::Null) => {}
            (k, v) => {
                let tag = scalar_tag(k, v)?;
                defaults.tags.insert(k.to_string(), tag);
            }
        }
    }
    Ok(defaults)
}

fn scalar_tag(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(PipelineError::Profile(format!(
            "default '{}' must be a scalar, got {}",
            key, other
        ))),
    }
}

fn build_when(raw: RawWhen) -> Result<RuleWhen> {
    let sheet_name_regex = raw.sheet_name_regex.as_deref().map(Regex::new).transpose()?;
    Ok(RuleWhen {
        sheet_name_in: raw.sheet_name_in,
        sheet_name_regex,
        has_columns: raw.has_columns,
    })
}

impl IngestProfile {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawProfile =
            serde_json::from_str(json).map_err(|e| PipelineError::Profile(format!("invalid profile: {}", e)))?;
        Self::from_raw(raw)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).await?;
        let profile = Self::from_json_str(&json)?;
        debug!(
            path = %path.display(),
            profile = %profile.profile_code,
            version = %profile.version,
            sheets = profile.sheets.len(),
            rules = profile.dispatch_rules.len(),
            "profile loaded"
        );
        Ok(profile)
    }

    fn from_raw(raw: RawProfile) -> Result<Self> {
        if raw.source_code.trim().is_empty() {
            return Err(PipelineError::Profile("source_code is required".to_string()));
        }

        let mut dispatch_rules = Vec::with_capacity(raw.dispatch_rules.len());
        for (i, rule) in raw.dispatch_rules.into_iter().enumerate() {
            let what = format!("dispatch rule {}", i + 1);
            let target = parse_target(rule.parser.as_deref(), rule.action.as_deref(), &what)?
                .ok_or_else(|| PipelineError::Profile(format!("{}: needs a parser or an action", what)))?;
            dispatch_rules.push(DispatchRule {
                when: build_when(rule.when)?,
                target,
                priority: rule.priority,
            });
        }
        dispatch_rules.sort_by_key(|r| r.priority);

        let mut seen = HashSet::new();
        let mut sheets = Vec::with_capacity(raw.sheets.len());
        for sheet in raw.sheets {
            let name = sheet.sheet_name.trim().to_string();
            if !seen.insert(name.clone()) {
                return Err(PipelineError::Profile(format!("sheet '{}' is configured twice", name)));
            }
            let what = format!("sheet '{}'", name);
            let directive = match parse_target(sheet.parser.as_deref(), sheet.action.as_deref(), &what)? {
                Some(RuleTarget::Parser(id)) => SheetDirective::Parse(
                    ParserSpec::from_json(id, &sheet.config)
                        .map_err(|e| PipelineError::Profile(format!("{}: {}", what, e)))?,
                ),
                Some(RuleTarget::Action(action)) => SheetDirective::Action(action),
                None => SheetDirective::Config(config_for_rules(&name, &sheet.config, &dispatch_rules)?),
            };
            sheets.push(SheetRule {
                sheet_name: name,
                directive,
                priority: sheet.priority,
                note: sheet.note,
            });
        }
        sheets.sort_by_key(|s| s.priority);

        let mut codes = HashSet::new();
        let mut indicator_rules = Vec::with_capacity(raw.indicator_rules.len());
        for rule in raw.indicator_rules {
            let rule = IndicatorRule::from_raw(rule)?;
            if !codes.insert(rule.indicator_code.clone()) {
                return Err(PipelineError::Profile(format!(
                    "indicator '{}' is defined twice",
                    rule.indicator_code
                )));
            }
            indicator_rules.push(rule);
        }

        let profile = Self {
            profile_code: raw.profile_code,
            profile_name: raw.profile_name,
            version: raw.version,
            source_code: raw.source_code.trim().to_string(),
            dataset_type: raw.dataset_type,
            file_pattern: raw.file_pattern,
            target: raw.target,
            defaults: parse_defaults(raw.defaults)?,
            dispatch_rules,
            sheets,
            indicator_rules,
        };
        profile.check_rule_configs()?;
        Ok(profile)
    }

    /// Every parser a dispatch rule can select needs a config somewhere.
    fn check_rule_configs(&self) -> Result<()> {
        for rule in &self.dispatch_rules {
            let RuleTarget::Parser(id) = rule.target else {
                continue;
            };
            let configured = self.sheets.iter().any(|s| match &s.directive {
                SheetDirective::Parse(spec) => spec.id == id,
                SheetDirective::Config(specs) => specs.contains_key(&id),
                SheetDirective::Action(_) => false,
            });
            if !configured {
                return Err(PipelineError::Profile(format!(
                    "dispatch rule selects {} but no sheet configures it",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Exact sheet-name rule.
    pub fn sheet(&self, sheet_name: &str) -> Option<&SheetRule> {
        let name = sheet_name.trim();
        self.sheets.iter().find(|s| s.sheet_name == name)
    }

    /// First sheet config written for parser `id`, by sheet priority.
    pub fn spec_for_parser(&self, id: ParserId) -> Option<&ParserSpec> {
        self.sheets.iter().find_map(|s| match &s.directive {
            SheetDirective::Parse(spec) if spec.id == id => Some(spec),
            SheetDirective::Config(specs) => specs.get(&id),
            _ => None,
        })
    }

    /// Glob match (`*`, `?`) of the profile's file pattern; true when unset.
    pub fn matches_filename(&self, filename: &str) -> bool {
        let Some(pattern) = &self.file_pattern else {
            return true;
        };
        let mut re = String::from("^");
        for ch in pattern.chars() {
            match ch {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                c => re.push_str(&regex::escape(&c.to_string())),
            }
        }
        re.push('$');
        Regex::new(&re).map(|r| r.is_match(filename)).unwrap_or(false)
    }

    pub fn default_tags(&self) -> &Tags {
        &self.defaults.tags
    }
}

/// Validates a parser-less sheet config against each dispatch rule that
/// could route this sheet to a parser.
fn config_for_rules(
    sheet_name: &str,
    config: &Value,
    rules: &[DispatchRule],
) -> Result<BTreeMap<ParserId, ParserSpec>> {
    let mut specs = BTreeMap::new();
    for rule in rules {
        let RuleTarget::Parser(id) = rule.target else {
            continue;
        };
        if !rule.when.admits_name(sheet_name) || specs.contains_key(&id) {
            continue;
        }
        let spec = ParserSpec::from_json(id, config)
            .map_err(|e| PipelineError::Profile(format!("sheet '{}': {}", sheet_name, e)))?;
        specs.insert(id, spec);
    }
    if specs.is_empty() {
        return Err(PipelineError::Profile(format!(
            "sheet '{}' has neither parser nor action and no dispatch rule can parse it",
            sheet_name
        )));
    }
    Ok(specs)
}
