//! Vendor sheets whose columns are labelled with free text such as
//! `商品猪：出栏均价：黑龙江（日）`, with unit and update rows under the label
//! row and one date per data row.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{derive_metric_key, zero_based, DraftParts, ParseContext, ParseOutput};
use crate::dates::{in_business_range, parse_date_cell};
use crate::error::{PipelineError, Result};
use crate::geo::{is_province, is_region, normalize_province};
use crate::observation::{MetricRef, Period, Tags};
use crate::values::clean_numeric;
use crate::worksheet::Worksheet;

/// Checked in order; on overlap the longest keyword wins.
pub const METRIC_KEYWORDS: &[&str] = &[
    "区域价差",
    "肥标价差",
    "毛白价差",
    "基差",
    "自繁自养利润",
    "外购仔猪利润",
    "养殖利润",
    "出栏均价",
    "出栏价",
    "均价",
    "报价",
    "到厂价",
    "猪粮比",
    "饲料比价",
    "料肉比",
    "利润",
    "价差",
    "价格",
];

const PIG_TYPES: &[&str] = &["标猪", "商品猪", "外三元", "内三元", "土杂", "白条", "仔猪", "肥猪"];

static FREQ_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*[（(](日|周)[)）]\s*$").unwrap());

static WEIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+\s*[-—～]\s*\d+\s*kg)").unwrap());

static PAIR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r".+[-—～].+").unwrap());

static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Kind of sheet a label comes from; decides which segments are positional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricGroup {
    Province,
    Group,
    Warehouse,
    Spread,
    Profit,
    Misc,
}

impl MetricGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricGroup::Province => "province",
            MetricGroup::Group => "group",
            MetricGroup::Warehouse => "warehouse",
            MetricGroup::Spread => "spread",
            MetricGroup::Profit => "profit",
            MetricGroup::Misc => "misc",
        }
    }

    pub fn from_sheet_name(sheet_name: &str) -> Self {
        if sheet_name.contains("分省") || sheet_name.contains("省区") {
            MetricGroup::Province
        } else if sheet_name.contains("集团") || sheet_name.contains("企业") {
            MetricGroup::Group
        } else if sheet_name.contains("库") {
            MetricGroup::Warehouse
        } else if sheet_name.contains("价差") {
            MetricGroup::Spread
        } else if sheet_name.contains("利润") {
            MetricGroup::Profit
        } else {
            MetricGroup::Misc
        }
    }

    fn default_metric_name(&self) -> &'static str {
        match self {
            MetricGroup::Spread => "价差",
            MetricGroup::Profit => "利润",
            _ => "价格",
        }
    }

    /// Segments the positional fields need once the frequency marker is
    /// stripped. Extra segments are kept as context.
    fn min_segments(&self) -> usize {
        match self {
            MetricGroup::Group | MetricGroup::Warehouse => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for MetricGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freq {
    Daily,
    Weekly,
}

impl Freq {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freq::Daily => "daily",
            Freq::Weekly => "weekly",
        }
    }
}

/// Dimensions recovered from one label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelParts {
    pub metric_group: MetricGroup,
    pub metric_name: String,
    pub freq: Freq,
    pub geo: Option<String>,
    pub region: Option<String>,
    pub company: Option<String>,
    pub warehouse: Option<String>,
    /// Segments that are not positional dimensions, for the metric key.
    pub metric_segments: Vec<String>,
    pub tags: Tags,
}

/// Longest keyword found in any segment, else the group's default name.
fn infer_metric_name(parts: &[String], group: MetricGroup) -> String {
    let mut best: Option<&str> = None;
    for part in parts {
        for keyword in METRIC_KEYWORDS {
            if part.contains(keyword) && best.map_or(true, |b| keyword.chars().count() > b.chars().count()) {
                best = Some(*keyword);
            }
        }
    }
    best.unwrap_or(group.default_metric_name()).to_string()
}

enum Place {
    Geo(String),
    Region(String),
}

fn place_of(segment: &str) -> Option<Place> {
    if is_province(segment) {
        Some(Place::Geo(normalize_province(segment)))
    } else if is_region(segment) {
        Some(Place::Region(segment.trim().to_string()))
    } else {
        None
    }
}

/// Decomposes a label.
///
/// Order: frequency marker, full-width colon split, group from the sheet
/// name (unless overridden), metric name by longest keyword, then
/// positional place/company/warehouse by group. Fewer segments than the
/// group's positional fields need is a configuration error.
pub fn decompose(raw_label: &str, sheet_name: &str, group_override: Option<MetricGroup>) -> Result<LabelParts> {
    let mut s = raw_label.trim().replace(':', "：");
    s = SPACES_RE.replace_all(&s, " ").to_string();

    let freq = match FREQ_RE.captures(&s) {
        Some(caps) => {
            let freq = if &caps[1] == "日" { Freq::Daily } else { Freq::Weekly };
            s = FREQ_RE.replace(&s, "").to_string();
            freq
        }
        None if sheet_name.contains('周') => Freq::Weekly,
        None => Freq::Daily,
    };

    let parts: Vec<String> = s
        .split('：')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    let group = group_override.unwrap_or_else(|| MetricGroup::from_sheet_name(sheet_name));
    if parts.len() < group.min_segments() {
        return Err(PipelineError::config(format!(
            "sheet '{}': label '{}' has {} segments, {} labels need at least {}",
            sheet_name,
            raw_label,
            parts.len(),
            group,
            group.min_segments()
        )));
    }

    let metric_name = infer_metric_name(&parts, group);
    let mut tags = Tags::new();

    if let Some(w) = parts.iter().find_map(|p| WEIGHT_RE.captures(p)) {
        let weight = SPACES_RE
            .replace_all(&w[1], "")
            .replace(['—', '～'], "-")
            .to_lowercase();
        tags.insert("weight_range".to_string(), weight);
    }
    if let Some(pair) = parts
        .iter()
        .find(|p| (p.contains("价差") || p.contains("基差")) && PAIR_RE.is_match(p))
    {
        tags.insert("pair".to_string(), pair.replace(['—', '～'], "-"));
    }
    let first = &parts[0];
    if first.contains('猪') || PIG_TYPES.contains(&first.as_str()) {
        tags.insert("pig_type".to_string(), first.clone());
    }

    let mut geo = None;
    let mut region = None;
    let mut company = None;
    let mut warehouse = None;
    // segments consumed as positional dimensions
    let mut positional: Vec<usize> = Vec::new();
    let last = parts.len() - 1;

    let place_index = match group {
        MetricGroup::Province => Some(last),
        MetricGroup::Group | MetricGroup::Warehouse => Some(last - 1),
        MetricGroup::Spread | MetricGroup::Profit | MetricGroup::Misc => None,
    };
    if let Some(index) = place_index {
        match place_of(&parts[index]) {
            Some(Place::Geo(g)) => {
                geo = Some(g);
                positional.push(index);
            }
            Some(Place::Region(r)) => {
                region = Some(r);
                positional.push(index);
            }
            None => {}
        }
    }
    match group {
        MetricGroup::Group => {
            company = Some(parts[last].clone());
            positional.push(last);
        }
        MetricGroup::Warehouse => {
            warehouse = Some(parts[last].clone());
            positional.push(last);
        }
        _ => {}
    }

    if let Some(r) = &region {
        tags.insert("region".to_string(), r.clone());
    }
    if let Some(c) = &company {
        tags.insert("company".to_string(), c.clone());
    }
    if let Some(w) = &warehouse {
        tags.insert("warehouse".to_string(), w.clone());
    }

    let metric_segments = parts
        .iter()
        .enumerate()
        .filter(|(i, _)| !positional.contains(i))
        .map(|(_, p)| p.clone())
        .collect();

    Ok(LabelParts {
        metric_group: group,
        metric_name,
        freq,
        geo,
        region,
        company,
        warehouse,
        metric_segments,
        tags,
    })
}

fn default_label_row() -> usize {
    2
}

fn default_unit_row() -> Option<usize> {
    Some(3)
}

fn default_update_row() -> Option<usize> {
    Some(4)
}

fn default_data_start_row() -> usize {
    5
}

fn default_date_col() -> usize {
    1
}

/// Row and column numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FreeTextConfig {
    #[serde(default = "default_label_row")]
    pub label_row: usize,
    #[serde(default = "default_unit_row")]
    pub unit_row: Option<usize>,
    #[serde(default = "default_update_row")]
    pub update_row: Option<usize>,
    #[serde(default = "default_data_start_row")]
    pub data_start_row: usize,
    #[serde(default = "default_date_col")]
    pub date_col: usize,
    /// One key for every column; otherwise derived per label.
    #[serde(default)]
    pub metric_key: Option<String>,
    #[serde(default)]
    pub metric_group: Option<MetricGroup>,
}

impl Default for FreeTextConfig {
    fn default() -> Self {
        Self {
            label_row: default_label_row(),
            unit_row: default_unit_row(),
            update_row: default_update_row(),
            data_start_row: default_data_start_row(),
            date_col: default_date_col(),
            metric_key: None,
            metric_group: None,
        }
    }
}

impl FreeTextConfig {
    pub fn validate(&self) -> Result<()> {
        let label_row = zero_based(self.label_row, "label_row")?;
        let data_start = zero_based(self.data_start_row, "data_start_row")?;
        zero_based(self.date_col, "date_col")?;
        for (row, what) in [(self.unit_row, "unit_row"), (self.update_row, "update_row")] {
            if let Some(row) = row {
                zero_based(row, what)?;
            }
        }
        if data_start <= label_row {
            return Err(PipelineError::Profile(format!(
                "data_start_row {} must come after label_row {}",
                self.data_start_row, self.label_row
            )));
        }
        Ok(())
    }
}

struct Column {
    col: usize,
    metric: MetricRef,
    period_weekly: bool,
    geo: Option<String>,
    tags: Tags,
}

pub fn parse(ws: &Worksheet, config: &FreeTextConfig, ctx: &ParseContext) -> Result<ParseOutput> {
    let mut out = ParseOutput::default();
    let label_row = zero_based(config.label_row, "label_row")?;
    let data_start = zero_based(config.data_start_row, "data_start_row")?;
    let date_col = zero_based(config.date_col, "date_col")?;
    let unit_row = config.unit_row.map(|r| zero_based(r, "unit_row")).transpose()?;
    let update_row = config.update_row.map(|r| zero_based(r, "update_row")).transpose()?;
    if ws.row_count() <= data_start {
        return Ok(out);
    }

    let mut columns: Vec<Column> = Vec::new();
    for col in 0..ws.col_count() {
        if col == date_col {
            continue;
        }
        let label = ws.text(label_row, col);
        if label.is_empty() {
            continue;
        }
        let parts = decompose(&label, ctx.sheet_name, config.metric_group)?;
        let key = match &config.metric_key {
            Some(key) => key.clone(),
            None => derive_metric_key(ctx.source_code, &parts.metric_segments.join("|")),
        };
        let unit = unit_row.map(|r| ws.text(r, col)).filter(|u| !u.is_empty());
        if let Some(row) = update_row {
            debug!(sheet = ctx.sheet_name, label = %label, updated = %ws.text(row, col), "label column");
        }
        columns.push(Column {
            col,
            metric: MetricRef {
                key,
                name: parts.metric_name.clone(),
                raw_header: label.clone(),
                unit,
                freq: Some(parts.freq.as_str().to_string()),
            },
            period_weekly: parts.freq == Freq::Weekly,
            geo: parts.geo,
            tags: parts.tags,
        });
    }

    for row in data_start..ws.row_count() {
        let Some(date) = parse_date_cell(ws.value(row, date_col)).filter(|d| in_business_range(*d)) else {
            continue;
        };
        for column in &columns {
            let Some(value) = clean_numeric(ws.raw(row, column.col)) else {
                continue;
            };
            let period = if column.period_weekly {
                Period::week_ending(date)
            } else {
                Period::day(date)
            };
            out.observations.push(ctx.draft(DraftParts {
                metric: column.metric.clone(),
                period,
                value,
                geo: column.geo.clone(),
                tags: column.tags.clone(),
                row,
                col: column.col,
            }));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::PeriodType;
    use crate::parsers::ProfileDefaults;
    use crate::worksheet::Cell;
    use chrono::NaiveDate;

    fn tag<'a>(parts: &'a LabelParts, key: &str) -> Option<&'a str> {
        parts.tags.get(key).map(String::as_str)
    }

    // -------------------------------------------------------------------------
    // DECOMPOSE
    // -------------------------------------------------------------------------

    #[test]
    fn test_decompose_province_label() {
        let p = decompose("商品猪：出栏均价：黑龙江（日）", "分省区猪价", None).unwrap();
        assert_eq!(p.metric_group, MetricGroup::Province);
        assert_eq!(p.metric_name, "出栏均价");
        assert_eq!(p.freq, Freq::Daily);
        assert_eq!(p.geo.as_deref(), Some("黑龙江"));
        assert_eq!(tag(&p, "pig_type"), Some("商品猪"));
        assert_eq!(p.metric_segments, vec!["商品猪", "出栏均价"]);
    }

    #[test]
    fn test_decompose_region_goes_to_tag() {
        let p = decompose("商品猪:出栏均价:华北(日)", "分省区猪价", None).unwrap();
        assert_eq!(p.geo, None);
        assert_eq!(p.region.as_deref(), Some("华北"));
        assert_eq!(tag(&p, "region"), Some("华北"));
    }

    #[test]
    fn test_decompose_group_takes_place_then_company() {
        let p = decompose("生猪：出栏价：河南：牧原（日）", "集团企业出栏价", None).unwrap();
        assert_eq!(p.metric_group, MetricGroup::Group);
        assert_eq!(p.metric_name, "出栏价");
        assert_eq!(p.geo.as_deref(), Some("河南"));
        assert_eq!(p.company.as_deref(), Some("牧原"));
        assert_eq!(tag(&p, "company"), Some("牧原"));
        assert_eq!(p.metric_segments, vec!["生猪", "出栏价"]);
    }

    #[test]
    fn test_decompose_warehouse() {
        let p = decompose("生猪：山东：临沂交割库", "交割库出栏价", None).unwrap();
        assert_eq!(p.metric_group, MetricGroup::Warehouse);
        assert_eq!(p.geo.as_deref(), Some("山东"));
        assert_eq!(tag(&p, "warehouse"), Some("临沂交割库"));
        // no keyword anywhere: the group default
        assert_eq!(p.metric_name, "价格");
    }

    #[test]
    fn test_decompose_longest_keyword_wins() {
        let p = decompose("标猪：自繁自养利润：中国（周）", "养殖利润", None).unwrap();
        assert_eq!(p.metric_group, MetricGroup::Profit);
        assert_eq!(p.metric_name, "自繁自养利润");
        assert_eq!(p.freq, Freq::Weekly);
        assert_eq!(p.geo, None);
    }

    #[test]
    fn test_decompose_spread_pair_and_weight() {
        let p = decompose("生猪：河南—山东价差（日）", "区域价差", None).unwrap();
        assert_eq!(p.metric_group, MetricGroup::Spread);
        assert_eq!(p.metric_name, "价差");
        assert_eq!(tag(&p, "pair"), Some("河南-山东价差"));

        let p = decompose("标猪：110 ～ 125KG：均价", "价格", None).unwrap();
        assert_eq!(tag(&p, "weight_range"), Some("110-125kg"));
        assert_eq!(p.metric_name, "均价");
    }

    #[test]
    fn test_decompose_frequency_from_sheet_name() {
        let p = decompose("生猪：均价", "周度价格", None).unwrap();
        assert_eq!(p.freq, Freq::Weekly);
    }

    #[test]
    fn test_decompose_segment_count_below_minimum() {
        assert!(decompose("牧原（日）", "集团企业出栏价", None).unwrap_err().is_config());
        assert!(decompose("（日）", "价格", None).unwrap_err().is_config());
        // an override changes what is accepted
        assert!(decompose("牧原（日）", "集团企业出栏价", Some(MetricGroup::Misc)).is_ok());
    }

    #[test]
    fn test_decompose_long_label_keeps_extra_segments() {
        let p = decompose("生猪：外三元：标猪：出栏均价：规模场：河南（日）", "分省区猪价", None).unwrap();
        assert_eq!(p.geo.as_deref(), Some("河南"));
        assert_eq!(p.metric_name, "出栏均价");
        assert_eq!(p.metric_segments, vec!["生猪", "外三元", "标猪", "出栏均价", "规模场"]);
    }

    // -------------------------------------------------------------------------
    // SHEET
    // -------------------------------------------------------------------------

    fn ganglian_sheet() -> Worksheet {
        Worksheet::new(
            "分省区猪价",
            vec![
                vec![Cell::text("钢联数据")],
                vec![
                    Cell::text("指标名称"),
                    Cell::text("商品猪：出栏均价：黑龙江（日）"),
                    Cell::text("商品猪：出栏均价：河南（日）"),
                ],
                vec![Cell::text("单位"), Cell::text("元/公斤"), Cell::text("元/公斤")],
                vec![Cell::text("更新时间"), Cell::text("2024-01-03"), Cell::text("2024-01-03")],
                vec![Cell::text("2024-01-02"), Cell::Number(13.9), Cell::Number(14.2)],
                vec![Cell::text("2024-01-03"), Cell::Number(14.0), Cell::Empty],
            ],
        )
    }

    #[test]
    fn test_parse_sheet_one_observation_per_value() {
        let defaults = ProfileDefaults::default();
        let ctx = ParseContext {
            sheet_name: "分省区猪价",
            source_code: "GL",
            defaults: &defaults,
        };
        let out = parse(&ganglian_sheet(), &FreeTextConfig::default(), &ctx).unwrap();

        assert_eq!(out.observations.len(), 3);
        let first = &out.observations[0];
        assert_eq!(first.metric.key, "GL_商品猪_出栏均价");
        assert_eq!(first.metric.unit.as_deref(), Some("元/公斤"));
        assert_eq!(first.metric.freq.as_deref(), Some("daily"));
        assert_eq!(first.geo_code.as_deref(), Some("黑龙江"));
        assert_eq!(first.period.period_type, PeriodType::Day);
        assert_eq!(out.observations[1].geo_code.as_deref(), Some("河南"));
        assert_eq!(
            out.observations[2].period.obs_date,
            NaiveDate::from_ymd_opt(2024, 1, 3)
        );
    }

    #[test]
    fn test_parse_weekly_labels_become_weeks() {
        let ws = Worksheet::new(
            "周度利润",
            vec![
                vec![Cell::Empty],
                vec![Cell::Empty, Cell::text("生猪：养殖利润（周）")],
                vec![Cell::Empty, Cell::text("元/头")],
                vec![Cell::Empty, Cell::Empty],
                vec![Cell::text("2024-01-11"), Cell::Number(-120.0)],
            ],
        );
        let defaults = ProfileDefaults::default();
        let ctx = ParseContext {
            sheet_name: "周度利润",
            source_code: "GL",
            defaults: &defaults,
        };
        let config = FreeTextConfig {
            metric_key: Some("GL_W_PROFIT".to_string()),
            ..FreeTextConfig::default()
        };
        let out = parse(&ws, &config, &ctx).unwrap();
        let obs = &out.observations[0];
        assert_eq!(obs.metric.key, "GL_W_PROFIT");
        assert_eq!(obs.period.period_type, PeriodType::Week);
        assert_eq!(obs.period.start, NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(obs.value, -120.0);
    }

    #[test]
    fn test_config_rejects_data_above_labels() {
        let config = FreeTextConfig {
            data_start_row: 2,
            ..FreeTextConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
