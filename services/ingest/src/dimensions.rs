//! Tag extraction from free column and row labels.
//!
//! Vendor headers such as `规模场 自繁自养 110kg` encode series dimensions in
//! prose. Each dimension takes the first keyword that matches.

use std::sync::LazyLock;

use regex::Regex;

use crate::observation::Tags;

const SCALE_KEYWORDS: &[(&str, &str)] = &[
    ("规模场", "规模场"),
    ("规模", "规模场"),
    ("小散", "小散"),
    ("散户", "小散"),
    ("均价", "均价"),
    ("平均", "均价"),
];

const MODE_KEYWORDS: &[(&str, &str)] = &[("自繁自养", "自繁自养"), ("外购", "外购")];

const SENTIMENT_KEYWORDS: &[&str] = &["平稳", "放缓", "加快", "积极", "谨慎"];

const WEIGHT_LABELS: &[&str] = &["标猪", "肥猪"];

/// Longest city name kept; longer matches are sentence fragments.
const MAX_CITY_CHARS: usize = 10;

static WEIGHT_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)-(\d+)kg").unwrap());

static WEIGHT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)kg").unwrap());

static CITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([^省]+[市县])").unwrap());

fn first_keyword(text: &str, table: &[(&str, &str)]) -> Option<String> {
    table
        .iter()
        .find(|(keyword, _)| text.contains(keyword))
        .map(|(_, value)| value.to_string())
}

fn weight_band(text: &str) -> Option<String> {
    if let Some(caps) = WEIGHT_RANGE_RE.captures(text) {
        return Some(format!("{}-{}kg", &caps[1], &caps[2]));
    }
    if let Some(caps) = WEIGHT_RE.captures(text) {
        return Some(format!("{}kg", &caps[1]));
    }
    WEIGHT_LABELS
        .iter()
        .find(|label| text.contains(*label))
        .map(|label| label.to_string())
}

/// Tags found in `text`: `scale`, `weight_band`, `mode`, `sentiment`, `city`.
pub fn extract_tags_from_text(text: &str) -> Tags {
    let text = text.trim();
    let mut tags = Tags::new();
    if text.is_empty() {
        return tags;
    }
    if let Some(scale) = first_keyword(text, SCALE_KEYWORDS) {
        tags.insert("scale".to_string(), scale);
    }
    if let Some(band) = weight_band(text) {
        tags.insert("weight_band".to_string(), band);
    }
    if let Some(mode) = first_keyword(text, MODE_KEYWORDS) {
        tags.insert("mode".to_string(), mode);
    }
    if let Some(sentiment) = SENTIMENT_KEYWORDS.iter().find(|k| text.contains(*k)) {
        tags.insert("sentiment".to_string(), sentiment.to_string());
    }
    if let Some(caps) = CITY_RE.captures(text) {
        let city = caps[1].trim();
        if city.chars().count() <= MAX_CITY_CHARS {
            tags.insert("city".to_string(), city.to_string());
        }
    }
    tags
}
