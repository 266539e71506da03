//! Dedup fingerprint: one hash per logical observation, identical across
//! every parse path that can produce it.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::observation::Tags;

/// Stand-in for "no geography" inside the fingerprint.
pub const NATION: &str = "NATION";

/// Canonical geography: trimmed, blanks and the sentinel itself collapse to `None`.
pub fn canonical_geo(geo: Option<&str>) -> Option<String> {
    geo.map(str::trim)
        .filter(|g| !g.is_empty() && !g.eq_ignore_ascii_case(NATION))
        .map(str::to_string)
}

/// Trims keys and values, drops empty values and unifies range dashes so
/// "110—125KG" and "110-125kg" tag the same fact.
pub fn canonical_tags(tags: &Tags) -> Tags {
    tags.iter()
        .filter_map(|(k, v)| {
            let key = k.trim();
            let value = v
                .trim()
                .replace(['—', '～', '~'], "-")
                .replace("KG", "kg")
                .replace("Kg", "kg");
            (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value))
        })
        .collect()
}

/// `source|sheet|metric|geo-or-NATION|date|k=v|k=v...` with tags sorted by key.
pub fn canonical_input(
    source_code: &str,
    sheet_name: &str,
    metric_key: &str,
    geo: Option<&str>,
    date: Option<NaiveDate>,
    tags: &Tags,
) -> String {
    let geo = canonical_geo(geo).unwrap_or_else(|| NATION.to_string());
    let date = date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
    let tags = canonical_tags(tags)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("|");
    format!(
        "{}|{}|{}|{}|{}|{}",
        source_code.trim(),
        sheet_name.trim(),
        metric_key.trim(),
        geo,
        date,
        tags
    )
}

pub fn dedup_key(
    source_code: &str,
    sheet_name: &str,
    metric_key: &str,
    geo: Option<&str>,
    date: Option<NaiveDate>,
    tags: &Tags,
) -> String {
    let canonical = canonical_input(source_code, sheet_name, metric_key, geo, date, tags);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_canonical_input_national_no_tags() {
        let s = canonical_input("YONGYI", "价格", "PRICE", None, Some(d(2024, 1, 1)), &Tags::new());
        assert_eq!(s, "YONGYI|价格|PRICE|NATION|2024-01-01|");
    }

    #[test]
    fn test_nation_sentinel_and_blank_geo_collide() {
        let a = dedup_key("S", "s", "M", None, Some(d(2024, 1, 1)), &Tags::new());
        let b = dedup_key("S", "s", "M", Some("NATION"), Some(d(2024, 1, 1)), &Tags::new());
        let c = dedup_key("S", "s", "M", Some("  "), Some(d(2024, 1, 1)), &Tags::new());
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_tag_order_and_spelling_do_not_matter() {
        let a = dedup_key(
            "S",
            "s",
            "M",
            Some("河北"),
            Some(d(2024, 1, 1)),
            &tags(&[("weight_range", "110—125KG"), ("pig_type", "标猪")]),
        );
        let b = dedup_key(
            "S",
            "s",
            "M",
            Some(" 河北 "),
            Some(d(2024, 1, 1)),
            &tags(&[("pig_type", " 标猪"), ("weight_range", "110-125kg"), ("empty", "")]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_facts_get_distinct_keys() {
        let base = dedup_key("S", "s", "M", Some("河北"), Some(d(2024, 1, 1)), &Tags::new());
        assert_ne!(base, dedup_key("S", "s", "M", Some("山东"), Some(d(2024, 1, 1)), &Tags::new()));
        assert_ne!(base, dedup_key("S", "s", "M", Some("河北"), Some(d(2024, 1, 2)), &Tags::new()));
        assert_ne!(base, dedup_key("S", "s", "M2", Some("河北"), Some(d(2024, 1, 1)), &Tags::new()));
        assert_ne!(
            base,
            dedup_key("S", "s", "M", Some("河北"), Some(d(2024, 1, 1)), &tags(&[("field", "价格")]))
        );
    }

    #[test]
    fn test_dedup_key_is_stable() {
        let t = tags(&[("contract", "LH2405")]);
        let first = dedup_key("DCE", "日历史", "CLOSE", None, Some(d(2024, 3, 1)), &t);
        for _ in 0..10 {
            assert_eq!(first, dedup_key("DCE", "日历史", "CLOSE", None, Some(d(2024, 3, 1)), &t));
        }
    }
}
