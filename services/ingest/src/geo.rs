//! Province and region vocabulary.

/// Province-level names in canonical short form.
pub const PROVINCES: &[&str] = &[
    "北京", "天津", "河北", "山西", "内蒙古", "辽宁", "吉林", "黑龙江", "上海", "江苏", "浙江",
    "安徽", "福建", "江西", "山东", "河南", "湖北", "湖南", "广东", "广西", "海南", "重庆",
    "四川", "贵州", "云南", "西藏", "陕西", "甘肃", "青海", "宁夏", "新疆", "台湾", "香港",
    "澳门",
];

/// Macro regions: (display name, code).
pub const REGIONS: &[(&str, &str)] = &[
    ("东北", "NORTHEAST"),
    ("华北", "NORTH"),
    ("华东", "EAST"),
    ("华中", "CENTRAL"),
    ("华南", "SOUTH"),
    ("西南", "SOUTHWEST"),
    ("西北", "NORTHWEST"),
];

/// Labels that mean the whole country and therefore no geography.
const NATIONAL_LABELS: &[&str] = &["全国", "中国", "全国均价", "NATION"];

const PROVINCE_ALIASES: &[(&str, &str)] = &[
    ("内蒙", "内蒙古"),
    ("内蒙古自治区", "内蒙古"),
    ("新疆维吾尔自治区", "新疆"),
    ("新疆自治区", "新疆"),
    ("西藏自治区", "西藏"),
    ("宁夏回族自治区", "宁夏"),
    ("宁夏自治区", "宁夏"),
    ("广西壮族自治区", "广西"),
    ("广西自治区", "广西"),
    ("香港特别行政区", "香港"),
    ("澳门特别行政区", "澳门"),
    ("台湾省", "台湾"),
];

const PROVINCE_SUFFIXES: &[&str] = &["特别行政区", "自治区", "省", "市"];

/// Province → region code.
const PROVINCE_REGION: &[(&str, &str)] = &[
    ("北京", "NORTH"),
    ("天津", "NORTH"),
    ("河北", "NORTH"),
    ("山西", "NORTH"),
    ("内蒙古", "NORTH"),
    ("辽宁", "NORTHEAST"),
    ("吉林", "NORTHEAST"),
    ("黑龙江", "NORTHEAST"),
    ("上海", "EAST"),
    ("江苏", "EAST"),
    ("浙江", "EAST"),
    ("安徽", "EAST"),
    ("福建", "EAST"),
    ("江西", "EAST"),
    ("山东", "EAST"),
    ("河南", "CENTRAL"),
    ("湖北", "CENTRAL"),
    ("湖南", "CENTRAL"),
    ("广东", "SOUTH"),
    ("广西", "SOUTH"),
    ("海南", "SOUTH"),
    ("重庆", "SOUTHWEST"),
    ("四川", "SOUTHWEST"),
    ("贵州", "SOUTHWEST"),
    ("云南", "SOUTHWEST"),
    ("西藏", "SOUTHWEST"),
    ("陕西", "NORTHWEST"),
    ("甘肃", "NORTHWEST"),
    ("青海", "NORTHWEST"),
    ("宁夏", "NORTHWEST"),
    ("新疆", "NORTHWEST"),
];

/// Canonical province spelling: aliases first, then administrative suffixes.
pub fn normalize_province(name: &str) -> String {
    let name = name.trim();
    if let Some((_, canonical)) = PROVINCE_ALIASES.iter().find(|(alias, _)| *alias == name) {
        return canonical.to_string();
    }
    let mut out = name.to_string();
    for suffix in PROVINCE_SUFFIXES {
        if let Some(stripped) = out.strip_suffix(suffix) {
            if !stripped.is_empty() {
                out = stripped.to_string();
            }
        }
    }
    out.trim().to_string()
}

pub fn is_province(name: &str) -> bool {
    PROVINCES.contains(&normalize_province(name).as_str())
}

pub fn is_region(name: &str) -> bool {
    REGIONS.iter().any(|(n, _)| *n == name.trim())
}

pub fn is_national(name: &str) -> bool {
    NATIONAL_LABELS.contains(&name.trim())
}

pub fn region_code(name: &str) -> Option<&'static str> {
    REGIONS
        .iter()
        .find(|(n, _)| *n == name.trim())
        .map(|(_, code)| *code)
}

pub fn region_name(code: &str) -> Option<&'static str> {
    REGIONS.iter().find(|(_, c)| *c == code).map(|(n, _)| *n)
}

/// Region code a province belongs to, when known.
pub fn region_of(province: &str) -> Option<&'static str> {
    let canonical = normalize_province(province);
    PROVINCE_REGION
        .iter()
        .find(|(p, _)| *p == canonical)
        .map(|(_, r)| *r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_province_aliases_and_suffixes() {
        assert_eq!(normalize_province("内蒙"), "内蒙古");
        assert_eq!(normalize_province("新疆维吾尔自治区"), "新疆");
        assert_eq!(normalize_province("河北省"), "河北");
        assert_eq!(normalize_province(" 上海市 "), "上海");
        assert_eq!(normalize_province("山东"), "山东");
    }

    #[test]
    fn test_province_and_region_membership() {
        assert!(is_province("黑龙江省"));
        assert!(!is_province("东北"));
        assert!(is_region("东北"));
        assert!(is_national("全国"));
        assert_eq!(region_of("河北省"), Some("NORTH"));
        assert_eq!(region_of("香港"), None);
        assert_eq!(region_code("西南"), Some("SOUTHWEST"));
        assert_eq!(region_name("EAST"), Some("华东"));
    }
}
