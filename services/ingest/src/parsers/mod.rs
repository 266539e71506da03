//! Parser family: one worksheet in, draft observations out.
//!
//! Parser ids in profiles form a closed set ([`ParserId`]); each id maps to
//! one typed config and one extraction routine, so a profile that names an
//! unknown parser or carries a malformed config fails when it is loaded.

pub mod city_matrix;
pub mod enterprise;
pub mod fixed_column;
pub mod free_text;
pub mod narrow;
pub mod period_group;
pub mod white_strip;
pub mod wide;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::IngestError;
use crate::error::{PipelineError, Result};
use crate::fingerprint::{canonical_tags, dedup_key};
use crate::geo::{is_national, is_province, normalize_province};
use crate::observation::{DraftObservation, MetricRef, Period, PeriodType, SourceLocation, Tags};
use crate::values::CleanValue;
use crate::worksheet::Worksheet;

pub use city_matrix::CityMatrixConfig;
pub use enterprise::{EnterpriseConfig, EnterpriseLayout};
pub use fixed_column::{FixedColumnConfig, Instrument};
pub use free_text::FreeTextConfig;
pub use narrow::{ColumnRole, NarrowConfig};
pub use period_group::PeriodGroupConfig;
pub use white_strip::WhiteStripConfig;
pub use wide::{WideLayout, WideMultiConfig, WideSingleConfig};

/// Parser ids accepted in profiles.
///
/// Several ids are aliases that vendors' profiles use for one layout family;
/// [`ParserId::kind`] maps each to its extraction strategy and
/// [`ParserSpec::from_json`] fills the defaults an alias implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParserId {
    NarrowDateRows,
    NarrowDateRowsWideProvinces,
    NarrowDateWideDimCols,
    NarrowDateAuto,
    PeriodEndMultiMetric,
    PeriodStringRowsMultiMetric,
    MixedStaticAndTimeMatrix,
    CrossSectionTable,
    NarrowDateMultiRowDim,
    NarrowDateWithRowDimWideProvince,
    NarrowPeriodEndMultiMetric,
    WideProvinceRowsDateCols,
    NarrowDateRowsWideProvincesTransposed,
    WideDateGroupedSubcols,
    MultiheaderMatrix,
    PeriodStartEndProvinceGroupedSubcols,
    DateSerialGroupedSubcolsWithRowDims,
    PeriodStartEndWideProvince,
    PeriodStartEndWideProvinceWithRowDim,
    PeriodStartEndMultiMetric,
    MonthlyAuto,
    MonthRowYearColMatrix,
    HistoryMatrixAuto,
    PeriodEndFromCol2StartDerived,
    PeriodStringRowsWideProvince,
    PeriodStartEndMultiColWithGroupHeaders,
    DeliveryCityMatrixWithMeta,
    FuturesDaily,
    OptionsDaily,
    GanglianLegacyFormat,
    EnterpriseDaily,
    WhiteStripMarket,
    HuabaoMuyuanWhiteStrip,
}

/// Extraction strategy behind a parser id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ParserKind {
    NarrowDaily,
    WideSingleHeader,
    WideMultiRowHeader,
    PeriodGroupColumns,
    CityMatrix,
    FixedColumnDaily,
    FreeTextLabel,
    EnterpriseDaily,
    WhiteStripMarket,
}

impl ParserId {
    pub const ALL: &'static [ParserId] = &[
        ParserId::NarrowDateRows,
        ParserId::NarrowDateRowsWideProvinces,
        ParserId::NarrowDateWideDimCols,
        ParserId::NarrowDateAuto,
        ParserId::PeriodEndMultiMetric,
        ParserId::PeriodStringRowsMultiMetric,
        ParserId::MixedStaticAndTimeMatrix,
        ParserId::CrossSectionTable,
        ParserId::NarrowDateMultiRowDim,
        ParserId::NarrowDateWithRowDimWideProvince,
        ParserId::NarrowPeriodEndMultiMetric,
        ParserId::WideProvinceRowsDateCols,
        ParserId::NarrowDateRowsWideProvincesTransposed,
        ParserId::WideDateGroupedSubcols,
        ParserId::MultiheaderMatrix,
        ParserId::PeriodStartEndProvinceGroupedSubcols,
        ParserId::DateSerialGroupedSubcolsWithRowDims,
        ParserId::PeriodStartEndWideProvince,
        ParserId::PeriodStartEndWideProvinceWithRowDim,
        ParserId::PeriodStartEndMultiMetric,
        ParserId::MonthlyAuto,
        ParserId::MonthRowYearColMatrix,
        ParserId::HistoryMatrixAuto,
        ParserId::PeriodEndFromCol2StartDerived,
        ParserId::PeriodStringRowsWideProvince,
        ParserId::PeriodStartEndMultiColWithGroupHeaders,
        ParserId::DeliveryCityMatrixWithMeta,
        ParserId::FuturesDaily,
        ParserId::OptionsDaily,
        ParserId::GanglianLegacyFormat,
        ParserId::EnterpriseDaily,
        ParserId::WhiteStripMarket,
        ParserId::HuabaoMuyuanWhiteStrip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParserId::NarrowDateRows => "NARROW_DATE_ROWS",
            ParserId::NarrowDateRowsWideProvinces => "NARROW_DATE_ROWS_WIDE_PROVINCES",
            ParserId::NarrowDateWideDimCols => "NARROW_DATE_WIDE_DIM_COLS",
            ParserId::NarrowDateAuto => "NARROW_DATE_AUTO",
            ParserId::PeriodEndMultiMetric => "PERIOD_END_MULTI_METRIC",
            ParserId::PeriodStringRowsMultiMetric => "PERIOD_STRING_ROWS_MULTI_METRIC",
            ParserId::MixedStaticAndTimeMatrix => "MIXED_STATIC_AND_TIME_MATRIX",
            ParserId::CrossSectionTable => "CROSS_SECTION_TABLE",
            ParserId::NarrowDateMultiRowDim => "NARROW_DATE_MULTI_ROW_DIM",
            ParserId::NarrowDateWithRowDimWideProvince => "NARROW_DATE_WITH_ROW_DIM_WIDE_PROVINCE",
            ParserId::NarrowPeriodEndMultiMetric => "NARROW_PERIOD_END_MULTI_METRIC",
            ParserId::WideProvinceRowsDateCols => "WIDE_PROVINCE_ROWS_DATE_COLS",
            ParserId::NarrowDateRowsWideProvincesTransposed => "NARROW_DATE_ROWS_WIDE_PROVINCES_TRANSPOSED",
            ParserId::WideDateGroupedSubcols => "WIDE_DATE_GROUPED_SUBCOLS",
            ParserId::MultiheaderMatrix => "MULTIHEADER_MATRIX",
            ParserId::PeriodStartEndProvinceGroupedSubcols => "PERIOD_START_END_PROVINCE_GROUPED_SUBCOLS",
            ParserId::DateSerialGroupedSubcolsWithRowDims => "DATE_SERIAL_GROUPED_SUBCOLS_WITH_ROW_DIMS",
            ParserId::PeriodStartEndWideProvince => "PERIOD_START_END_WIDE_PROVINCE",
            ParserId::PeriodStartEndWideProvinceWithRowDim => "PERIOD_START_END_WIDE_PROVINCE_WITH_ROW_DIM",
            ParserId::PeriodStartEndMultiMetric => "PERIOD_START_END_MULTI_METRIC",
            ParserId::MonthlyAuto => "MONTHLY_AUTO",
            ParserId::MonthRowYearColMatrix => "MONTH_ROW_YEAR_COL_MATRIX",
            ParserId::HistoryMatrixAuto => "HISTORY_MATRIX_AUTO",
            ParserId::PeriodEndFromCol2StartDerived => "PERIOD_END_FROM_COL2_START_DERIVED",
            ParserId::PeriodStringRowsWideProvince => "PERIOD_STRING_ROWS_WIDE_PROVINCE",
            ParserId::PeriodStartEndMultiColWithGroupHeaders => "PERIOD_START_END_MULTI_COL_WITH_GROUP_HEADERS",
            ParserId::DeliveryCityMatrixWithMeta => "DELIVERY_CITY_MATRIX_WITH_META",
            ParserId::FuturesDaily => "FUTURES_DAILY",
            ParserId::OptionsDaily => "OPTIONS_DAILY",
            ParserId::GanglianLegacyFormat => "GANGLIAN_LEGACY_FORMAT",
            ParserId::EnterpriseDaily => "ENTERPRISE_DAILY",
            ParserId::WhiteStripMarket => "WHITE_STRIP_MARKET",
            ParserId::HuabaoMuyuanWhiteStrip => "HUABAO_MUYUAN_WHITE_STRIP",
        }
    }

    pub fn kind(&self) -> ParserKind {
        use ParserId::*;
        match self {
            NarrowDateRows
            | NarrowDateRowsWideProvinces
            | NarrowDateWideDimCols
            | NarrowDateAuto
            | PeriodEndMultiMetric
            | PeriodStringRowsMultiMetric
            | MixedStaticAndTimeMatrix
            | CrossSectionTable
            | NarrowDateMultiRowDim
            | NarrowDateWithRowDimWideProvince
            | NarrowPeriodEndMultiMetric => ParserKind::NarrowDaily,
            WideProvinceRowsDateCols | NarrowDateRowsWideProvincesTransposed => ParserKind::WideSingleHeader,
            WideDateGroupedSubcols
            | MultiheaderMatrix
            | PeriodStartEndProvinceGroupedSubcols
            | DateSerialGroupedSubcolsWithRowDims
            | PeriodStartEndWideProvince
            | PeriodStartEndWideProvinceWithRowDim
            | PeriodStartEndMultiMetric
            | MonthlyAuto
            | MonthRowYearColMatrix
            | HistoryMatrixAuto
            | PeriodEndFromCol2StartDerived
            | PeriodStringRowsWideProvince => ParserKind::WideMultiRowHeader,
            PeriodStartEndMultiColWithGroupHeaders => ParserKind::PeriodGroupColumns,
            DeliveryCityMatrixWithMeta => ParserKind::CityMatrix,
            FuturesDaily | OptionsDaily => ParserKind::FixedColumnDaily,
            GanglianLegacyFormat => ParserKind::FreeTextLabel,
            EnterpriseDaily => ParserKind::EnterpriseDaily,
            WhiteStripMarket | HuabaoMuyuanWhiteStrip => ParserKind::WhiteStripMarket,
        }
    }

    /// Layout of a wide multi-row-header id when the config names none.
    fn wide_layout(&self) -> WideLayout {
        match self {
            ParserId::WideDateGroupedSubcols
            | ParserId::MultiheaderMatrix
            | ParserId::PeriodStartEndProvinceGroupedSubcols
            | ParserId::DateSerialGroupedSubcolsWithRowDims => WideLayout::DateGroups,
            _ => WideLayout::PeriodColumns,
        }
    }

    /// Period a narrow id implies when neither sheet nor profile names one.
    fn narrow_period(&self) -> Option<PeriodType> {
        match self {
            ParserId::PeriodEndMultiMetric
            | ParserId::PeriodStringRowsMultiMetric
            | ParserId::NarrowPeriodEndMultiMetric => Some(PeriodType::Week),
            _ => None,
        }
    }
}

impl fmt::Display for ParserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParserId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        ParserId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| PipelineError::Profile(format!("unknown parser '{}'", wanted)))
    }
}

/// Metric identity and period defaults shared by most parser configs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetricTemplate {
    pub metric_key: Option<String>,
    pub metric_name: Option<String>,
    pub unit: Option<String>,
    pub period_type: Option<PeriodType>,
    pub freq: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

impl MetricTemplate {
    /// Metric for `header`: the template key when set, else one derived
    /// from the source code and header text.
    pub fn metric_for(&self, source_code: &str, header: &str) -> MetricRef {
        let key = self
            .metric_key
            .clone()
            .unwrap_or_else(|| derive_metric_key(source_code, header));
        MetricRef {
            key,
            name: self.metric_name.clone().unwrap_or_else(|| header.to_string()),
            raw_header: header.to_string(),
            unit: self.unit.clone(),
            freq: self.freq.clone(),
        }
    }

    /// One metric for a whole sheet whose columns are not metrics, labelled
    /// by the configured name, else the key, else the sheet name.
    pub fn sheet_metric(&self, source_code: &str, sheet_name: &str) -> MetricRef {
        let header = self
            .metric_name
            .as_deref()
            .or(self.metric_key.as_deref())
            .unwrap_or(sheet_name)
            .to_string();
        self.metric_for(source_code, &header)
    }
}

/// Typed config for one parser, validated at profile load.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserConfig {
    NarrowDaily(NarrowConfig),
    WideSingleHeader(WideSingleConfig),
    WideMultiRowHeader(WideMultiConfig),
    PeriodGroupColumns(PeriodGroupConfig),
    CityMatrix(CityMatrixConfig),
    FixedColumnDaily(FixedColumnConfig),
    FreeTextLabel(FreeTextConfig),
    EnterpriseDaily(EnterpriseConfig),
    WhiteStripMarket(WhiteStripConfig),
}

/// A parser id with its validated config.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserSpec {
    pub id: ParserId,
    pub config: ParserConfig,
}

impl ParserSpec {
    pub fn from_json(id: ParserId, value: &serde_json::Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            PipelineError::Profile(format!("invalid {} config: {}", id, e))
        };
        let value = if value.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            value.clone()
        };
        let config = match id.kind() {
            ParserKind::NarrowDaily => {
                let mut c: NarrowConfig = serde_json::from_value(value).map_err(invalid)?;
                c.default_period = id.narrow_period();
                c.validate()?;
                ParserConfig::NarrowDaily(c)
            }
            ParserKind::WideSingleHeader => {
                let c: WideSingleConfig = serde_json::from_value(value).map_err(invalid)?;
                c.validate()?;
                ParserConfig::WideSingleHeader(c)
            }
            ParserKind::WideMultiRowHeader => {
                let mut c: WideMultiConfig = serde_json::from_value(value).map_err(invalid)?;
                if c.layout.is_none() {
                    c.layout = Some(id.wide_layout());
                }
                c.validate()?;
                ParserConfig::WideMultiRowHeader(c)
            }
            ParserKind::PeriodGroupColumns => {
                let c: PeriodGroupConfig = serde_json::from_value(value).map_err(invalid)?;
                c.validate()?;
                ParserConfig::PeriodGroupColumns(c)
            }
            ParserKind::CityMatrix => {
                let c: CityMatrixConfig = serde_json::from_value(value).map_err(invalid)?;
                c.validate()?;
                ParserConfig::CityMatrix(c)
            }
            ParserKind::FixedColumnDaily => {
                let mut c: FixedColumnConfig = serde_json::from_value(value).map_err(invalid)?;
                c.instrument = match id {
                    ParserId::OptionsDaily => Instrument::Options,
                    _ => Instrument::Futures,
                };
                c.validate()?;
                ParserConfig::FixedColumnDaily(c)
            }
            ParserKind::FreeTextLabel => {
                let c: FreeTextConfig = serde_json::from_value(value).map_err(invalid)?;
                c.validate()?;
                ParserConfig::FreeTextLabel(c)
            }
            ParserKind::EnterpriseDaily => {
                let c: EnterpriseConfig = serde_json::from_value(value).map_err(invalid)?;
                ParserConfig::EnterpriseDaily(c)
            }
            ParserKind::WhiteStripMarket => {
                let c: WhiteStripConfig = serde_json::from_value(value).map_err(invalid)?;
                c.validate()?;
                ParserConfig::WhiteStripMarket(c)
            }
        };
        Ok(Self { id, config })
    }
}

/// Profile-wide defaults handed to every parser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileDefaults {
    pub period_type: Option<PeriodType>,
    pub unit: Option<String>,
    pub tags: Tags,
}

pub struct ParseContext<'a> {
    pub sheet_name: &'a str,
    pub source_code: &'a str,
    pub defaults: &'a ProfileDefaults,
}

/// Parser result: drafts plus row-level issues with exact locations.
#[derive(Debug, Default)]
pub struct ParseOutput {
    pub observations: Vec<DraftObservation>,
    pub issues: Vec<IngestError>,
}

/// Parts of a draft that vary per parser; [`ParseContext::draft`] turns
/// them into an observation with a fingerprint.
pub struct DraftParts {
    pub metric: MetricRef,
    pub period: Period,
    pub value: CleanValue,
    pub geo: Option<String>,
    pub tags: Tags,
    pub row: usize,
    pub col: usize,
}

impl ParseContext<'_> {
    /// Period type from the sheet config, else the profile, else `fallback`.
    pub fn period_type(&self, configured: Option<PeriodType>, fallback: PeriodType) -> PeriodType {
        configured.or(self.defaults.period_type).unwrap_or(fallback)
    }

    /// Every parser builds drafts here so geography, tags and the dedup
    /// fingerprint are canonicalized the same way on every path.
    pub fn draft(&self, parts: DraftParts) -> DraftObservation {
        let mut tags: Tags = self.defaults.tags.clone();
        tags.extend(parts.tags);
        let tags = canonical_tags(&tags);
        let geo_code = parts.geo.as_deref().and_then(canonical_geo_label);

        let mut metric = parts.metric;
        if metric.unit.is_none() {
            metric.unit = self.defaults.unit.clone();
        }

        let dedup_key = dedup_key(
            self.source_code,
            self.sheet_name,
            &metric.key,
            geo_code.as_deref(),
            parts.period.key_date(),
            &tags,
        );
        DraftObservation {
            source_code: self.source_code.to_string(),
            sheet_name: self.sheet_name.to_string(),
            metric,
            period: parts.period,
            value: parts.value.value,
            raw_value: Some(parts.value.raw),
            geo_code,
            tags,
            dedup_key,
            location: SourceLocation::at(self.sheet_name, parts.row, parts.col),
        }
    }
}

/// Geography label as stored: national labels drop to `None`, provinces
/// take their canonical spelling, anything else is kept trimmed.
pub fn canonical_geo_label(label: &str) -> Option<String> {
    let label = label.trim();
    if label.is_empty() || is_national(label) {
        return None;
    }
    if is_province(label) {
        return Some(normalize_province(label));
    }
    Some(label.to_string())
}

/// `{SOURCE}_{HEADER}` with whitespace and separators folded to `_`.
pub fn derive_metric_key(source_code: &str, header: &str) -> String {
    let mut key = String::with_capacity(source_code.len() + header.len() + 1);
    key.push_str(&source_code.trim().to_uppercase());
    key.push('_');
    let mut last_underscore = true;
    for ch in header.trim().chars() {
        if ch.is_whitespace() || matches!(ch, '|' | '/' | ':' | '：' | '-' | '(' | ')' | '（' | '）') {
            if !last_underscore {
                key.push('_');
                last_underscore = true;
            }
        } else {
            key.extend(ch.to_uppercase());
            last_underscore = false;
        }
    }
    key.trim_end_matches('_').to_string()
}

/// 1-based config index to a 0-based grid index.
pub(crate) fn zero_based(index: usize, what: &str) -> Result<usize> {
    index
        .checked_sub(1)
        .ok_or_else(|| PipelineError::Profile(format!("{} is 1-based, got 0", what)))
}

/// Runs the parser bound to `spec` over one worksheet.
pub fn parse_sheet(spec: &ParserSpec, ws: &Worksheet, ctx: &ParseContext) -> Result<ParseOutput> {
    match &spec.config {
        ParserConfig::NarrowDaily(c) => narrow::parse(ws, c, ctx),
        ParserConfig::WideSingleHeader(c) => wide::parse_single(ws, c, ctx),
        ParserConfig::WideMultiRowHeader(c) => wide::parse_multi(ws, c, ctx),
        ParserConfig::PeriodGroupColumns(c) => period_group::parse(ws, c, ctx),
        ParserConfig::CityMatrix(c) => city_matrix::parse(ws, c, ctx),
        ParserConfig::FixedColumnDaily(c) => fixed_column::parse(ws, c, ctx),
        ParserConfig::FreeTextLabel(c) => free_text::parse(ws, c, ctx),
        ParserConfig::EnterpriseDaily(c) => enterprise::parse(ws, c, ctx),
        ParserConfig::WhiteStripMarket(c) => white_strip::parse(ws, c, ctx),
    }
}

/// Sorted list helper used by configs that name fields.
pub(crate) type FieldMap = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parser_id_round_trip_names() {
        for id in ParserId::ALL {
            assert_eq!(id.as_str().parse::<ParserId>().unwrap(), *id);
            let json = serde_json::to_string(id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
        }
        assert!("P99_MYSTERY".parse::<ParserId>().is_err());
    }

    #[test]
    fn test_registry_covers_every_variant_once() {
        assert_eq!(ParserId::ALL.len(), 33);
        let unique: std::collections::HashSet<_> = ParserId::ALL.iter().collect();
        assert_eq!(unique.len(), ParserId::ALL.len());
        assert_eq!(
            "period_end_from_col2_start_derived".parse::<ParserId>().unwrap(),
            ParserId::PeriodEndFromCol2StartDerived
        );
    }

    #[test]
    fn test_parser_kinds() {
        assert_eq!(ParserId::PeriodStartEndWideProvince.kind(), ParserKind::WideMultiRowHeader);
        assert_eq!(ParserId::OptionsDaily.kind(), ParserKind::FixedColumnDaily);
        assert_eq!(ParserId::NarrowDateAuto.kind(), ParserKind::NarrowDaily);
        assert_eq!(ParserId::NarrowDateRowsWideProvincesTransposed.kind(), ParserKind::WideSingleHeader);
        assert_eq!(
            ParserId::PeriodStartEndMultiColWithGroupHeaders.kind(),
            ParserKind::PeriodGroupColumns
        );
        assert_eq!(ParserId::DeliveryCityMatrixWithMeta.kind(), ParserKind::CityMatrix);
        assert_eq!(ParserId::EnterpriseDaily.kind(), ParserKind::EnterpriseDaily);
        assert_eq!(ParserId::HuabaoMuyuanWhiteStrip.kind(), ParserKind::WhiteStripMarket);
    }

    #[test]
    fn test_aliases_fill_layout_and_period_defaults() {
        let spec = ParserSpec::from_json(ParserId::MultiheaderMatrix, &serde_json::Value::Null).unwrap();
        let ParserConfig::WideMultiRowHeader(c) = spec.config else {
            panic!("expected wide multi config");
        };
        assert_eq!(c.layout, Some(WideLayout::DateGroups));

        let spec = ParserSpec::from_json(ParserId::MonthlyAuto, &serde_json::Value::Null).unwrap();
        let ParserConfig::WideMultiRowHeader(c) = spec.config else {
            panic!("expected wide multi config");
        };
        assert_eq!(c.layout, Some(WideLayout::PeriodColumns));

        let spec = ParserSpec::from_json(ParserId::PeriodEndMultiMetric, &serde_json::Value::Null).unwrap();
        let ParserConfig::NarrowDaily(c) = spec.config else {
            panic!("expected narrow config");
        };
        assert_eq!(c.default_period, Some(PeriodType::Week));

        let spec = ParserSpec::from_json(ParserId::NarrowDateAuto, &serde_json::Value::Null).unwrap();
        let ParserConfig::NarrowDaily(c) = spec.config else {
            panic!("expected narrow config");
        };
        assert_eq!(c.default_period, None);
    }

    #[test]
    fn test_new_families_build_their_configs() {
        let spec = ParserSpec::from_json(
            ParserId::PeriodStartEndMultiColWithGroupHeaders,
            &serde_json::json!({"metric_template": {"metric_key": "YY_FARM_PROFIT"}}),
        )
        .unwrap();
        assert!(matches!(spec.config, ParserConfig::PeriodGroupColumns(_)));

        let spec = ParserSpec::from_json(ParserId::DeliveryCityMatrixWithMeta, &serde_json::Value::Null).unwrap();
        assert!(matches!(spec.config, ParserConfig::CityMatrix(ref c) if c.city_start_row == 5));

        let spec = ParserSpec::from_json(
            ParserId::EnterpriseDaily,
            &serde_json::json!({"layout": "southwest_summary"}),
        )
        .unwrap();
        assert!(matches!(
            spec.config,
            ParserConfig::EnterpriseDaily(ref c) if c.layout == Some(EnterpriseLayout::SouthwestSummary)
        ));

        let err = ParserSpec::from_json(ParserId::WhiteStripMarket, &serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, PipelineError::Profile(_)));
        let spec = ParserSpec::from_json(
            ParserId::HuabaoMuyuanWhiteStrip,
            &serde_json::json!({
                "header_row": 1,
                "sub_header_row": 2,
                "metrics_from_columns": [{"column_pattern": "华东", "metric_key": "MUYUAN_EAST"}]
            }),
        )
        .unwrap();
        assert!(matches!(spec.config, ParserConfig::WhiteStripMarket(ref c) if c.sub_header_row == Some(2)));
    }

    #[test]
    fn test_spec_defaults_layout_and_instrument_by_id() {
        let spec = ParserSpec::from_json(
            ParserId::WideDateGroupedSubcols,
            &serde_json::json!({"metric_template": {"metric_key": "PRICE"}}),
        )
        .unwrap();
        let ParserConfig::WideMultiRowHeader(c) = spec.config else {
            panic!("expected wide multi config");
        };
        assert_eq!(c.layout, Some(WideLayout::DateGroups));

        let spec = ParserSpec::from_json(ParserId::OptionsDaily, &serde_json::Value::Null).unwrap();
        let ParserConfig::FixedColumnDaily(c) = spec.config else {
            panic!("expected fixed column config");
        };
        assert_eq!(c.instrument, Instrument::Options);
    }

    #[test]
    fn test_spec_rejects_malformed_config() {
        let err = ParserSpec::from_json(
            ParserId::NarrowDateRows,
            &serde_json::json!({"header_row": "first"}),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Profile(_)));
    }

    #[test]
    fn test_derive_metric_key() {
        assert_eq!(derive_metric_key("yongyi", "Region A price"), "YONGYI_REGION_A_PRICE");
        assert_eq!(derive_metric_key("GL", "商品猪：出栏均价（日）"), "GL_商品猪_出栏均价_日");
    }

    #[test]
    fn test_draft_merges_default_tags_and_canonicalizes_geo() {
        let defaults = ProfileDefaults {
            tags: [("source_kind".to_string(), "vendor".to_string())].into(),
            unit: Some("元/公斤".to_string()),
            ..ProfileDefaults::default()
        };
        let ctx = ParseContext {
            sheet_name: "价格",
            source_code: "YONGYI",
            defaults: &defaults,
        };
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let draft = ctx.draft(DraftParts {
            metric: MetricTemplate::default().metric_for("YONGYI", "价格"),
            period: Period::day(date),
            value: CleanValue {
                value: 15.2,
                raw: "15.2".to_string(),
            },
            geo: Some("河北省".to_string()),
            tags: Tags::new(),
            row: 1,
            col: 1,
        });
        assert_eq!(draft.geo_code.as_deref(), Some("河北"));
        assert_eq!(draft.tags.get("source_kind").map(String::as_str), Some("vendor"));
        assert_eq!(draft.metric.unit.as_deref(), Some("元/公斤"));
        assert_eq!(draft.location.to_string(), "xls:sheet='价格':row=2:col=2");

        let national = ctx.draft(DraftParts {
            metric: MetricTemplate::default().metric_for("YONGYI", "价格"),
            period: Period::day(date),
            value: CleanValue {
                value: 15.2,
                raw: "15.2".to_string(),
            },
            geo: Some("全国".to_string()),
            tags: Tags::new(),
            row: 1,
            col: 1,
        });
        assert_eq!(national.geo_code, None);
    }
}
