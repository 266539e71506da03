//! Draft validation ahead of persistence.

use std::collections::HashSet;

use crate::errors::{ErrorKind, IngestError};
use crate::observation::{DraftObservation, PeriodType};

const PRICE_RANGE: (f64, f64) = (0.0, 100.0);
const SLAUGHTER_RANGE: (f64, f64) = (0.0, 1_000_000.0);

#[derive(Debug, Default)]
pub struct Validation {
    pub accepted: Vec<DraftObservation>,
    /// Rows dropped by a blocking error.
    pub rejected: usize,
    pub errors: Vec<IngestError>,
}

/// Checks one sheet's drafts in source order. A fingerprint seen earlier in
/// the same sheet fails the later row; range checks only warn.
pub fn validate(drafts: Vec<DraftObservation>) -> Validation {
    let mut out = Validation::default();
    let mut seen: HashSet<String> = HashSet::new();

    for draft in drafts {
        if let Some(error) = blocking_error(&draft, &seen) {
            out.errors.push(error.at(&draft.location).with_raw_value(
                draft.raw_value.clone().unwrap_or_default(),
            ));
            out.rejected += 1;
            continue;
        }
        if let Some(warning) = range_warning(&draft) {
            out.errors.push(warning.at(&draft.location));
        }
        seen.insert(draft.dedup_key.clone());
        out.accepted.push(draft);
    }
    out
}

fn blocking_error(draft: &DraftObservation, seen: &HashSet<String>) -> Option<IngestError> {
    if draft.metric.key.trim().is_empty() {
        return Some(IngestError::new(ErrorKind::MissingRequired, "metric_key is required"));
    }
    match draft.period.period_type {
        PeriodType::Day if draft.period.obs_date.is_none() => {
            return Some(IngestError::new(
                ErrorKind::MissingRequired,
                "obs_date is required for daily observations",
            ));
        }
        PeriodType::Week | PeriodType::Month | PeriodType::Range if draft.period.end.is_none() => {
            return Some(IngestError::new(
                ErrorKind::MissingRequired,
                format!("period_end is required for {} observations", draft.period.period_type),
            ));
        }
        _ => {}
    }
    if !draft.value.is_finite() {
        return Some(IngestError::new(
            ErrorKind::InvalidValue,
            format!("value {} is not a finite number", draft.value),
        ));
    }
    if draft.dedup_key.is_empty() {
        return Some(IngestError::new(ErrorKind::MissingRequired, "dedup_key is required"));
    }
    if seen.contains(&draft.dedup_key) {
        return Some(IngestError::new(
            ErrorKind::DuplicateKey,
            format!("duplicate observation for metric {} in sheet", draft.metric.key),
        ));
    }
    None
}

fn range_warning(draft: &DraftObservation) -> Option<IngestError> {
    let key = draft.metric.key.to_uppercase();
    let (label, (min, max)) = if key.contains("PRICE") {
        ("price", PRICE_RANGE)
    } else if key.contains("SLAUGHTER") {
        ("slaughter", SLAUGHTER_RANGE)
    } else {
        return None;
    };
    if draft.value < min || draft.value > max {
        Some(
            IngestError::new(
                ErrorKind::OutOfRange,
                format!("{} value {} outside [{}, {}]", label, draft.value, min, max),
            )
            .with_raw_value(draft.raw_value.clone().unwrap_or_default()),
        )
    } else {
        None
    }
}
