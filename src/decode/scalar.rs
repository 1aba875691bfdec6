use chrono::NaiveDate;

use crate::error::RejectReason;
use crate::source::RawRow;
use crate::util::non_null;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

pub fn text(raw: Option<&str>) -> Option<String> {
    raw.and_then(non_null).map(ToOwned::to_owned)
}

/// Integers exported through a float column arrive as `862.0`; those are
/// accepted as long as they carry no fractional part.
pub fn int(raw: Option<&str>) -> Option<i64> {
    let value = raw.and_then(non_null)?;
    if let Ok(parsed) = value.parse::<i64>() {
        return Some(parsed);
    }
    let float = value.parse::<f64>().ok()?;
    if float.is_finite() && float.fract() == 0.0 && float.abs() < i64::MAX as f64 {
        Some(float as i64)
    } else {
        None
    }
}

pub fn float(raw: Option<&str>) -> Option<f64> {
    raw.and_then(non_null)?
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

pub fn flag(raw: Option<&str>) -> bool {
    raw.map(str::trim)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn date(raw: Option<&str>) -> Option<NaiveDate> {
    let value = raw.and_then(non_null)?;
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

pub fn required_id(
    row: &RawRow,
    columns: &[&str],
    label: &'static str,
) -> Result<i64, RejectReason> {
    let raw = row
        .get_any(columns)
        .and_then(non_null)
        .ok_or(RejectReason::MissingField { column: label })?;
    match int(Some(raw)) {
        Some(value) if value > 0 => Ok(value),
        _ => Err(RejectReason::InvalidField {
            column: label,
            raw: raw.to_string(),
        }),
    }
}

pub fn required_int(
    row: &RawRow,
    columns: &[&str],
    label: &'static str,
) -> Result<i64, RejectReason> {
    let raw = row
        .get_any(columns)
        .and_then(non_null)
        .ok_or(RejectReason::MissingField { column: label })?;
    int(Some(raw)).ok_or_else(|| RejectReason::InvalidField {
        column: label,
        raw: raw.to_string(),
    })
}

pub fn required_float_in(
    row: &RawRow,
    columns: &[&str],
    label: &'static str,
    min: f64,
    max: f64,
) -> Result<f64, RejectReason> {
    let raw = row
        .get_any(columns)
        .and_then(non_null)
        .ok_or(RejectReason::MissingField { column: label })?;
    let value = float(Some(raw)).ok_or_else(|| RejectReason::InvalidField {
        column: label,
        raw: raw.to_string(),
    })?;
    if value < min || value > max {
        return Err(RejectReason::OutOfRange {
            column: label,
            raw: raw.to_string(),
        });
    }
    Ok(value)
}
