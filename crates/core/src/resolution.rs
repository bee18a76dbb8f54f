//! Output resolution handling.
//!
//! The video model requires both dimensions to be multiples of 16.
//! Requested sizes are snapped to the nearest multiple rather than
//! rejected.

use crate::error::CoreError;

/// Dimensions are snapped to multiples of this value.
pub const DIMENSION_MULTIPLE: u32 = 16;

/// Smallest dimension ever sent to the model.
pub const MIN_DIMENSION: u32 = DIMENSION_MULTIPLE;

/// Largest multiple of 16 representable as `u32`.
pub const MAX_DIMENSION: u32 = u32::MAX - (DIMENSION_MULTIPLE - 1);

/// Snap a dimension to the nearest multiple of 16, never below 16.
///
/// Ties round to even (`40 / 16 = 2.5` rounds to `2`, giving `32`), which
/// keeps outputs identical to the workflows the template was tuned with.
/// Values past [`MAX_DIMENSION`] saturate to it, so the result is always a
/// multiple of 16.
pub fn round_to_16(value: f64) -> u32 {
    let snapped = snap(value);
    if snapped < f64::from(MIN_DIMENSION) {
        MIN_DIMENSION
    } else if snapped > f64::from(MAX_DIMENSION) {
        MAX_DIMENSION
    } else {
        snapped as u32
    }
}

fn snap(value: f64) -> f64 {
    let multiple = f64::from(DIMENSION_MULTIPLE);
    (value / multiple).round_ties_even() * multiple
}

/// Parse a job-supplied dimension (JSON number or numeric string) and snap it.
pub fn parse_dimension(field: &'static str, value: &serde_json::Value) -> Result<u32, CoreError> {
    let invalid = || CoreError::InvalidDimension {
        field,
        value: value.to_string(),
    };

    let numeric = match value {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(invalid)?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    if !numeric.is_finite() || snap(numeric) > f64::from(MAX_DIMENSION) {
        return Err(invalid());
    }

    Ok(round_to_16(numeric))
}
