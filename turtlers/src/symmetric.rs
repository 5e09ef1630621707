//! Fan-out safe aggregation.
//!
//! Under a one-to-many join the rows of the "one" side are repeated. For a
//! distinct key `k` and precision `ε`:
//!
//! ```text
//! SUM(DISTINCT h(k) + floor(v / ε)) - SUM(DISTINCT h(k))  ==  Σ floor(v / ε)
//! ```
//!
//! counted once per key however many times the row was repeated, as long as
//! the hashes of the keys present do not collide. Multiplying back by `ε`
//! gives the sum to within `ε` per row.

use crate::dialect::Dialect;
use crate::error::{Result, TurtleError};

/// Default precision `ε` of symmetric sums.
///
/// Values are summed in units of `ε`, so the exact integer sums must hold
/// `max_hash * keys + Σ v / ε`. With 64-bit hashes and 38 digit decimals this
/// leaves room for roughly 10^13 distinct keys at values around 10^6.
pub const DEFAULT_PRECISION: f64 = 0.000_001;

/// `1 / ε`, rendered as a SQL numeric literal.
pub fn precision_scale(precision: f64) -> Result<String> {
    if !(precision.is_finite() && precision > 0.0 && precision <= 1.0) {
        return Err(TurtleError::Validation(format!(
            "symmetric precision must be in (0, 1], got {precision}"
        )));
    }
    let scale = 1.0 / precision;
    let rounded = scale.round();
    if (scale - rounded).abs() < 1e-9 * scale {
        Ok(format!("{}", rounded as u64))
    } else {
        Ok(format!("{scale}"))
    }
}

/// Sum of `value` counted once per distinct `key`.
pub fn sum_distinct(dialect: &dyn Dialect, key: &str, value: &str, precision: f64) -> Result<String> {
    if dialect.capabilities().supports_sum_distinct_function {
        return dialect.sum_distinct(key, value, precision);
    }
    let scale = precision_scale(precision)?;
    let hashed = dialect.sum_distinct_hashed_key(key);
    let int_type = dialect.hashed_key_type();
    Ok(format!(
        "(CAST(SUM(DISTINCT {hashed} + CAST(FLOOR(CAST(COALESCE({value}, 0) AS DOUBLE) * {scale}) AS {int_type})) - SUM(DISTINCT {hashed}) AS DOUBLE) / {scale})"
    ))
}

/// Average of `value` counted once per distinct `key`.
pub fn avg_distinct(dialect: &dyn Dialect, key: &str, value: &str, precision: f64) -> Result<String> {
    let sum = sum_distinct(dialect, key, value, precision)?;
    Ok(format!(
        "({sum} / NULLIF(COUNT(DISTINCT CASE WHEN {value} IS NOT NULL THEN {key} END), 0))"
    ))
}

/// Row count counted once per distinct `key`.
pub fn count_distinct_keys(key: &str) -> String {
    format!("COUNT(DISTINCT {key})")
}
