//! Cell normalisation for price-report CSVs.
//!
//! Numbers in the reports use the Chilean locale: `.` groups thousands and
//! `,` marks the decimal part (`"1.652,0000"`). Numeric cells never fail:
//! anything that still does not parse after rewriting becomes zero, so a
//! single bad number does not cost the whole row. The same applies to
//! values the target column cannot hold.

use crate::error::SkipReason;
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::NaiveDate;
use std::str::FromStr;

/// Date format used by the `Fecha` column
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Convert a locale-formatted number into a canonical decimal.
///
/// Thousands dots are removed first, then the decimal comma becomes a point.
/// Unparseable input (including empty cells) yields zero.
pub fn normalize_decimal(raw: &str) -> BigDecimal {
    let canonical = raw.trim().replace('.', "").replace(',', ".");
    BigDecimal::from_str(&canonical).unwrap_or_else(|_| BigDecimal::zero())
}

/// Bounds of a `NUMERIC(precision, scale)` column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericColumn {
    pub precision: u32,
    pub scale: u32,
}

/// `price_facts.volume`
pub const VOLUME_COLUMN: NumericColumn = NumericColumn {
    precision: 15,
    scale: 2,
};

/// `price_facts.price_min/max/avg`
pub const PRICE_COLUMN: NumericColumn = NumericColumn {
    precision: 12,
    scale: 4,
};

impl NumericColumn {
    /// [`normalize_decimal`], rounded to the column scale. Values the column
    /// cannot hold become zero.
    pub fn normalize(&self, raw: &str) -> BigDecimal {
        let value = normalize_decimal(raw);
        if value.is_zero() {
            return value;
        }

        let max_integer_digits = i64::from(self.precision) - i64::from(self.scale);
        let scale = i64::from(self.scale);
        let digits = integer_digits(&value);
        if digits > max_integer_digits || digits < -scale {
            // too large, or rounds to zero at this scale
            return BigDecimal::zero();
        }

        let rounded = value.with_scale_round(scale, RoundingMode::HalfUp);
        // rounding can carry into one more integer digit (9999.99995)
        if !rounded.is_zero() && integer_digits(&rounded) > max_integer_digits {
            return BigDecimal::zero();
        }
        rounded
    }
}

/// Digits before the decimal point; negative for values below 0.1
fn integer_digits(value: &BigDecimal) -> i64 {
    let (unscaled, exponent) = value.as_bigint_and_exponent();
    unscaled.magnitude().to_string().len() as i64 - exponent
}

/// Trim a text cell. Empty stays empty, never absent. NUL bytes are dropped,
/// Postgres text cannot store them.
pub fn normalize_text(raw: &str) -> String {
    if raw.contains('\0') {
        raw.replace('\0', "").trim().to_string()
    } else {
        raw.trim().to_string()
    }
}

/// Parse the `ID region` cell.
///
/// Exports sometimes write codes as floats (`"13.0"`), which are accepted
/// when integral.
pub fn parse_region_code(raw: &str) -> Result<i32, SkipReason> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SkipReason::MissingRegionCode);
    }

    if let Ok(code) = trimmed.parse::<i32>() {
        return Ok(code);
    }

    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.fract() == 0.0)
        .filter(|v| *v >= f64::from(i32::MIN) && *v <= f64::from(i32::MAX))
        .map(|v| v as i32)
        .ok_or_else(|| SkipReason::InvalidRegionCode(trimmed.to_string()))
}

/// Parse the `Fecha` cell with the fixed `YYYY-MM-DD` format
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// Fold a header name for lookup: BOM removed, trimmed, lowercase, no accents.
pub fn fold_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .chars()
        .map(|c| match c {
            'á' | 'Á' => 'a',
            'é' | 'É' => 'e',
            'í' | 'Í' => 'i',
            'ó' | 'Ó' => 'o',
            'ú' | 'Ú' | 'ü' | 'Ü' => 'u',
            'ñ' | 'Ñ' => 'n',
            other => other,
        })
        .flat_map(char::to_lowercase)
        .collect()
}
