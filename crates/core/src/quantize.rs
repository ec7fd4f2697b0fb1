//! Fixed-point quantization of vital values.
//!
//! Every field carries an integer scale factor. A value is stored on the wire
//! as `round(value * scale)` in an `i32`, and recovered as `raw / scale`.
//! Fields without an explicit entry use scale 1.
//!
//! # Rounding
//!
//! Ties round half away from zero (`f64::round`). With scale 10, a skin
//! temperature of 36.55 scales to exactly 365.5 and is stored as 366, which
//! decodes to 36.6. Round-trip error for any present value is at most
//! `1 / scale`.

use std::collections::HashMap;

/// Scale used for fields with no explicit entry.
pub const DEFAULT_SCALE: u32 = 1;

/// Mapping from field code to fixed-point scale factor.
#[derive(Debug, Clone, Default)]
pub struct QuantTable {
    scales: HashMap<String, u32>,
}

impl QuantTable {
    /// Empty table: every field uses `DEFAULT_SCALE`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table used by the standard bedside layout (temperatures at 0.1 resolution).
    pub fn standard() -> Self {
        Self::new().with_scale("TSKIN", 10).with_scale("TRECT", 10)
    }

    /// Builder-style scale override. A scale of 0 is treated as 1.
    pub fn with_scale(mut self, field: impl Into<String>, scale: u32) -> Self {
        self.scales.insert(field.into(), scale.max(1));
        self
    }

    /// Scale factor for a field.
    pub fn scale(&self, field: &str) -> u32 {
        self.scales.get(field).copied().unwrap_or(DEFAULT_SCALE)
    }

    /// Quantize a value for the wire.
    ///
    /// Returns `(present, raw)`. Absent input, non-finite input, and values
    /// whose scaled form does not fit in an `i32` yield `(false, 0)`.
    pub fn quantize(&self, field: &str, value: Option<f64>) -> (bool, i32) {
        let Some(v) = value.filter(|v| v.is_finite()) else {
            return (false, 0);
        };

        let scaled = (v * self.scale(field) as f64).round();
        if scaled < i32::MIN as f64 || scaled > i32::MAX as f64 {
            return (false, 0);
        }

        (true, scaled as i32)
    }

    /// Recover a value from its wire form; `None` when not present.
    pub fn dequantize(&self, field: &str, present: bool, raw: i32) -> Option<f64> {
        present.then(|| raw as f64 / self.scale(field) as f64)
    }
}
