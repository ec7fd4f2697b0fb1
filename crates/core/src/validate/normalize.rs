//! Loosely-typed JSON values to numbers, epochs and packet ids.
//!
//! Decoded and truth streams come from different writers over a long
//! history, so the same field may be a number, a numeric string, a string
//! with a unit suffix ("72 bpm"), or garbage.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of normalizing one cell value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Ok,
    Missing,
    Invalid,
    /// No truth row could be aligned with the decoded record
    TruthMissing,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellStatus::Ok => "ok",
            CellStatus::Missing => "missing",
            CellStatus::Invalid => "invalid",
            CellStatus::TruthMissing => "truth_missing",
        }
    }
}

/// Compiled patterns used while normalizing records.
#[derive(Debug, Clone)]
pub struct Normalizer {
    number: Regex,
    filename_ts: Regex,
}

impl Normalizer {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| Regex::new(pattern).map_err(|e| Error::Config(e.to_string()));
        Ok(Self {
            number: compile(r"[-+]?\d*\.?\d+")?,
            filename_ts: compile(r"(\d{8})_(\d{6})_(\d{3})")?,
        })
    }

    /// Normalize a cell value to a finite number or a status.
    ///
    /// - null, empty strings and non-finite results are `Missing`
    /// - booleans, arrays, objects and strings with no number are `Invalid`
    /// - strings yield their first embedded number ("72 bpm" is 72)
    pub fn number(&self, value: Option<&Value>) -> (Option<f64>, CellStatus) {
        let finite = |f: f64| {
            if f.is_finite() {
                (Some(f), CellStatus::Ok)
            } else {
                (None, CellStatus::Missing)
            }
        };

        match value {
            None | Some(Value::Null) => (None, CellStatus::Missing),
            Some(Value::Number(n)) => n.as_f64().map_or((None, CellStatus::Invalid), finite),
            Some(Value::String(s)) => {
                let text = s.trim();
                if text.is_empty() {
                    return (None, CellStatus::Missing);
                }
                match self.number.find(text).map(|m| m.as_str().parse::<f64>()) {
                    Some(Ok(f)) => finite(f),
                    _ => (None, CellStatus::Invalid),
                }
            }
            Some(_) => (None, CellStatus::Invalid),
        }
    }

    /// Epoch milliseconds from a string like `..._20240610_061320_123.png`.
    ///
    /// The embedded wall time carries no zone and is read as UTC.
    pub fn epoch_from_filename(&self, text: &str) -> Option<i64> {
        let caps = self.filename_ts.captures(text)?;
        let stamp = format!("{}_{}_{}", &caps[1], &caps[2], &caps[3]);
        NaiveDateTime::parse_from_str(&stamp, "%Y%m%d_%H%M%S_%3f")
            .ok()
            .map(|dt| dt.and_utc().timestamp_millis())
    }
}

/// Epoch milliseconds from a number or numeric string, rounded.
pub fn epoch_ms(value: Option<&Value>) -> Option<i64> {
    let f = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    finite_to_i64(f.round())
}

/// Packet id from an integer, a float (truncated) or an integer string.
pub fn packet_id(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(|f| finite_to_i64(f.trunc()))),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Epoch milliseconds from ISO-8601 text; a trailing `Z` is accepted and
/// text without an offset is read as UTC.
pub fn epoch_from_iso(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn finite_to_i64(f: f64) -> Option<i64> {
    (f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64).then_some(f as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_statuses() {
        let n = Normalizer::new().unwrap();
        assert_eq!(n.number(Some(&json!(72))), (Some(72.0), CellStatus::Ok));
        assert_eq!(n.number(Some(&json!("36.6"))), (Some(36.6), CellStatus::Ok));
        assert_eq!(n.number(Some(&json!("72 bpm"))), (Some(72.0), CellStatus::Ok));
        assert_eq!(n.number(Some(&json!("-4"))), (Some(-4.0), CellStatus::Ok));

        assert_eq!(n.number(None), (None, CellStatus::Missing));
        assert_eq!(n.number(Some(&Value::Null)), (None, CellStatus::Missing));
        assert_eq!(n.number(Some(&json!("   "))), (None, CellStatus::Missing));

        assert_eq!(n.number(Some(&json!(true))), (None, CellStatus::Invalid));
        assert_eq!(n.number(Some(&json!("n/a"))), (None, CellStatus::Invalid));
        assert_eq!(n.number(Some(&json!([1]))), (None, CellStatus::Invalid));
    }

    #[test]
    fn test_epoch_and_packet_id() {
        assert_eq!(epoch_ms(Some(&json!(1000.6))), Some(1001));
        assert_eq!(epoch_ms(Some(&json!(" 2500 "))), Some(2500));
        assert_eq!(epoch_ms(Some(&json!(true))), None);
        assert_eq!(epoch_ms(Some(&json!(""))), None);

        assert_eq!(packet_id(Some(&json!(7))), Some(7));
        assert_eq!(packet_id(Some(&json!(7.9))), Some(7));
        assert_eq!(packet_id(Some(&json!("12"))), Some(12));
        assert_eq!(packet_id(Some(&json!(false))), None);
        assert_eq!(packet_id(Some(&json!("12.5"))), None);
    }

    #[test]
    fn test_filename_timestamp() {
        let n = Normalizer::new().unwrap();
        let ms = n.epoch_from_filename("captures/dm_20240610_061320_123.png").unwrap();
        assert_eq!(ms, 1_718_000_000_123);
        assert!(n.epoch_from_filename("capture.png").is_none());
    }

    #[test]
    fn test_iso_timestamp() {
        assert_eq!(epoch_from_iso("1970-01-01T00:00:01.500Z"), Some(1500));
        assert_eq!(epoch_from_iso("1970-01-01T00:00:01.500+00:00"), Some(1500));
        assert_eq!(epoch_from_iso("1970-01-01T00:00:02"), Some(2000));
        assert_eq!(epoch_from_iso("yesterday"), None);
    }
}
