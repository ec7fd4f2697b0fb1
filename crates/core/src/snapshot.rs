//! Snapshot data model and the cache record format.
//!
//! A [`Snapshot`] is one aggregated, timestamped view of every bed's vitals.
//! On disk it is a pretty-printed JSON record:
//!
//! ```text
//! {
//!   "epoch_ms": 1718000000123,
//!   "ts": "2024-06-10T06:13:20.123+00:00",
//!   "packet_id": 42,
//!   "source": "generator",
//!   "beds": { "BED01": { "vitals": { "HR": { "value": 72, "unit": "bpm" } } } }
//! }
//! ```
//!
//! Readers self-heal optional fields (`ts`, `source`, malformed beds or
//! vitals are skipped) but reject type violations of `epoch_ms` and
//! `packet_id`.

use crate::error::{CacheError, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Which writer produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Simulated vitals generator
    Generator,
    /// Live inbound-message receiver
    #[serde(alias = "hl7_receiver")]
    Receiver,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Generator => "generator",
            Source::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "generator" => Ok(Source::Generator),
            "receiver" | "hl7_receiver" => Ok(Source::Receiver),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

/// One vital sign reading. `value` is always finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalValue {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl VitalValue {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            unit: None,
            flag: None,
            status: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Normalize a loosely-typed vital entry.
    ///
    /// Accepts `{ "value": .., "unit": .., "flag": .., "status": .. }` or a
    /// bare value. Returns `None` when the value isn't numeric.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let (value_raw, extras) = match raw {
            Value::Object(obj) => (obj.get("value")?, Some(obj)),
            other => (other, None),
        };

        let value = to_numeric(value_raw)?;
        let text = |key: &str| {
            extras
                .and_then(|obj| obj.get(key))
                .and_then(non_empty_text)
        };

        Some(Self {
            value,
            unit: text("unit"),
            flag: text("flag"),
            status: text("status"),
        })
    }
}

/// Vitals for one bed, keyed by field code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BedRecord {
    #[serde(default)]
    pub vitals: BTreeMap<String, VitalValue>,
}

impl BedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, vital: VitalValue) {
        self.vitals.insert(field.into(), vital);
    }

    pub fn value(&self, field: &str) -> Option<f64> {
        self.vitals.get(field).map(|v| v.value)
    }

    pub fn is_empty(&self) -> bool {
        self.vitals.is_empty()
    }

    /// Normalize a raw vitals mapping, dropping non-numeric entries.
    pub fn from_raw_vitals(raw: &Map<String, Value>) -> Self {
        let vitals = raw
            .iter()
            .filter_map(|(code, v)| VitalValue::from_raw(v).map(|vital| (code.clone(), vital)))
            .collect();
        Self { vitals }
    }

    /// Overwrite or insert every vital from `other`.
    pub fn merge(&mut self, other: BedRecord) {
        self.vitals.extend(other.vitals);
    }
}

/// Aggregated view of all beds at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub captured_at_ms: i64,
    pub sequence_id: i64,
    pub source: Source,
    pub beds: BTreeMap<String, BedRecord>,
}

impl Snapshot {
    pub fn new(captured_at_ms: i64, sequence_id: i64, source: Source) -> Self {
        Self {
            captured_at_ms,
            sequence_id,
            source,
            beds: BTreeMap::new(),
        }
    }

    /// Add a bed; empty records are omitted rather than stored.
    pub fn insert_bed(&mut self, bed: impl Into<String>, record: BedRecord) {
        if !record.is_empty() {
            self.beds.insert(bed.into(), record);
        }
    }

    pub fn value(&self, bed: &str, field: &str) -> Option<f64> {
        self.beds.get(bed).and_then(|b| b.value(field))
    }

    /// RFC 3339 rendering of `captured_at_ms` with millisecond precision.
    pub fn timestamp_text(&self) -> String {
        format_epoch_ms(self.captured_at_ms)
    }

    /// Serialize to the cache record form.
    pub fn to_cache_value(&self) -> Value {
        let beds: Map<String, Value> = self
            .beds
            .iter()
            .map(|(id, rec)| (id.clone(), serde_json::to_value(rec).unwrap_or(Value::Null)))
            .collect();

        serde_json::json!({
            "epoch_ms": self.captured_at_ms,
            "ts": self.timestamp_text(),
            "packet_id": self.sequence_id,
            "source": self.source.as_str(),
            "beds": beds,
        })
    }

    /// Pretty-printed cache record bytes.
    pub fn to_cache_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.to_cache_value())?)
    }

    /// Parse a cache record.
    ///
    /// # Errors
    /// - `CacheError::MalformedRecord` if the record isn't an object, or
    ///   `epoch_ms` / `packet_id` are missing or not integers
    pub fn from_cache_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| CacheError::MalformedRecord {
            field: "<root>",
            reason: "is not an object".to_string(),
        })?;

        let captured_at_ms = required_int(obj, "epoch_ms")?;
        let sequence_id = required_int(obj, "packet_id")?;

        let source = match obj.get("source").and_then(Value::as_str).map(str::parse::<Source>) {
            Some(Ok(source)) => source,
            other => {
                warn!(source = ?other, "cache record has no usable source; assuming generator");
                Source::Generator
            }
        };

        let mut snapshot = Snapshot::new(captured_at_ms, sequence_id, source);
        if let Some(beds) = obj.get("beds").and_then(Value::as_object) {
            for (bed_id, bed) in beds {
                let Some(vitals) = bed.get("vitals").and_then(Value::as_object) else {
                    continue;
                };
                snapshot.insert_bed(bed_id.clone(), BedRecord::from_raw_vitals(vitals));
            }
        }

        Ok(snapshot)
    }

    pub fn from_cache_json(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_cache_value(&value)
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// RFC 3339 text for an epoch-millisecond timestamp.
pub fn format_epoch_ms(epoch_ms: i64) -> String {
    match Utc.timestamp_millis_opt(epoch_ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, false),
        None => DateTime::<Utc>::UNIX_EPOCH.to_rfc3339_opts(SecondsFormat::Millis, false),
    }
}

/// Convert a loosely-typed value to a finite number.
///
/// Booleans, empty strings, unparseable strings and non-finite numbers all
/// yield `None`.
pub fn to_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                return None;
            }
            text.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

fn non_empty_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_int(obj: &Map<String, Value>, field: &'static str) -> Result<i64> {
    match obj.get(field) {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
            CacheError::MalformedRecord {
                field,
                reason: format!("is not an integer: {n}"),
            }
            .into()
        }),
        Some(other) => Err(CacheError::MalformedRecord {
            field,
            reason: format!("has wrong type: {other}"),
        }
        .into()),
        None => Err(CacheError::MalformedRecord {
            field,
            reason: "is missing".to_string(),
        }
        .into()),
    }
}
