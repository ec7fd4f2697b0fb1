//! Choosing the timestamp of a decoded record.
//!
//! Records carry up to five time candidates of different reliability. They
//! are tried in a fixed priority order and the winner is reported together
//! with the source that supplied it.

use super::normalize::{self, Normalizer};
use super::record::DecodedRecord;
use serde::Serialize;
use serde_json::Value;

/// Where a decoded record's timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    /// Snapshot time attributed by the cache writer
    CacheEpochMs,
    /// Time embedded in the packet header
    EpochMs,
    /// Frame capture time
    TimestampMs,
    /// Time the decode finished
    DecodedAtMs,
    /// ISO `timestamp` field or a timestamp in the image file name
    RecordTimestamp,
    None,
}

/// Highest priority first.
pub const PRIORITY: [TimeSource; 5] = [
    TimeSource::CacheEpochMs,
    TimeSource::EpochMs,
    TimeSource::TimestampMs,
    TimeSource::DecodedAtMs,
    TimeSource::RecordTimestamp,
];

impl TimeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSource::CacheEpochMs => "cache_epoch_ms",
            TimeSource::EpochMs => "epoch_ms",
            TimeSource::TimestampMs => "timestamp_ms",
            TimeSource::DecodedAtMs => "decoded_at_ms",
            TimeSource::RecordTimestamp => "record_timestamp",
            TimeSource::None => "none",
        }
    }

    /// Packet- or cache-attributed time, as opposed to capture-side time.
    pub fn is_packet_time(&self) -> bool {
        matches!(
            self,
            TimeSource::CacheEpochMs | TimeSource::EpochMs | TimeSource::TimestampMs
        )
    }

    /// Read this source from a record.
    pub fn extract(&self, record: &DecodedRecord, normalizer: &Normalizer) -> Option<i64> {
        match self {
            TimeSource::CacheEpochMs => normalize::epoch_ms(record.get("cache_epoch_ms")),
            TimeSource::EpochMs => normalize::epoch_ms(record.get("epoch_ms"))
                .or_else(|| normalize::epoch_ms(record.get("dm_epoch_ms"))),
            TimeSource::TimestampMs => normalize::epoch_ms(record.get("timestamp_ms")),
            TimeSource::DecodedAtMs => normalize::epoch_ms(record.get("decoded_at_ms")),
            TimeSource::RecordTimestamp => record
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(normalize::epoch_from_iso)
                .or_else(|| {
                    ["source_image", "image_path"]
                        .iter()
                        .filter_map(|key| record.get(key).and_then(Value::as_str))
                        .find(|s| !s.is_empty())
                        .and_then(|name| normalizer.epoch_from_filename(name))
                }),
            TimeSource::None => None,
        }
    }
}

/// Best available timestamp and its source; `(None, TimeSource::None)` if
/// the record has none.
pub fn select_timestamp(record: &DecodedRecord, normalizer: &Normalizer) -> (Option<i64>, TimeSource) {
    PRIORITY
        .iter()
        .find_map(|source| source.extract(record, normalizer).map(|ms| (Some(ms), *source)))
        .unwrap_or((None, TimeSource::None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> DecodedRecord {
        DecodedRecord::new(v.as_object().unwrap().clone())
    }

    #[test]
    fn test_priority_order() {
        let n = Normalizer::new().unwrap();
        let full = record(json!({
            "cache_epoch_ms": 1, "epoch_ms": 2, "timestamp_ms": 3, "decoded_at_ms": 4,
            "timestamp": "1970-01-01T00:00:05Z"
        }));
        assert_eq!(select_timestamp(&full, &n), (Some(1), TimeSource::CacheEpochMs));

        let no_cache = record(json!({"cache_epoch_ms": null, "epoch_ms": "2", "decoded_at_ms": 4}));
        assert_eq!(select_timestamp(&no_cache, &n), (Some(2), TimeSource::EpochMs));

        let capture_only = record(json!({"decoded_at_ms": 4}));
        assert_eq!(select_timestamp(&capture_only, &n), (Some(4), TimeSource::DecodedAtMs));
    }

    #[test]
    fn test_record_timestamp_from_filename() {
        let n = Normalizer::new().unwrap();
        let rec = record(json!({"source_image": "", "image_path": "shots/dm_19700101_000003_250.png"}));
        assert_eq!(select_timestamp(&rec, &n), (Some(3250), TimeSource::RecordTimestamp));
    }

    #[test]
    fn test_no_timestamp() {
        let n = Normalizer::new().unwrap();
        let rec = record(json!({"epoch_ms": true}));
        assert_eq!(select_timestamp(&rec, &n), (None, TimeSource::None));
    }

    #[test]
    fn test_packet_time_sources() {
        assert!(TimeSource::EpochMs.is_packet_time());
        assert!(TimeSource::TimestampMs.is_packet_time());
        assert!(!TimeSource::DecodedAtMs.is_packet_time());
        assert!(!TimeSource::RecordTimestamp.is_packet_time());
    }
}
