//! One-shot tools around the optical channel.
//!
//! - `encode`: cache snapshot → packet → envelope bytes for the renderer
//! - `decode`: envelope bytes from the optical decoder → one decoded-results line
//! - `validate`: decoded results vs truth → detail JSONL + summary JSON

use crate::config::{DecodeConfig, EncodeConfig, ValidateConfig};
use dmbridge_core::cache::{self, CacheOptions};
use dmbridge_core::framing;
use dmbridge_core::metrics::ValidationSummary;
use dmbridge_core::packet::DecodedPacket;
use dmbridge_core::snapshot::{format_epoch_ms, now_ms};
use dmbridge_core::validate::{self, ValidateOptions, ValidatorConfig};
use dmbridge_core::{build_packet, parse_packet, Error, PacketLayout, Result};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{info, warn};

/// Cache reads retry a few times to ride out a concurrent rename.
const CACHE_READ_RETRIES: u32 = 5;
const CACHE_READ_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeReport {
    pub packet_id: i64,
    pub packet_len: usize,
    pub envelope_len: usize,
}

pub fn encode(config: &EncodeConfig, opts: &CacheOptions) -> Result<EncodeReport> {
    let snapshot = cache::read_snapshot(&config.cache_path, CACHE_READ_RETRIES, CACHE_READ_DELAY)?;
    let layout = PacketLayout::standard_with_beds(config.beds);

    let packet = build_packet(&snapshot, &layout);
    let envelope = framing::wrap(&packet, config.level)?;
    cache::atomic_write(&config.out, &envelope, opts)?;

    let report = EncodeReport {
        packet_id: snapshot.sequence_id,
        packet_len: packet.len(),
        envelope_len: envelope.len(),
    };
    info!(
        packet_id = report.packet_id,
        packet_len = report.packet_len,
        envelope_len = report.envelope_len,
        out = %config.out.display(),
        "envelope written"
    );
    Ok(report)
}

/// Outcome of unwrapping and parsing one envelope.
struct DecodeAttempt {
    crc_ok: bool,
    packet: Result<DecodedPacket>,
}

fn decode_envelope(bytes: &[u8], layout: &PacketLayout) -> DecodeAttempt {
    match framing::unwrap(bytes) {
        Ok(packet) => DecodeAttempt {
            crc_ok: true,
            packet: parse_packet(&packet, layout),
        },
        Err(e) => DecodeAttempt {
            crc_ok: false,
            packet: Err(e),
        },
    }
}

/// Decode one envelope and append the result line.
///
/// A failed decode still appends a line (`decode_ok: false`); only failing
/// to append is an error.
pub fn decode(config: &DecodeConfig, opts: &CacheOptions) -> Result<Value> {
    let decoded_at_ms = now_ms();
    let layout = PacketLayout::standard_with_beds(config.beds);

    let attempt = match std::fs::read(&config.input) {
        Ok(bytes) => decode_envelope(&bytes, &layout),
        Err(e) => DecodeAttempt {
            crc_ok: false,
            packet: Err(Error::from(e)),
        },
    };

    let mut record = Map::new();
    record.insert("decoded_at_ms".into(), json!(decoded_at_ms));
    record.insert("packet_id".into(), Value::Null);
    record.insert("source_image".into(), json!(config.source_image));
    record.insert("crc_ok".into(), json!(attempt.crc_ok));

    match attempt.packet {
        Ok(packet) => {
            record.insert("decode_ok".into(), json!(true));
            record.insert("epoch_ms".into(), json!(packet.timestamp_ms));
            record.insert("timestamp_ms".into(), json!(packet.timestamp_ms));
            record.insert("ts".into(), json!(format_epoch_ms(packet.timestamp_ms)));
            record.insert("error".into(), Value::Null);
            record.insert("beds".into(), json!(packet.beds));
        }
        Err(e) => {
            warn!(input = %config.input.display(), crc_ok = attempt.crc_ok, error = %e, "decode failed");
            record.insert("decode_ok".into(), json!(false));
            record.insert("epoch_ms".into(), Value::Null);
            record.insert("timestamp_ms".into(), json!(decoded_at_ms));
            record.insert("error".into(), json!(e.to_string()));
            record.insert("beds".into(), json!({}));
        }
    }

    if let Some(cache_path) = &config.cache_path {
        match cache::read_snapshot(cache_path, CACHE_READ_RETRIES, CACHE_READ_DELAY) {
            Ok(snapshot) => {
                record.insert("cache_epoch_ms".into(), json!(snapshot.captured_at_ms));
                record.insert("source_packet_id".into(), json!(snapshot.sequence_id));
            }
            Err(e) => warn!(cache = %cache_path.display(), error = %e, "cache attribution skipped"),
        }
    }

    let record = Value::Object(record);
    cache::atomic_append_json(&config.results, &record, opts)?;
    info!(
        results = %config.results.display(),
        decode_ok = record["decode_ok"].as_bool().unwrap_or(false),
        "decoded record appended"
    );
    Ok(record)
}

pub fn validate(config: &ValidateConfig) -> Result<ValidationSummary> {
    let validator_config = ValidatorConfig::load_or_create(&config.config_path)?;
    let opts = ValidateOptions {
        decoded: config.decoded.clone(),
        truth: config.truth.clone(),
        out: config.out.clone(),
        summary_out: config.summary_out.clone(),
        last: config.last,
        tolerance_ms: config.tolerance_ms,
    };

    let (metrics, summary) = validate::run(&opts, validator_config)?;
    if config.print_summary {
        metrics.print_summary();
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmbridge_core::validate::TruthSource;
    use dmbridge_core::{BedRecord, Snapshot, Source, VitalValue};
    use std::path::Path;
    use tempfile::tempdir;

    fn seed_cache(path: &Path, sequence_id: i64) -> Snapshot {
        let mut snapshot = Snapshot::new(1_718_000_000_000 + sequence_id * 1000, sequence_id, Source::Generator);
        let mut bed = BedRecord::new();
        bed.insert("HR", VitalValue::new(72.4));
        bed.insert("TSKIN", VitalValue::new(36.55));
        snapshot.insert_bed("BED01", bed);
        cache::write_snapshot(path, &snapshot, &CacheOptions::quick()).unwrap();
        snapshot
    }

    fn encode_config(dir: &Path) -> EncodeConfig {
        EncodeConfig {
            cache_path: dir.join("generator_cache.json"),
            out: dir.join("packet.dmc"),
            level: 6,
            beds: 6,
        }
    }

    fn decode_config(dir: &Path) -> DecodeConfig {
        DecodeConfig {
            input: dir.join("packet.dmc"),
            results: dir.join("decoded_results.jsonl"),
            source_image: Some("dm_20240610_061320_123.png".into()),
            cache_path: None,
            beds: 6,
        }
    }

    #[test]
    fn test_encode_then_decode() {
        let dir = tempdir().unwrap();
        let enc = encode_config(dir.path());
        let snapshot = seed_cache(&enc.cache_path, 3);

        let report = encode(&enc, &CacheOptions::quick()).unwrap();
        assert_eq!(report.packet_id, 3);
        assert_eq!(report.packet_len, PacketLayout::standard().packet_len());

        let record = decode(&decode_config(dir.path()), &CacheOptions::quick()).unwrap();
        assert_eq!(record["decode_ok"], json!(true));
        assert_eq!(record["crc_ok"], json!(true));
        assert_eq!(record["epoch_ms"], json!(snapshot.captured_at_ms));
        assert_eq!(record["beds"]["BED01"]["HR"], json!(72.0));
        assert_eq!(record["beds"]["BED01"]["TSKIN"].as_f64(), Some(36.6));
        assert!(record["beds"].get("BED02").is_none());
    }

    #[test]
    fn test_corrupt_envelope_appends_failure() {
        let dir = tempdir().unwrap();
        let enc = encode_config(dir.path());
        seed_cache(&enc.cache_path, 1);
        encode(&enc, &CacheOptions::quick()).unwrap();

        let mut bytes = std::fs::read(&enc.out).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&enc.out, &bytes).unwrap();

        let cfg = decode_config(dir.path());
        let record = decode(&cfg, &CacheOptions::quick()).unwrap();
        assert_eq!(record["decode_ok"], json!(false));
        assert_eq!(record["crc_ok"], json!(false));
        assert!(record["error"].as_str().unwrap().contains("CRC"));

        let lines = std::fs::read_to_string(&cfg.results).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }

    #[test]
    fn test_missing_input_still_recorded() {
        let dir = tempdir().unwrap();
        let cfg = decode_config(dir.path());
        let record = decode(&cfg, &CacheOptions::quick()).unwrap();
        assert_eq!(record["decode_ok"], json!(false));
        assert!(cfg.results.exists());
    }

    #[test]
    fn test_decode_with_cache_attribution() {
        let dir = tempdir().unwrap();
        let enc = encode_config(dir.path());
        let snapshot = seed_cache(&enc.cache_path, 9);
        encode(&enc, &CacheOptions::quick()).unwrap();

        let mut cfg = decode_config(dir.path());
        cfg.cache_path = Some(enc.cache_path.clone());
        let record = decode(&cfg, &CacheOptions::quick()).unwrap();
        assert_eq!(record["cache_epoch_ms"], json!(snapshot.captured_at_ms));
        assert_eq!(record["source_packet_id"], json!(9));
    }

    #[test]
    fn test_validate_roundtrip_through_files() {
        let dir = tempdir().unwrap();
        let enc = encode_config(dir.path());
        let snapshot = seed_cache(&enc.cache_path, 1);
        encode(&enc, &CacheOptions::quick()).unwrap();
        decode(&decode_config(dir.path()), &CacheOptions::quick()).unwrap();

        let truth = dir.path().join("truth.jsonl");
        cache::atomic_append_json(&truth, &snapshot.to_cache_value(), &CacheOptions::quick()).unwrap();

        let cfg = ValidateConfig {
            decoded: dir.path().join("decoded_results.jsonl"),
            truth: TruthSource::Jsonl(truth),
            out: dir.path().join("detail.jsonl"),
            summary_out: dir.path().join("summary.json"),
            last: None,
            tolerance_ms: 2000,
            config_path: dir.path().join("validator_dm_config.json"),
            print_summary: false,
        };
        let summary = validate(&cfg).unwrap();
        assert_eq!(summary.decoded_records, 1);
        assert_eq!(summary.decode_success_records, 1);
        assert_eq!(summary.truth_missing_records, 0);
        assert_eq!(summary.matched_by.get("epoch_ms"), Some(&1));
        assert!(cfg.config_path.exists());
        assert!(cfg.summary_out.exists());
    }
}
