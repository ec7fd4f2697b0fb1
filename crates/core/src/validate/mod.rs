//! Offline validation of decoded results against ground truth.
//!
//! For each decoded record:
//! 1. pick its best timestamp ([`timestamp`])
//! 2. align it with a truth row ([`align`])
//! 3. score every cell of the fixed bed x field grid ([`score`])
//!
//! and accumulate [`ValidationMetrics`]. A bad record only degrades its own
//! contribution; nothing short of unreadable inputs aborts the run.

pub mod align;
pub mod config;
pub mod normalize;
pub mod record;
pub mod score;
pub mod timestamp;

use crate::cache::{atomic_write_json, CacheOptions};
use crate::error::Result;
use crate::metrics::{ValidationMetrics, ValidationSummary};
use crate::packet::{STANDARD_BEDS, STANDARD_FIELDS};
use align::{pick_truth, TruthMatch};
use normalize::{CellStatus, Normalizer};
use record::{DecodedRecord, TruthIndex, TruthRow};
use score::{score_cell, CellScore};
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use timestamp::{select_timestamp, TimeSource};
use tracing::{debug, info};

pub use config::ValidatorConfig;

/// Default maximum time skew for a truth match.
pub const DEFAULT_TOLERANCE_MS: i64 = 2000;

/// Where ground truth comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruthSource {
    /// Append-only JSONL of snapshots (generator truth log or cache snapshot log)
    Jsonl(PathBuf),
    /// Directory of individual cache snapshot `.json` files
    CacheDir(PathBuf),
}

impl TruthSource {
    pub fn load(&self) -> Result<Vec<TruthRow>> {
        match self {
            TruthSource::Jsonl(path) => record::load_truth_jsonl(path),
            TruthSource::CacheDir(dir) => record::load_truth_dir(dir),
        }
    }
}

/// File-level inputs and outputs of a validation run.
#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub decoded: PathBuf,
    pub truth: TruthSource,
    /// Per-cell detail JSONL
    pub out: PathBuf,
    pub summary_out: PathBuf,
    /// Evaluate only the last N decoded records
    pub last: Option<usize>,
    pub tolerance_ms: i64,
}

/// One line of the detail output.
#[derive(Debug, Serialize)]
struct DetailRow<'a> {
    truth_timestamp: Option<&'a str>,
    delta_t_ms: Option<i64>,
    matched_by: &'static str,
    bed: &'a str,
    field: &'a str,
    decoded_at_ms: Option<i64>,
    timestamp_ms: Option<i64>,
    time_source: &'static str,
    packet_id: Option<i64>,
    cache_epoch_ms: Option<i64>,
    source_packet_id: Option<i64>,
    source: Option<&'a Value>,
    truth_packet_id: Option<i64>,
    decode_ok: bool,
    crc_ok: bool,
    decoded_value: Option<f64>,
    truth_value: Option<f64>,
    abs_error: Option<f64>,
    #[serde(rename = "match")]
    exact: bool,
    within_tol_match: bool,
    status: CellStatus,
}

/// Scores decoded records against a truth index.
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidatorConfig,
    normalizer: Normalizer,
    beds: Vec<String>,
    fields: Vec<String>,
    tolerance_ms: i64,
}

impl Validator {
    /// Validator over the standard bed and field grid.
    pub fn new(config: ValidatorConfig, tolerance_ms: i64) -> Result<Self> {
        Ok(Self {
            config,
            normalizer: Normalizer::new()?,
            beds: STANDARD_BEDS.iter().map(|s| s.to_string()).collect(),
            fields: STANDARD_FIELDS.iter().map(|s| s.to_string()).collect(),
            tolerance_ms: tolerance_ms.max(0),
        })
    }

    /// Override the enumerated grid.
    pub fn with_grid(mut self, beds: Vec<String>, fields: Vec<String>) -> Self {
        self.beds = beds;
        self.fields = fields;
        self
    }

    /// Score `records`, optionally writing one detail line per cell.
    pub fn evaluate(
        &self,
        records: &[DecodedRecord],
        truth: &TruthIndex,
        mut detail: Option<&mut dyn Write>,
    ) -> Result<ValidationMetrics> {
        let mut metrics = ValidationMetrics::new();
        metrics.truth_rows = truth.len() as u64;

        for (idx, rec) in records.iter().enumerate() {
            let sink: Option<&mut dyn Write> = match detail {
                Some(ref mut out) => Some(&mut **out),
                None => None,
            };
            self.evaluate_record(rec, truth, &mut metrics, sink)?;
            if (idx + 1) % 50 == 0 {
                debug!(processed = idx + 1, total = records.len(), "validating decoded records");
            }
        }

        metrics.complete();
        Ok(metrics)
    }

    fn evaluate_record(
        &self,
        rec: &DecodedRecord,
        truth: &TruthIndex,
        metrics: &mut ValidationMetrics,
        mut detail: Option<&mut dyn Write>,
    ) -> Result<()> {
        let (timestamp, time_source) = select_timestamp(rec, &self.normalizer);
        let packet_id = rec.packet_id();
        let matched = pick_truth(truth, timestamp, time_source, packet_id, self.tolerance_ms);
        let truth_row = matched.map(|m| truth.row(m.row));

        let (decode_ok, crc_ok) = (rec.decode_ok(), rec.crc_ok());
        metrics.record_decoded(decode_ok, crc_ok, time_source, matched.as_ref());
        let success = decode_ok && crc_ok;

        for bed in &self.beds {
            for field in &self.fields {
                let truth_value = truth_row.map(|row| row.value(bed, field));
                let score = score_cell(&self.normalizer, &self.config, field, rec.value(bed, field), truth_value);
                metrics.record_cell(field, &score, success);

                if let Some(ref mut out) = detail {
                    let row = CellContext {
                        rec,
                        bed,
                        field,
                        timestamp,
                        time_source,
                        packet_id,
                        matched: matched.as_ref(),
                        truth_row,
                    }
                    .detail(&score);
                    serde_json::to_writer(&mut **out, &row)?;
                    out.write_all(b"\n")?;
                }
            }
        }
        Ok(())
    }
}

struct CellContext<'a> {
    rec: &'a DecodedRecord,
    bed: &'a str,
    field: &'a str,
    timestamp: Option<i64>,
    time_source: TimeSource,
    packet_id: Option<i64>,
    matched: Option<&'a TruthMatch>,
    truth_row: Option<&'a TruthRow>,
}

impl<'a> CellContext<'a> {
    fn detail(&self, score: &CellScore) -> DetailRow<'a> {
        DetailRow {
            truth_timestamp: self.truth_row.and_then(|r| r.timestamp_text.as_deref()),
            delta_t_ms: self.matched.and_then(|m| m.delta_ms),
            matched_by: self.matched.map_or("none", |m| m.path.as_str()),
            bed: self.bed,
            field: self.field,
            decoded_at_ms: normalize::epoch_ms(self.rec.get("decoded_at_ms")),
            timestamp_ms: self.timestamp,
            time_source: self.time_source.as_str(),
            packet_id: self.packet_id,
            cache_epoch_ms: normalize::epoch_ms(self.rec.get("cache_epoch_ms")),
            source_packet_id: normalize::packet_id(self.rec.get("source_packet_id")),
            source: self.rec.get("source"),
            truth_packet_id: self.truth_row.and_then(|r| r.packet_id),
            decode_ok: self.rec.decode_ok(),
            crc_ok: self.rec.crc_ok(),
            decoded_value: score.decoded,
            truth_value: score.truth,
            abs_error: score.abs_error,
            exact: score.exact,
            within_tol_match: score.within_tol,
            status: score.status,
        }
    }
}

/// Load inputs, validate, and write the detail JSONL and summary JSON.
pub fn run(opts: &ValidateOptions, config: ValidatorConfig) -> Result<(ValidationMetrics, ValidationSummary)> {
    let truth = TruthIndex::new(opts.truth.load()?);
    info!(rows = truth.len(), "loaded truth");

    let records: Vec<DecodedRecord> = record::tail_jsonl(&opts.decoded, opts.last)?
        .into_iter()
        .map(DecodedRecord::new)
        .collect();
    info!(records = records.len(), "loaded decoded results");

    for path in [&opts.out, &opts.summary_out] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }

    let validator = Validator::new(config, opts.tolerance_ms)?;
    let mut detail = BufWriter::new(File::create(&opts.out)?);
    let metrics = validator.evaluate(&records, &truth, Some(&mut detail as &mut dyn Write))?;
    detail.flush()?;

    let summary = metrics.summary();
    atomic_write_json(&opts.summary_out, &summary, &CacheOptions::default())?;
    info!(
        out = %opts.out.display(),
        summary = %opts.summary_out.display(),
        matched_by = ?metrics.matched_by,
        time_sources = ?metrics.time_sources,
        "validation complete"
    );

    Ok((metrics, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn truth(rows: Value) -> TruthIndex {
        TruthIndex::new(
            rows.as_array()
                .unwrap()
                .iter()
                .map(|r| TruthRow::from_object(r.as_object().unwrap()).unwrap())
                .collect(),
        )
    }

    fn decoded(v: Value) -> DecodedRecord {
        DecodedRecord::new(v.as_object().unwrap().clone())
    }

    fn one_cell_validator() -> Validator {
        Validator::new(ValidatorConfig::default(), 200)
            .unwrap()
            .with_grid(vec!["BED01".into()], vec!["HR".into(), "ART_S".into()])
    }

    #[test]
    fn test_aligned_record_is_scored() {
        let truth = truth(json!([
            {"epoch_ms": 1000, "packet_id": 1, "beds": {"BED01": {"vitals": {"HR": {"value": 60}, "ART_S": {"value": 100}}}}},
            {"epoch_ms": 2000, "packet_id": 2, "beds": {"BED01": {"vitals": {"HR": {"value": 70}, "ART_S": {"value": 120}}}}},
            {"epoch_ms": 3000, "packet_id": 3, "beds": {"BED01": {"vitals": {"HR": {"value": 80}, "ART_S": {"value": 140}}}}}
        ]));
        let rec = decoded(json!({
            "decode_ok": true, "crc_ok": true, "epoch_ms": 2100,
            "beds": {"BED01": {"HR": 70, "ART_S": 121}}
        }));

        let mut out = Vec::new();
        let metrics = one_cell_validator()
            .evaluate(&[rec], &truth, Some(&mut out as &mut dyn Write))
            .unwrap();

        assert_eq!(metrics.evaluated, 2);
        assert_eq!(metrics.matched, 1);
        assert_eq!(metrics.within_tol_matched, 2);
        assert_eq!(metrics.deltas_ms, vec![-100.0]);

        let lines: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["matched_by"], json!("epoch_ms"));
        assert_eq!(lines[0]["truth_packet_id"], json!(2));
        assert_eq!(lines[1]["match"], json!(false));
        assert_eq!(lines[1]["within_tol_match"], json!(true));
    }

    #[test]
    fn test_unaligned_record_is_truth_missing() {
        let truth = truth(json!([
            {"epoch_ms": 1000, "packet_id": 1, "beds": {}},
            {"epoch_ms": 2000, "packet_id": 2, "beds": {}}
        ]));
        let rec = decoded(json!({
            "decode_ok": true, "crc_ok": true, "epoch_ms": 9000, "packet_id": 42,
            "beds": {"BED01": {"HR": 70}}
        }));

        let metrics = one_cell_validator().evaluate(&[rec], &truth, None).unwrap();
        assert_eq!(metrics.truth_missing_records, 1);
        assert_eq!(metrics.decode_success_records, 1);
        assert_eq!(metrics.evaluated, 0);
        assert_eq!(metrics.matched, 0);
        assert_eq!(metrics.missing, 2);
        assert_eq!(metrics.match_rate(), None);
    }

    #[test]
    fn test_failed_decode_counts_but_scores_missing() {
        let truth = truth(json!([
            {"epoch_ms": 1000, "packet_id": 1, "beds": {"BED01": {"vitals": {"HR": {"value": 60}}}}}
        ]));
        let rec = decoded(json!({"decode_ok": false, "crc_ok": false, "decoded_at_ms": 1050, "beds": {}}));

        let metrics = one_cell_validator().evaluate(&[rec], &truth, None).unwrap();
        assert_eq!(metrics.crc_fail_records, 1);
        assert_eq!(metrics.matched_by.get("fallback_time"), Some(&1));
        assert_eq!(metrics.missing, 2);
    }

    #[test]
    fn test_extreme_epoch_does_not_abort_batch() {
        let truth = truth(json!([
            {"epoch_ms": 1000, "packet_id": 1, "beds": {"BED01": {"vitals": {"HR": {"value": 60}}}}}
        ]));
        let hostile = decoded(json!({
            "decode_ok": true, "crc_ok": true, "epoch_ms": -9.223372036854775808e18,
            "beds": {"BED01": {"HR": 60}}
        }));
        let good = decoded(json!({
            "decode_ok": true, "crc_ok": true, "epoch_ms": 1000,
            "beds": {"BED01": {"HR": 60}}
        }));

        let metrics = one_cell_validator().evaluate(&[hostile, good], &truth, None).unwrap();
        assert_eq!(metrics.decoded_records, 2);
        assert_eq!(metrics.truth_missing_records, 1);
        assert_eq!(metrics.matched_by.get("epoch_ms"), Some(&1));
        assert_eq!(metrics.matched, 1);
    }
}
