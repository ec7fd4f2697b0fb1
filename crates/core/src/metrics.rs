//! Validation metrics collection and reporting.
//!
//! This module accumulates what the validator observes:
//! - Decode outcomes (success, CRC failure)
//! - Truth alignment (time skew, which path matched, which timestamp was used)
//! - Per-cell accuracy (exact / within-tolerance match, absolute error)
//!
//! # Design
//!
//! [`ValidationMetrics`] is a plain accumulator updated once per record and
//! once per cell, then frozen into a serializable [`ValidationSummary`].
//!
//! # Thread Safety
//!
//! `ValidationMetrics` is NOT thread-safe. The validator is a single-pass
//! batch job, so it is only ever owned by one thread.

use crate::validate::align::TruthMatch;
use crate::validate::normalize::CellStatus;
use crate::validate::score::CellScore;
use crate::validate::timestamp::TimeSource;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Accuracy counters for a single field across all beds and records.
#[derive(Debug, Clone, Default)]
pub struct FieldStats {
    pub count: u64,
    pub evaluated: u64,
    pub matched: u64,
    pub within_tol_matched: u64,
    pub abs_errors: Vec<f64>,
}

/// Running validation metrics.
#[derive(Debug, Clone)]
pub struct ValidationMetrics {
    // === Timing ===
    /// When the run started
    pub start_time: Instant,

    /// When the run ended (set on completion)
    pub end_time: Option<Instant>,

    // === Records ===
    /// Decoded records considered
    pub decoded_records: u64,

    /// Truth rows loaded
    pub truth_rows: u64,

    /// Records with both decode and CRC success
    pub decode_success_records: u64,

    /// Records whose CRC check did not pass
    pub crc_fail_records: u64,

    /// Records with no aligned truth row
    pub truth_missing_records: u64,

    // === Cells ===
    /// Cells in the fixed bed x field enumeration
    pub total_expected: u64,

    /// Cells numerically compared
    pub evaluated: u64,

    /// Exact matches
    pub matched: u64,

    /// Within-epsilon matches
    pub within_tol_matched: u64,

    /// Cells missing on either side (includes truth-missing)
    pub missing: u64,

    /// Cells with non-numeric or out-of-range values
    pub invalid: u64,

    evaluated_on_success: u64,
    matched_on_success: u64,
    abs_errors: Vec<f64>,
    abs_errors_on_success: Vec<f64>,

    // === Alignment ===
    /// Time skew of each time-based truth match (ms)
    pub deltas_ms: Vec<f64>,

    /// Count of truth matches per path
    pub matched_by: BTreeMap<&'static str, u64>,

    /// Count of records per timestamp source
    pub time_sources: BTreeMap<&'static str, u64>,

    pub per_field: BTreeMap<String, FieldStats>,
}

impl ValidationMetrics {
    /// Create new metrics with start time set to now.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            end_time: None,
            decoded_records: 0,
            truth_rows: 0,
            decode_success_records: 0,
            crc_fail_records: 0,
            truth_missing_records: 0,
            total_expected: 0,
            evaluated: 0,
            matched: 0,
            within_tol_matched: 0,
            missing: 0,
            invalid: 0,
            evaluated_on_success: 0,
            matched_on_success: 0,
            abs_errors: Vec::new(),
            abs_errors_on_success: Vec::new(),
            deltas_ms: Vec::new(),
            matched_by: BTreeMap::new(),
            time_sources: BTreeMap::new(),
            per_field: BTreeMap::new(),
        }
    }

    /// Mark the run as complete.
    pub fn complete(&mut self) {
        self.end_time = Some(Instant::now());
    }

    /// Get total duration (or current elapsed if not complete).
    pub fn duration(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Count one decoded record and its alignment outcome.
    pub fn record_decoded(&mut self, decode_ok: bool, crc_ok: bool, source: TimeSource, truth: Option<&TruthMatch>) {
        self.decoded_records += 1;
        if decode_ok && crc_ok {
            self.decode_success_records += 1;
        }
        if !crc_ok {
            self.crc_fail_records += 1;
        }
        *self.time_sources.entry(source.as_str()).or_insert(0) += 1;

        match truth {
            None => self.truth_missing_records += 1,
            Some(m) => {
                *self.matched_by.entry(m.path.as_str()).or_insert(0) += 1;
                if let Some(delta) = m.delta_ms {
                    self.deltas_ms.push(delta as f64);
                }
            }
        }
    }

    /// Count one scored cell.
    pub fn record_cell(&mut self, field: &str, score: &CellScore, success_record: bool) {
        self.total_expected += 1;
        let stats = self.per_field.entry(field.to_string()).or_default();
        stats.count += 1;

        match score.status {
            CellStatus::Missing | CellStatus::TruthMissing => self.missing += 1,
            CellStatus::Invalid => self.invalid += 1,
            CellStatus::Ok => {}
        }

        let Some(err) = score.abs_error.filter(|_| score.is_evaluated()) else {
            return;
        };

        self.evaluated += 1;
        stats.evaluated += 1;
        self.abs_errors.push(err);
        stats.abs_errors.push(err);
        if success_record {
            self.evaluated_on_success += 1;
            self.abs_errors_on_success.push(err);
        }
        if score.exact {
            self.matched += 1;
            stats.matched += 1;
            if success_record {
                self.matched_on_success += 1;
            }
        }
        if score.within_tol {
            self.within_tol_matched += 1;
            stats.within_tol_matched += 1;
        }
    }

    pub fn decode_success_rate(&self) -> Option<f64> {
        ratio(self.decode_success_records, self.decoded_records)
    }

    pub fn match_rate(&self) -> Option<f64> {
        ratio(self.matched, self.evaluated)
    }

    pub fn within_tol_match_rate(&self) -> Option<f64> {
        ratio(self.within_tol_matched, self.evaluated)
    }

    /// Freeze into the serializable report.
    pub fn summary(&self) -> ValidationSummary {
        let per_field = self
            .per_field
            .iter()
            .map(|(field, st)| {
                let summary = FieldSummary {
                    count: st.count,
                    evaluated: st.evaluated,
                    match_rate: ratio(st.matched, st.evaluated),
                    within_tol_match_rate: ratio(st.within_tol_matched, st.evaluated),
                    mae: mean(&st.abs_errors),
                };
                (field.clone(), summary)
            })
            .collect();

        ValidationSummary {
            decoded_records: self.decoded_records,
            truth_rows: self.truth_rows,
            decode_success_records: self.decode_success_records,
            decode_success_rate: self.decode_success_rate(),
            crc_fail_records: self.crc_fail_records,
            crc_fail_rate: ratio(self.crc_fail_records, self.decoded_records),
            total_expected: self.total_expected,
            evaluated: self.evaluated,
            matched: self.matched,
            within_tol_matched: self.within_tol_matched,
            match_rate: self.match_rate(),
            match_rate_on_success: ratio(self.matched_on_success, self.evaluated_on_success),
            within_tol_match_rate: self.within_tol_match_rate(),
            mae: mean(&self.abs_errors),
            mae_on_success: mean(&self.abs_errors_on_success),
            median_abs_error: median(&self.abs_errors),
            missing: self.missing,
            invalid: self.invalid,
            missing_rate: ratio(self.missing, self.total_expected),
            invalid_rate: ratio(self.invalid, self.total_expected),
            truth_missing_records: self.truth_missing_records,
            truth_missing_rate: ratio(self.truth_missing_records, self.decoded_records),
            matched_by: self.matched_by.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            time_sources: self.time_sources.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            delta_ms: DeltaStats::from_values(&self.deltas_ms),
            per_field,
        }
    }

    /// Print a human-readable summary to stdout.
    pub fn print_summary(&self) {
        let pct = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |r| format!("{:.2}%", r * 100.0));
        let num = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |x| format!("{x:.3}"));
        let delta = DeltaStats::from_values(&self.deltas_ms);

        println!("\n=== Validation Summary ===");
        println!("Duration: {} ms", self.duration().as_millis());
        println!();

        println!("=== Decode ===");
        println!("Decoded records: {}", self.decoded_records);
        println!("Truth rows: {}", self.truth_rows);
        println!("Decode success: {} ({})", self.decode_success_records, pct(self.decode_success_rate()));
        println!("CRC failures: {}", self.crc_fail_records);
        println!("Truth missing: {}", self.truth_missing_records);
        println!();

        println!("=== Accuracy ===");
        println!("Cells expected: {}", self.total_expected);
        println!("Cells evaluated: {}", self.evaluated);
        println!("Exact match: {} ({})", self.matched, pct(self.match_rate()));
        println!("Within tolerance: {} ({})", self.within_tol_matched, pct(self.within_tol_match_rate()));
        println!("Missing: {}  Invalid: {}", self.missing, self.invalid);
        println!("MAE: {}  Median abs error: {}", num(mean(&self.abs_errors)), num(median(&self.abs_errors)));
        println!();

        println!("=== Alignment ===");
        println!("Time skew (ms): mean {} median {} p90 {}", num(delta.mean), num(delta.median), num(delta.p90));
        println!("Matched by: {:?}", self.matched_by);
        println!("Timestamp sources: {:?}", self.time_sources);
        println!();
    }

    /// Export metrics as a simple text format (for parsing/testing).
    pub fn export_text(&self) -> String {
        format!(
            "decoded_records={}\n\
             decode_success_records={}\n\
             crc_fail_records={}\n\
             truth_missing_records={}\n\
             evaluated={}\n\
             matched={}\n\
             within_tol_matched={}\n\
             missing={}\n\
             invalid={}\n",
            self.decoded_records,
            self.decode_success_records,
            self.crc_fail_records,
            self.truth_missing_records,
            self.evaluated,
            self.matched,
            self.within_tol_matched,
            self.missing,
            self.invalid,
        )
    }
}

impl Default for ValidationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Time-skew distribution of time-based truth matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaStats {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub p90: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub count: usize,
}

impl DeltaStats {
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            mean: mean(values),
            median: median(values),
            p90: percentile(values, 90.0),
            min: values.iter().copied().reduce(f64::min),
            max: values.iter().copied().reduce(f64::max),
            count: values.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSummary {
    pub count: u64,
    pub evaluated: u64,
    pub match_rate: Option<f64>,
    pub within_tol_match_rate: Option<f64>,
    pub mae: Option<f64>,
}

/// Serializable validation report. Rates are `None` when their denominator is 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub decoded_records: u64,
    pub truth_rows: u64,
    pub decode_success_records: u64,
    pub decode_success_rate: Option<f64>,
    pub crc_fail_records: u64,
    pub crc_fail_rate: Option<f64>,
    pub total_expected: u64,
    pub evaluated: u64,
    pub matched: u64,
    pub within_tol_matched: u64,
    pub match_rate: Option<f64>,
    pub match_rate_on_success: Option<f64>,
    pub within_tol_match_rate: Option<f64>,
    pub mae: Option<f64>,
    pub mae_on_success: Option<f64>,
    pub median_abs_error: Option<f64>,
    pub missing: u64,
    pub invalid: u64,
    pub missing_rate: Option<f64>,
    pub invalid_rate: Option<f64>,
    pub truth_missing_records: u64,
    pub truth_missing_rate: Option<f64>,
    pub matched_by: BTreeMap<String, u64>,
    pub time_sources: BTreeMap<String, u64>,
    pub delta_ms: DeltaStats,
    pub per_field: BTreeMap<String, FieldSummary>,
}

fn ratio(num: u64, den: u64) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Percentile `p` (0..=100) with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut xs = values.to_vec();
    xs.sort_by(f64::total_cmp);

    let rank = (xs.len() - 1) as f64 * (p.clamp(0.0, 100.0) / 100.0);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(xs[lo] * (1.0 - frac) + xs[hi] * frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::align::MatchPath;

    fn ok_cell(abs_error: f64, exact: bool, within_tol: bool) -> CellScore {
        CellScore {
            status: CellStatus::Ok,
            decoded: Some(1.0),
            truth: Some(1.0 + abs_error),
            exact,
            within_tol,
            abs_error: Some(abs_error),
        }
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = ValidationMetrics::new();
        assert!(metrics.end_time.is_none());
        assert!(metrics.duration().as_millis() < 100);
        assert_eq!(metrics.match_rate(), None);
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 0.0), Some(10.0));
        assert_eq!(percentile(&values, 100.0), Some(40.0));
        assert_eq!(percentile(&values, 50.0), Some(25.0));
        assert!((percentile(&values, 90.0).unwrap() - 37.0).abs() < 1e-9);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_record_counts() {
        let mut metrics = ValidationMetrics::new();
        let m = TruthMatch {
            row: 0,
            delta_ms: Some(-100),
            path: MatchPath::EpochMs,
        };
        metrics.record_decoded(true, true, TimeSource::EpochMs, Some(&m));
        metrics.record_decoded(false, false, TimeSource::None, None);

        assert_eq!(metrics.decode_success_rate(), Some(0.5));
        assert_eq!(metrics.crc_fail_records, 1);
        assert_eq!(metrics.truth_missing_records, 1);
        assert_eq!(metrics.matched_by.get("epoch_ms"), Some(&1));
        assert_eq!(metrics.deltas_ms, vec![-100.0]);
    }

    #[test]
    fn test_cell_accounting() {
        let mut metrics = ValidationMetrics::new();
        metrics.record_cell("HR", &ok_cell(0.0, true, true), true);
        metrics.record_cell("ART_S", &ok_cell(1.0, false, true), false);

        let mut truth_missing = ok_cell(0.0, false, false);
        truth_missing.status = CellStatus::TruthMissing;
        truth_missing.abs_error = None;
        metrics.record_cell("HR", &truth_missing, false);

        let summary = metrics.summary();
        assert_eq!(summary.total_expected, 3);
        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.match_rate, Some(0.5));
        assert_eq!(summary.match_rate_on_success, Some(1.0));
        assert_eq!(summary.within_tol_match_rate, Some(1.0));
        assert_eq!(summary.mae, Some(0.5));
        assert_eq!(summary.per_field["HR"].count, 2);
        assert_eq!(summary.per_field["HR"].evaluated, 1);
    }

    #[test]
    fn test_export_text() {
        let mut metrics = ValidationMetrics::new();
        metrics.record_decoded(true, true, TimeSource::EpochMs, None);
        let text = metrics.export_text();
        assert!(text.contains("decoded_records=1"));
        assert!(text.contains("truth_missing_records=1"));
    }
}
