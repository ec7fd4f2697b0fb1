//! Aligning a decoded record with a truth row.
//!
//! Capture and truth run on independent, jittery cadences, so alignment is
//! nearest-neighbour in time with a tolerance, falling back to an exact
//! sequence-id match.

use super::record::TruthIndex;
use super::timestamp::TimeSource;
use serde::Serialize;

/// Which path produced a truth match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPath {
    /// Packet or cache time within tolerance
    EpochMs,
    /// Capture-side time within tolerance
    FallbackTime,
    /// Exact sequence id
    PacketIdFallback,
    None,
}

impl MatchPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPath::EpochMs => "epoch_ms",
            MatchPath::FallbackTime => "fallback_time",
            MatchPath::PacketIdFallback => "packet_id_fallback",
            MatchPath::None => "none",
        }
    }
}

/// An accepted alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruthMatch {
    /// Index into the [`TruthIndex`]
    pub row: usize,
    /// `truth - decoded` in ms; `None` for sequence-id matches
    pub delta_ms: Option<i64>,
    pub path: MatchPath,
}

/// Index of the truth row nearest `target`, looking only at the insertion
/// point and its predecessor. Ties go to the later row.
pub fn nearest(epochs: &[i64], target: i64) -> Option<usize> {
    let idx = epochs.partition_point(|e| *e < target);
    let after = (idx < epochs.len()).then_some(idx);
    let before = idx.checked_sub(1);

    match (after, before) {
        (Some(a), Some(b)) => {
            if epochs[a].abs_diff(target) <= epochs[b].abs_diff(target) {
                Some(a)
            } else {
                Some(b)
            }
        }
        (a, b) => a.or(b),
    }
}

/// Find the truth row for a decoded record.
///
/// 1. nearest row by time, accepted if `|delta| <= tolerance_ms`
/// 2. otherwise the earliest row with the same packet id
/// 3. otherwise `None` (the record is truth-missing)
pub fn pick_truth(
    index: &TruthIndex,
    timestamp: Option<i64>,
    source: TimeSource,
    packet_id: Option<i64>,
    tolerance_ms: i64,
) -> Option<TruthMatch> {
    if let Some(target) = timestamp {
        if let Some(row) = nearest(index.epochs(), target) {
            // Unrepresentable skew counts as beyond tolerance
            let delta = index.epochs()[row].checked_sub(target);
            if let Some(delta) = delta.filter(|d| d.unsigned_abs() <= tolerance_ms.unsigned_abs()) {
                let path = if source.is_packet_time() {
                    MatchPath::EpochMs
                } else {
                    MatchPath::FallbackTime
                };
                return Some(TruthMatch {
                    row,
                    delta_ms: Some(delta),
                    path,
                });
            }
        }
    }

    let row = index.find_packet(packet_id?)?;
    Some(TruthMatch {
        row,
        delta_ms: None,
        path: MatchPath::PacketIdFallback,
    })
}
