//! Decoded-result and truth streams.
//!
//! Both are append-only JSONL. Lines that aren't JSON objects are skipped
//! with a warning; a damaged line never aborts a run.

use super::normalize;
use crate::error::{Error, Result, ValidateError};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// Iterate the JSON objects in a JSONL file.
///
/// # Errors
/// `ValidateError::MissingInput` if the file doesn't exist.
pub fn iter_jsonl(path: &Path) -> Result<impl Iterator<Item = Map<String, Value>>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::from(ValidateError::MissingInput(path.to_path_buf())),
        _ => Error::from(e),
    })?;
    let src_path = path.display().to_string();

    Ok(BufReader::new(file)
        .lines()
        .enumerate()
        .filter_map(move |(idx, line)| {
            let line_no = idx + 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(path = %src_path, line_no, error = %e, "unreadable line skipped");
                    return None;
                }
            };
            let text = line.trim();
            if text.is_empty() {
                return None;
            }
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(obj)) => Some(obj),
                Ok(_) => {
                    debug!(path = %src_path, line_no, "non-object line skipped");
                    None
                }
                Err(e) => {
                    warn!(path = %src_path, line_no, error = %e, "malformed JSON line skipped");
                    None
                }
            }
        }))
}

/// All objects of a JSONL file, or only the last `last` of them.
pub fn tail_jsonl(path: &Path, last: Option<usize>) -> Result<Vec<Map<String, Value>>> {
    let rows = iter_jsonl(path)?;
    match last.filter(|n| *n > 0) {
        None => Ok(rows.collect()),
        Some(n) => {
            let mut window = VecDeque::with_capacity(n);
            for row in rows {
                if window.len() == n {
                    window.pop_front();
                }
                window.push_back(row);
            }
            Ok(window.into())
        }
    }
}

/// One decode attempt from the capture pipeline.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    raw: Map<String, Value>,
}

impl DecodedRecord {
    pub fn new(raw: Map<String, Value>) -> Self {
        Self { raw }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn decode_ok(&self) -> bool {
        self.get("decode_ok").is_some_and(truthy)
    }

    pub fn crc_ok(&self) -> bool {
        self.get("crc_ok").is_some_and(truthy)
    }

    /// Decoded and integrity-checked.
    pub fn is_success(&self) -> bool {
        self.decode_ok() && self.crc_ok()
    }

    /// Sequence id: `source_packet_id` if usable, else `packet_id`.
    pub fn packet_id(&self) -> Option<i64> {
        normalize::packet_id(self.get("source_packet_id")).or_else(|| normalize::packet_id(self.get("packet_id")))
    }

    /// Raw cell value. Beds may carry fields directly, under `params`, or
    /// under `vitals`; the latter two may wrap them as `{ "value": .. }`.
    pub fn value(&self, bed: &str, field: &str) -> Option<&Value> {
        let bed_data = self.get("beds")?.as_object()?.get(bed)?.as_object()?;
        if let Some(v) = bed_data.get(field) {
            return Some(v);
        }
        ["params", "vitals"]
            .iter()
            .filter_map(|group| bed_data.get(*group).and_then(Value::as_object))
            .find_map(|group| group.get(field))
            .map(unwrap_value)
    }
}

/// One ground-truth snapshot.
#[derive(Debug, Clone)]
pub struct TruthRow {
    pub epoch_ms: i64,
    pub packet_id: Option<i64>,
    pub timestamp_text: Option<String>,
    beds: Value,
}

impl TruthRow {
    /// Build from a cache-record-shaped object; `None` without a usable `epoch_ms`.
    pub fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let epoch_ms = normalize::epoch_ms(obj.get("epoch_ms"))
            .or_else(|| obj.get("ts").and_then(Value::as_str).and_then(normalize::epoch_from_iso))?;
        Some(Self {
            epoch_ms,
            packet_id: normalize::packet_id(obj.get("packet_id")),
            timestamp_text: obj.get("ts").and_then(Value::as_str).map(str::to_string),
            beds: obj.get("beds").cloned().unwrap_or(Value::Null),
        })
    }

    /// Raw truth value for a cell (`beds.BED.vitals.FIELD.value`, or a flat
    /// `beds.BED.FIELD` for beds without a `vitals` map).
    pub fn value(&self, bed: &str, field: &str) -> Option<&Value> {
        let bed_data = self.beds.as_object()?.get(bed)?.as_object()?;
        match bed_data.get("vitals") {
            Some(Value::Object(vitals)) => vitals.get(field).map(unwrap_value),
            _ => bed_data.get(field),
        }
    }
}

/// Load truth rows from a JSONL log (generator truth log or cache snapshot log).
pub fn load_truth_jsonl(path: &Path) -> Result<Vec<TruthRow>> {
    let mut rows = Vec::new();
    for obj in iter_jsonl(path)? {
        match TruthRow::from_object(&obj) {
            Some(row) => rows.push(row),
            None => warn!(path = %path.display(), "truth row without valid epoch_ms skipped"),
        }
    }
    Ok(rows)
}

/// Load truth rows from a directory of individual cache snapshot files.
pub fn load_truth_dir(dir: &Path) -> Result<Vec<TruthRow>> {
    if !dir.is_dir() {
        return Err(ValidateError::MissingInput(dir.to_path_buf()).into());
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut rows = Vec::new();
    for path in paths {
        let parsed = std::fs::read(&path)
            .map_err(Error::from)
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(Error::from));
        match parsed {
            Ok(Value::Object(obj)) => match TruthRow::from_object(&obj) {
                Some(row) => rows.push(row),
                None => debug!(path = %path.display(), "cache file without timestamp skipped"),
            },
            Ok(_) => debug!(path = %path.display(), "non-object cache file skipped"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read cache file"),
        }
    }
    Ok(rows)
}

/// Truth rows sorted by time, with a packet-id lookup.
#[derive(Debug, Clone, Default)]
pub struct TruthIndex {
    rows: Vec<TruthRow>,
    epochs: Vec<i64>,
    by_packet: HashMap<i64, usize>,
}

impl TruthIndex {
    pub fn new(mut rows: Vec<TruthRow>) -> Self {
        rows.sort_by_key(|r| r.epoch_ms);
        let epochs = rows.iter().map(|r| r.epoch_ms).collect();

        let mut by_packet = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            if let Some(id) = row.packet_id {
                by_packet.entry(id).or_insert(idx);
            }
        }

        Self { rows, epochs, by_packet }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> &TruthRow {
        &self.rows[idx]
    }

    /// Sorted truth timestamps.
    pub fn epochs(&self) -> &[i64] {
        &self.epochs
    }

    /// Earliest row (by time) carrying `packet_id`.
    pub fn find_packet(&self, packet_id: i64) -> Option<usize> {
        self.by_packet.get(&packet_id).copied()
    }
}

fn unwrap_value(v: &Value) -> &Value {
    match v {
        Value::Object(obj) => obj.get("value").unwrap_or(&Value::Null),
        other => other,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_tail_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decoded.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{{\"n\": 1}}").unwrap();
        writeln!(f, "{{broken").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "[1, 2]").unwrap();
        writeln!(f, "{{\"n\": 2}}").unwrap();
        writeln!(f, "{{\"n\": 3}}").unwrap();

        assert_eq!(tail_jsonl(&path, None).unwrap().len(), 3);
        let last_two = tail_jsonl(&path, Some(2)).unwrap();
        assert_eq!(last_two[0]["n"], json!(2));
        assert_eq!(last_two[1]["n"], json!(3));
    }

    #[test]
    fn test_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            tail_jsonl(&dir.path().join("none.jsonl"), None),
            Err(Error::Validate(ValidateError::MissingInput(_)))
        ));
    }

    #[test]
    fn test_decoded_value_shapes() {
        let rec = DecodedRecord::new(obj(json!({
            "decode_ok": true,
            "crc_ok": 1,
            "source_packet_id": null,
            "packet_id": "9",
            "beds": {
                "BED01": {"HR": 72, "params": {"SpO2": {"value": 97}}},
                "BED02": {"vitals": {"RR": 14}},
                "BED03": "garbage"
            }
        })));

        assert!(rec.is_success());
        assert_eq!(rec.packet_id(), Some(9));
        assert_eq!(rec.value("BED01", "HR"), Some(&json!(72)));
        assert_eq!(rec.value("BED01", "SpO2"), Some(&json!(97)));
        assert_eq!(rec.value("BED02", "RR"), Some(&json!(14)));
        assert_eq!(rec.value("BED03", "HR"), None);
        assert_eq!(rec.value("BED04", "HR"), None);
    }

    #[test]
    fn test_truth_row_values() {
        let row = TruthRow::from_object(&obj(json!({
            "epoch_ms": 1000,
            "packet_id": 3,
            "ts": "1970-01-01T00:00:01.000+00:00",
            "beds": {"BED01": {"vitals": {"HR": {"value": 70, "unit": "bpm"}}}}
        })))
        .unwrap();

        assert_eq!(row.value("BED01", "HR"), Some(&json!(70)));
        assert_eq!(row.value("BED01", "SpO2"), None);
        assert!(TruthRow::from_object(&obj(json!({"packet_id": 1}))).is_none());
    }

    #[test]
    fn test_index_sorts_and_finds_first_packet() {
        let rows = [3000, 1000, 2000]
            .iter()
            .map(|ms| TruthRow::from_object(&obj(json!({"epoch_ms": ms, "packet_id": 5}))).unwrap())
            .collect();
        let index = TruthIndex::new(rows);

        assert_eq!(index.epochs(), &[1000, 2000, 3000]);
        assert_eq!(index.find_packet(5), Some(0));
        assert_eq!(index.find_packet(6), None);
    }
}
