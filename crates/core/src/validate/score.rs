//! Per-cell scoring.

use super::config::ValidatorConfig;
use super::normalize::{CellStatus, Normalizer};
use serde_json::Value;

/// Result of comparing one decoded cell with its truth cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellScore {
    pub status: CellStatus,
    pub decoded: Option<f64>,
    pub truth: Option<f64>,
    /// Exact match (rounded for integer-preferred fields)
    pub exact: bool,
    /// `|decoded - truth| <= epsilon`
    pub within_tol: bool,
    pub abs_error: Option<f64>,
}

impl CellScore {
    pub fn is_evaluated(&self) -> bool {
        self.status == CellStatus::Ok
    }
}

/// Score one cell. `truth` is `None` when the record has no aligned truth row.
///
/// Truth status wins over decoded status. A value outside the field's
/// configured range on either side makes the cell invalid.
pub fn score_cell(
    normalizer: &Normalizer,
    config: &ValidatorConfig,
    field: &str,
    decoded: Option<&Value>,
    truth: Option<Option<&Value>>,
) -> CellScore {
    let (decoded, decoded_status) = normalizer.number(decoded);
    let (truth, truth_status) = match truth {
        Some(value) => normalizer.number(value),
        None => (None, CellStatus::TruthMissing),
    };

    let unscored = |status| CellScore {
        status,
        decoded,
        truth,
        exact: false,
        within_tol: false,
        abs_error: None,
    };

    if truth_status != CellStatus::Ok {
        return unscored(truth_status);
    }
    let (Some(d), Some(t)) = (decoded, truth) else {
        return unscored(decoded_status);
    };
    if !config.in_range(field, d) || !config.in_range(field, t) {
        return unscored(CellStatus::Invalid);
    }

    let exact = if config.is_integer_preferred(field) {
        d.round() == t.round()
    } else {
        d == t
    };
    let abs_error = (d - t).abs();

    CellScore {
        status: CellStatus::Ok,
        decoded,
        truth,
        exact,
        within_tol: abs_error <= config.epsilon(field),
        abs_error: Some(abs_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn score(field: &str, decoded: Value, truth: Value) -> CellScore {
        let n = Normalizer::new().unwrap();
        score_cell(&n, &ValidatorConfig::default(), field, Some(&decoded), Some(Some(&truth)))
    }

    #[test]
    fn test_exact_match() {
        let s = score("HR", json!(72), json!(72));
        assert_eq!(s.status, CellStatus::Ok);
        assert!(s.exact && s.within_tol);
        assert_eq!(s.abs_error, Some(0.0));
    }

    #[test]
    fn test_integer_preferred_rounds() {
        let s = score("HR", json!(72.4), json!(72));
        assert!(s.exact);
        // HR epsilon is 0
        assert!(!s.within_tol);
    }

    #[test]
    fn test_epsilon_without_exact_match() {
        let s = score("ART_S", json!(121), json!(120));
        assert_eq!(s.status, CellStatus::Ok);
        assert!(!s.exact);
        assert!(s.within_tol);
        assert_eq!(s.abs_error, Some(1.0));
    }

    #[test]
    fn test_out_of_range_is_invalid() {
        assert_eq!(score("SpO2", json!(140), json!(98)).status, CellStatus::Invalid);
        assert_eq!(score("SpO2", json!(98), json!(-1)).status, CellStatus::Invalid);
    }

    #[test]
    fn test_status_precedence() {
        let n = Normalizer::new().unwrap();
        let cfg = ValidatorConfig::default();

        let truth_missing = score_cell(&n, &cfg, "HR", Some(&json!("bad")), None);
        assert_eq!(truth_missing.status, CellStatus::TruthMissing);

        let truth_absent = score_cell(&n, &cfg, "HR", Some(&json!("bad")), Some(None));
        assert_eq!(truth_absent.status, CellStatus::Missing);

        assert_eq!(score("HR", json!("bad"), json!(70)).status, CellStatus::Invalid);
        assert_eq!(score("HR", Value::Null, json!(70)).status, CellStatus::Missing);
        assert!(!score("HR", Value::Null, json!(70)).is_evaluated());
    }
}
