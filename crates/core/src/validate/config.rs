//! Scoring policy: rounding preference, epsilons and plausible ranges.

use crate::error::{Result, ValidateError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

/// Per-field scoring policy, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Fields compared after rounding both sides to integers
    #[serde(default)]
    pub integer_preferred_fields: BTreeSet<String>,

    /// Absolute tolerance for the within-tolerance match, per field
    #[serde(default)]
    pub field_epsilons: BTreeMap<String, f64>,

    /// Plausible `[min, max]` per field; values outside are invalid
    #[serde(default)]
    pub vital_ranges: BTreeMap<String, [f64; 2]>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        let integer_preferred_fields = ["HR", "SpO2", "RR", "BSR1", "BSR2"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut field_epsilons = BTreeMap::new();
        for field in ["HR", "SpO2", "RR"] {
            field_epsilons.insert(field.to_string(), 0.0);
        }
        for field in ["TSKIN", "TRECT"] {
            field_epsilons.insert(field.to_string(), 0.1);
        }
        for field in [
            "ART_S", "ART_D", "ART_M", "CVP_M", "RAP_M", "EtCO2", "Ppeak", "PEEP", "VTe", "VTi", "O2conc", "NO",
            "rRESP",
        ] {
            field_epsilons.insert(field.to_string(), 1.0);
        }

        let ranges: [(&str, f64, f64); 20] = [
            ("HR", 0.0, 300.0),
            ("SpO2", 0.0, 100.0),
            ("RR", 0.0, 120.0),
            ("TSKIN", 20.0, 45.0),
            ("TRECT", 20.0, 45.0),
            ("ART_S", 0.0, 300.0),
            ("ART_D", 0.0, 200.0),
            ("ART_M", 0.0, 250.0),
            ("CVP_M", -20.0, 80.0),
            ("RAP_M", -20.0, 80.0),
            ("EtCO2", 0.0, 150.0),
            ("Ppeak", 0.0, 100.0),
            ("PEEP", 0.0, 50.0),
            ("VTe", 0.0, 3000.0),
            ("VTi", 0.0, 3000.0),
            ("O2conc", 0.0, 100.0),
            ("NO", 0.0, 200.0),
            ("BSR1", 0.0, 100.0),
            ("BSR2", 0.0, 100.0),
            ("rRESP", 0.0, 120.0),
        ];
        let vital_ranges = ranges
            .iter()
            .map(|(field, lo, hi)| (field.to_string(), [*lo, *hi]))
            .collect();

        Self {
            integer_preferred_fields,
            field_epsilons,
            vital_ranges,
        }
    }
}

impl ValidatorConfig {
    /// Load `path`, or write the defaults there and return them.
    ///
    /// # Errors
    /// `ValidateError::InvalidConfig` if the file exists but isn't valid
    /// config JSON.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let config = serde_json::from_str(&text).map_err(|e| ValidateError::InvalidConfig {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            info!(path = %path.display(), "loaded validator config");
            return Ok(config);
        }

        let config = Self::default();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&config)?)?;
        info!(path = %path.display(), "validator config not found; wrote defaults");
        Ok(config)
    }

    pub fn is_integer_preferred(&self, field: &str) -> bool {
        self.integer_preferred_fields.contains(field)
    }

    /// Epsilon for `field`; 0 when unconfigured or negative.
    pub fn epsilon(&self, field: &str) -> f64 {
        self.field_epsilons
            .get(field)
            .copied()
            .filter(|e| e.is_finite() && *e >= 0.0)
            .unwrap_or(0.0)
    }

    /// True if `value` lies inside the configured range (or none is configured).
    pub fn in_range(&self, field: &str, value: f64) -> bool {
        match self.vital_ranges.get(field) {
            Some([lo, hi]) => *lo <= value && value <= *hi,
            None => true,
        }
    }
}
