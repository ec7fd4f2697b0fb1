//! Simulated bedside vitals.
//!
//! When no live monitor feed is connected, the generator produces a fresh
//! random reading for every bed and every parameter each cycle.
//!
//! # Design
//!
//! Each parameter has a plausible `[min, max]` range and a number of
//! decimals:
//! - Integer parameters are drawn uniformly from the integers in range
//! - Decimal parameters (temperatures) are drawn uniformly and rounded
//!
//! A seeded `ChaCha8Rng` makes whole runs reproducible.

use dmbridge_core::snapshot::{BedRecord, VitalValue};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

/// One simulated parameter.
#[derive(Debug, Clone, Copy)]
pub struct VitalSpec {
    pub code: &'static str,
    pub unit: &'static str,
    pub min: f64,
    pub max: f64,
    pub decimals: u32,
}

const fn spec(code: &'static str, unit: &'static str, min: f64, max: f64, decimals: u32) -> VitalSpec {
    VitalSpec {
        code,
        unit,
        min,
        max,
        decimals,
    }
}

/// Simulated parameters, in packet field order.
pub const VITAL_SPECS: [VitalSpec; 20] = [
    spec("HR", "bpm", 50.0, 180.0, 0),
    spec("ART_S", "mmHg", 40.0, 140.0, 0),
    spec("ART_D", "mmHg", 20.0, 90.0, 0),
    spec("ART_M", "mmHg", 30.0, 110.0, 0),
    spec("CVP_M", "mmHg", -5.0, 25.0, 0),
    spec("RAP_M", "mmHg", -5.0, 20.0, 0),
    spec("SpO2", "%", 85.0, 100.0, 0),
    spec("TSKIN", "C", 30.0, 40.0, 1),
    spec("TRECT", "C", 34.0, 41.0, 1),
    spec("rRESP", "rpm", 0.0, 60.0, 0),
    spec("EtCO2", "mmHg", 15.0, 60.0, 0),
    spec("RR", "rpm", 5.0, 60.0, 0),
    spec("VTe", "mL", 0.0, 800.0, 0),
    spec("VTi", "mL", 0.0, 800.0, 0),
    spec("Ppeak", "cmH2O", 5.0, 50.0, 0),
    spec("PEEP", "cmH2O", 0.0, 20.0, 0),
    spec("O2conc", "%", 21.0, 100.0, 0),
    spec("NO", "ppm", 0.0, 40.0, 0),
    spec("BSR1", "%", 0.0, 100.0, 0),
    spec("BSR2", "%", 0.0, 100.0, 0),
];

/// Seeded source of simulated readings.
pub struct VitalsSimulator {
    rng: ChaCha8Rng,
}

impl VitalsSimulator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// One reading per parameter for a single bed.
    pub fn bed_record(&mut self) -> BedRecord {
        let mut record = BedRecord::new();
        for spec in &VITAL_SPECS {
            let value = self.sample(spec);
            record.insert(spec.code, VitalValue::new(value).with_unit(spec.unit));
        }
        record
    }

    /// A full cycle: one record per bed.
    pub fn cycle(&mut self, beds: &[String]) -> BTreeMap<String, BedRecord> {
        beds.iter().map(|bed| (bed.clone(), self.bed_record())).collect()
    }

    fn sample(&mut self, spec: &VitalSpec) -> f64 {
        if spec.decimals == 0 {
            return self.rng.gen_range(spec.min as i64..=spec.max as i64) as f64;
        }
        let factor = 10f64.powi(spec.decimals as i32);
        (self.rng.gen_range(spec.min..=spec.max) * factor).round() / factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmbridge_core::packet::STANDARD_FIELDS;

    fn beds(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("BED{i:02}")).collect()
    }

    #[test]
    fn test_specs_follow_packet_field_order() {
        let codes: Vec<_> = VITAL_SPECS.iter().map(|s| s.code).collect();
        assert_eq!(codes, STANDARD_FIELDS);
    }

    #[test]
    fn test_values_in_range() {
        let mut sim = VitalsSimulator::new(42);
        for _ in 0..50 {
            let record = sim.bed_record();
            for spec in &VITAL_SPECS {
                let v = record.value(spec.code).unwrap();
                assert!(v >= spec.min && v <= spec.max, "{} = {v}", spec.code);
                if spec.decimals == 0 {
                    assert_eq!(v, v.trunc());
                }
            }
        }
    }

    #[test]
    fn test_determinism() {
        let a = VitalsSimulator::new(12345).cycle(&beds(6));
        let b = VitalsSimulator::new(12345).cycle(&beds(6));
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seeds() {
        let a = VitalsSimulator::new(1).cycle(&beds(2));
        let b = VitalsSimulator::new(2).cycle(&beds(2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_cycle_covers_every_bed() {
        let cycle = VitalsSimulator::new(7).cycle(&beds(6));
        assert_eq!(cycle.len(), 6);
        assert!(cycle.values().all(|r| r.vitals.len() == VITAL_SPECS.len()));
    }
}
