//! Simulated writer role.
//!
//! Each cycle draws fresh vitals for every bed, replaces the aggregator
//! state, persists the snapshot to the cache together with the sequence
//! counter, and every N cycles appends the same snapshot to the truth log.

use crate::config::GenerateConfig;
use crate::input_gen::VitalsSimulator;
use dmbridge_core::cache::{self, CacheOptions, SequenceStore};
use dmbridge_core::{Aggregator, Error, Result, Snapshot, Source};
use tracing::{debug, info, warn};

/// Counters for one generator run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GeneratorStats {
    pub cycles: u64,
    pub written: u64,
    pub skipped: u64,
    pub truth_rows: u64,
}

/// Appends truth rows, starting the log over on first write unless told to append.
struct TruthLog<'a> {
    config: &'a GenerateConfig,
    append: bool,
}

impl TruthLog<'_> {
    fn record(&mut self, snapshot: &Snapshot, opts: &CacheOptions) -> Result<bool> {
        let Some(path) = &self.config.truth_out else {
            return Ok(false);
        };
        let mut line = serde_json::to_string(&snapshot.to_cache_value())?;
        if self.append {
            cache::atomic_append(path, &line, opts)?;
        } else {
            line.push('\n');
            cache::atomic_write(path, line.as_bytes(), opts)?;
            self.append = true;
        }
        Ok(true)
    }
}

pub fn run(config: &GenerateConfig, opts: &CacheOptions) -> Result<GeneratorStats> {
    let store = SequenceStore::new(&config.packet_id_state);
    let aggregator = Aggregator::new(Source::Generator, store.load());
    let mut simulator = VitalsSimulator::new(config.seed);
    let mut truth = TruthLog {
        config,
        append: config.append_truth,
    };
    let mut stats = GeneratorStats::default();

    info!(
        cache = %config.cache_path.display(),
        start_sequence = aggregator.sequence(),
        seed = config.seed,
        beds = config.beds.len(),
        "generator started"
    );

    loop {
        if config.count.is_some_and(|count| stats.cycles >= count) {
            break;
        }
        stats.cycles += 1;

        let beds = simulator.cycle(&config.beds);
        let written = aggregator.replace_all(beds, |snapshot| {
            cache::write_snapshot(&config.cache_path, snapshot, opts)?;
            store.save(snapshot.sequence_id, opts)
        });

        match written {
            Ok(snapshot) => {
                stats.written += 1;
                debug!(packet_id = snapshot.sequence_id, "snapshot written");
                if stats.cycles % config.truth_every_n == 0 {
                    match truth.record(&snapshot, opts) {
                        Ok(true) => stats.truth_rows += 1,
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "truth append failed"),
                    }
                }
            }
            Err(e) if e.is_transient() => {
                stats.skipped += 1;
                warn!(error = %e, "cache busy; skipping cycle");
            }
            Err(e @ Error::Io(_)) => {
                stats.skipped += 1;
                warn!(error = %e, "cache write failed; skipping cycle");
            }
            Err(e) => return Err(e),
        }

        if !config.interval.is_zero() {
            std::thread::sleep(config.interval);
        }
    }

    info!(
        cycles = stats.cycles,
        written = stats.written,
        skipped = stats.skipped,
        truth_rows = stats.truth_rows,
        "generator finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmbridge_core::validate::record::load_truth_jsonl;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(dir: &Path, count: u64, every: u64) -> GenerateConfig {
        let cache_path = dir.join("generator_cache.json");
        GenerateConfig {
            packet_id_state: dir.join("generator_cache.json.packet_id"),
            cache_path,
            truth_out: Some(dir.join("truth.jsonl")),
            append_truth: false,
            truth_every_n: every,
            interval: Duration::ZERO,
            count: Some(count),
            seed: 99,
            beds: vec!["BED01".into(), "BED02".into()],
        }
    }

    #[test]
    fn test_cycles_write_cache_and_truth() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4, 2);
        let stats = run(&cfg, &CacheOptions::quick()).unwrap();
        assert_eq!(
            stats,
            GeneratorStats {
                cycles: 4,
                written: 4,
                skipped: 0,
                truth_rows: 2
            }
        );

        let snapshot = cache::read_snapshot(&cfg.cache_path, 1, Duration::ZERO).unwrap();
        assert_eq!(snapshot.sequence_id, 4);
        assert_eq!(snapshot.source, Source::Generator);
        assert_eq!(snapshot.beds.len(), 2);

        let rows = load_truth_jsonl(cfg.truth_out.as_ref().unwrap()).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.packet_id).collect();
        assert_eq!(ids, vec![Some(2), Some(4)]);
    }

    #[test]
    fn test_sequence_resumes_from_state() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 3, 1);
        run(&cfg, &CacheOptions::quick()).unwrap();
        run(&cfg, &CacheOptions::quick()).unwrap();

        assert_eq!(SequenceStore::new(&cfg.packet_id_state).load(), 6);
        // Second run started the truth log over
        let rows = load_truth_jsonl(cfg.truth_out.as_ref().unwrap()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].packet_id, Some(4));
    }

    #[test]
    fn test_append_truth_keeps_existing_rows() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), 2, 1);
        run(&cfg, &CacheOptions::quick()).unwrap();
        cfg.append_truth = true;
        run(&cfg, &CacheOptions::quick()).unwrap();

        let rows = load_truth_jsonl(cfg.truth_out.as_ref().unwrap()).unwrap();
        assert_eq!(rows.len(), 4);
    }
}
