//! Configuration for the dmbridge application.
//!
//! Handles parsing command-line arguments into one subcommand plus shared
//! cache tuning.
//!
//! # Philosophy
//!
//! Every subcommand works with zero flags, using the file names the roles
//! agree on by default. `--print-config` shows the resolved values so runs
//! are reproducible.

use dmbridge_core::cache::{CacheOptions, SequenceStore};
use dmbridge_core::framing::{DEFAULT_LEVEL, LEVEL_RANGE};
use dmbridge_core::packet::STANDARD_BEDS;
use dmbridge_core::snapshot::now_ms;
use dmbridge_core::validate::{TruthSource, DEFAULT_TOLERANCE_MS};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Complete configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,

    /// Lock and write-retry tuning shared by every writer
    pub cache: CacheOptions,

    /// Whether to print detailed config
    pub print_config: bool,
}

#[derive(Debug, Clone)]
pub enum Command {
    Generate(GenerateConfig),
    Receive(ReceiveConfig),
    Encode(EncodeConfig),
    Decode(DecodeConfig),
    Validate(ValidateConfig),
}

/// Simulated vitals writer.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub cache_path: PathBuf,
    pub packet_id_state: PathBuf,
    pub truth_out: Option<PathBuf>,
    /// Append to an existing truth log instead of starting it over
    pub append_truth: bool,
    pub truth_every_n: u64,
    pub interval: Duration,
    /// Cycles to run (None = forever)
    pub count: Option<u64>,
    pub seed: u64,
    pub beds: Vec<String>,
}

/// Live vitals writer fed over TCP.
#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    pub host: String,
    pub port: u16,
    pub cache_path: PathBuf,
    pub claim_timeout: Duration,
}

/// Cache snapshot to envelope bytes.
#[derive(Debug, Clone)]
pub struct EncodeConfig {
    pub cache_path: PathBuf,
    pub out: PathBuf,
    pub level: u32,
    pub beds: usize,
}

/// Envelope bytes to a decoded-results line.
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    pub input: PathBuf,
    pub results: PathBuf,
    /// Name of the captured image the bytes came from
    pub source_image: Option<String>,
    /// Cache to attribute the decode to (adds `cache_epoch_ms`)
    pub cache_path: Option<PathBuf>,
    pub beds: usize,
}

/// Decoded results against truth.
#[derive(Debug, Clone)]
pub struct ValidateConfig {
    pub decoded: PathBuf,
    pub truth: TruthSource,
    pub out: PathBuf,
    pub summary_out: PathBuf,
    pub last: Option<usize>,
    pub tolerance_ms: i64,
    pub config_path: PathBuf,
    pub print_summary: bool,
}

/// Walks the argument list, handing out flag values.
struct ArgCursor<'a> {
    args: &'a [String],
    i: usize,
}

impl<'a> ArgCursor<'a> {
    fn next_flag(&mut self) -> Option<&'a str> {
        let flag = self.args.get(self.i)?;
        self.i += 1;
        Some(flag.as_str())
    }

    fn value(&mut self, flag: &str) -> Result<&'a str, String> {
        let value = self
            .args
            .get(self.i)
            .ok_or_else(|| format!("{flag} requires a value"))?;
        self.i += 1;
        Ok(value.as_str())
    }

    fn parse<T: FromStr>(&mut self, flag: &str) -> Result<T, String> {
        let raw = self.value(flag)?;
        raw.parse().map_err(|_| format!("invalid value for {flag}: {raw}"))
    }
}

/// Flags accepted by every subcommand.
#[derive(Debug, Default)]
struct CommonFlags {
    lock_timeout_ms: Option<u64>,
    write_retries: Option<u32>,
    print_config: bool,
}

impl CommonFlags {
    /// Consume `flag` if it is a common flag.
    fn accept(&mut self, flag: &str, cur: &mut ArgCursor<'_>) -> Result<bool, String> {
        match flag {
            "--lock-timeout-ms" => self.lock_timeout_ms = Some(cur.parse(flag)?),
            "--write-retries" => self.write_retries = Some(cur.parse(flag)?),
            "--print-config" => self.print_config = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn cache_options(&self) -> CacheOptions {
        let defaults = CacheOptions::default();
        CacheOptions {
            lock_timeout: self
                .lock_timeout_ms
                .map_or(defaults.lock_timeout, Duration::from_millis),
            write_retries: self.write_retries.unwrap_or(defaults.write_retries).max(1),
            ..defaults
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments (program name excluded).
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let Some(sub) = args.first() else {
            return Err("missing subcommand (generate, receive, encode, decode, validate)".to_string());
        };
        let mut cur = ArgCursor { args, i: 1 };
        let mut common = CommonFlags::default();

        let command = match sub.as_str() {
            "generate" => Command::Generate(parse_generate(&mut cur, &mut common)?),
            "receive" => Command::Receive(parse_receive(&mut cur, &mut common)?),
            "encode" => Command::Encode(parse_encode(&mut cur, &mut common)?),
            "decode" => Command::Decode(parse_decode(&mut cur, &mut common)?),
            "validate" => Command::Validate(parse_validate(&mut cur, &mut common)?),
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(format!("unknown subcommand: {other}")),
        };

        Ok(Config {
            command,
            cache: common.cache_options(),
            print_config: common.print_config,
        })
    }

    /// Print the configuration in human-readable form.
    pub fn print(&self) {
        println!("=== Configuration ===");
        match &self.command {
            Command::Generate(g) => {
                println!("Mode: generate");
                println!("Cache: {}", g.cache_path.display());
                println!("Packet id state: {}", g.packet_id_state.display());
                println!(
                    "Truth log: {}",
                    g.truth_out.as_ref().map_or("(none)".to_string(), |p| p.display().to_string())
                );
                println!("Truth every: {} cycle(s), append: {}", g.truth_every_n, g.append_truth);
                println!("Interval: {} ms", g.interval.as_millis());
                println!("Count: {}", g.count.map_or("unbounded".to_string(), |c| c.to_string()));
                println!("Seed: {}", g.seed);
                println!("Beds: {}", g.beds.join(","));
            }
            Command::Receive(r) => {
                println!("Mode: receive");
                println!("Listen: {}:{}", r.host, r.port);
                println!("Cache: {}", r.cache_path.display());
                println!("Writer claim timeout: {} ms", r.claim_timeout.as_millis());
            }
            Command::Encode(e) => {
                println!("Mode: encode");
                println!("Cache: {}", e.cache_path.display());
                println!("Envelope out: {}", e.out.display());
                println!("Compression level: {}", e.level);
                println!("Beds: {}", e.beds);
            }
            Command::Decode(d) => {
                println!("Mode: decode");
                println!("Envelope in: {}", d.input.display());
                println!("Results: {}", d.results.display());
                println!("Beds: {}", d.beds);
            }
            Command::Validate(v) => {
                println!("Mode: validate");
                println!("Decoded results: {}", v.decoded.display());
                match &v.truth {
                    TruthSource::Jsonl(p) => println!("Truth (jsonl): {}", p.display()),
                    TruthSource::CacheDir(p) => println!("Truth (cache dir): {}", p.display()),
                }
                println!("Detail out: {}", v.out.display());
                println!("Summary out: {}", v.summary_out.display());
                println!("Last: {}", v.last.map_or("all".to_string(), |n| n.to_string()));
                println!("Tolerance: {} ms", v.tolerance_ms);
                println!("Validator config: {}", v.config_path.display());
            }
        }
        println!();
        println!("=== Cache ===");
        println!("Lock timeout: {} ms", self.cache.lock_timeout.as_millis());
        println!("Lock poll: {} ms", self.cache.poll_interval.as_millis());
        println!("Write retries: {}", self.cache.write_retries);
        println!(
            "Backoff: {}..{} ms",
            self.cache.base_backoff.as_millis(),
            self.cache.max_backoff.as_millis()
        );
        println!();
    }
}

fn standard_beds(count: usize) -> Vec<String> {
    STANDARD_BEDS.iter().take(count).map(|s| s.to_string()).collect()
}

fn check_beds(beds: usize) -> Result<usize, String> {
    if beds == 0 || beds > STANDARD_BEDS.len() {
        return Err(format!("--beds must be between 1 and {}", STANDARD_BEDS.len()));
    }
    Ok(beds)
}

fn parse_generate(cur: &mut ArgCursor<'_>, common: &mut CommonFlags) -> Result<GenerateConfig, String> {
    let mut cache_path = PathBuf::from("generator_cache.json");
    let mut packet_id_state: Option<PathBuf> = None;
    let mut truth_out: Option<PathBuf> = None;
    let mut append_truth = false;
    let mut truth_every_n: u64 = 1;
    let mut interval_ms: u64 = 1000;
    let mut count: Option<i64> = None;
    let mut seed: Option<u64> = None;
    let mut beds: usize = STANDARD_BEDS.len();

    while let Some(flag) = cur.next_flag() {
        match flag {
            "--cache" => cache_path = PathBuf::from(cur.value(flag)?),
            "--packet-id-state" => packet_id_state = Some(PathBuf::from(cur.value(flag)?)),
            "--truth-out" => truth_out = Some(PathBuf::from(cur.value(flag)?)),
            "--append-truth" => append_truth = true,
            "--truth-every-n" => truth_every_n = cur.parse(flag)?,
            "--interval-ms" => interval_ms = cur.parse(flag)?,
            "--count" => count = Some(cur.parse(flag)?),
            "--seed" => seed = Some(cur.parse(flag)?),
            "--beds" => beds = check_beds(cur.parse(flag)?)?,
            _ if common.accept(flag, cur)? => {}
            _ => return Err(format!("unknown argument: {flag}")),
        }
    }

    if truth_every_n < 1 {
        return Err("--truth-every-n must be >= 1".to_string());
    }

    let packet_id_state = packet_id_state.unwrap_or_else(|| SequenceStore::beside(&cache_path).path().to_path_buf());

    Ok(GenerateConfig {
        packet_id_state,
        cache_path,
        truth_out,
        append_truth,
        truth_every_n,
        interval: Duration::from_millis(interval_ms),
        // Negative count means run forever
        count: count.and_then(|c| u64::try_from(c).ok()),
        seed: seed.unwrap_or_else(|| now_ms().unsigned_abs()),
        beds: standard_beds(beds),
    })
}

fn parse_receive(cur: &mut ArgCursor<'_>, common: &mut CommonFlags) -> Result<ReceiveConfig, String> {
    let mut host = "0.0.0.0".to_string();
    let mut port: u16 = 2575;
    let mut cache_path = PathBuf::from("receiver_cache.json");
    let mut claim_timeout_ms: u64 = 2000;

    while let Some(flag) = cur.next_flag() {
        match flag {
            "--host" => host = cur.value(flag)?.to_string(),
            "--port" => port = cur.parse(flag)?,
            "--cache" => cache_path = PathBuf::from(cur.value(flag)?),
            "--claim-timeout-ms" => claim_timeout_ms = cur.parse(flag)?,
            _ if common.accept(flag, cur)? => {}
            _ => return Err(format!("unknown argument: {flag}")),
        }
    }

    Ok(ReceiveConfig {
        host,
        port,
        cache_path,
        claim_timeout: Duration::from_millis(claim_timeout_ms),
    })
}

fn parse_encode(cur: &mut ArgCursor<'_>, common: &mut CommonFlags) -> Result<EncodeConfig, String> {
    let mut cache_path = PathBuf::from("generator_cache.json");
    let mut out = PathBuf::from("packet.dmc");
    let mut level = DEFAULT_LEVEL;
    let mut beds = STANDARD_BEDS.len();

    while let Some(flag) = cur.next_flag() {
        match flag {
            "--cache" => cache_path = PathBuf::from(cur.value(flag)?),
            "--out" => out = PathBuf::from(cur.value(flag)?),
            "--level" => level = cur.parse(flag)?,
            "--beds" => beds = check_beds(cur.parse(flag)?)?,
            _ if common.accept(flag, cur)? => {}
            _ => return Err(format!("unknown argument: {flag}")),
        }
    }

    // Rejected here, before any I/O
    if !LEVEL_RANGE.contains(&level) {
        return Err(format!(
            "--level must be between {} and {}",
            LEVEL_RANGE.start(),
            LEVEL_RANGE.end()
        ));
    }

    Ok(EncodeConfig {
        cache_path,
        out,
        level,
        beds,
    })
}

fn parse_decode(cur: &mut ArgCursor<'_>, common: &mut CommonFlags) -> Result<DecodeConfig, String> {
    let mut input: Option<PathBuf> = None;
    let mut results = PathBuf::from("dataset/decoded_results.jsonl");
    let mut source_image: Option<String> = None;
    let mut cache_path: Option<PathBuf> = None;
    let mut beds = STANDARD_BEDS.len();

    while let Some(flag) = cur.next_flag() {
        match flag {
            "--in" => input = Some(PathBuf::from(cur.value(flag)?)),
            "--results" => results = PathBuf::from(cur.value(flag)?),
            "--source-image" => source_image = Some(cur.value(flag)?.to_string()),
            "--cache" => cache_path = Some(PathBuf::from(cur.value(flag)?)),
            "--beds" => beds = check_beds(cur.parse(flag)?)?,
            _ if common.accept(flag, cur)? => {}
            _ => return Err(format!("unknown argument: {flag}")),
        }
    }

    Ok(DecodeConfig {
        input: input.ok_or("--in is required")?,
        results,
        source_image,
        cache_path,
        beds,
    })
}

fn parse_validate(cur: &mut ArgCursor<'_>, common: &mut CommonFlags) -> Result<ValidateConfig, String> {
    let mut decoded = PathBuf::from("dataset/decoded_results.jsonl");
    let mut truth: Option<TruthSource> = None;
    let mut out = PathBuf::from("dataset/validation_detail.jsonl");
    let mut summary_out = PathBuf::from("dataset/validation_summary.json");
    let mut last: Option<usize> = None;
    let mut tolerance_ms = DEFAULT_TOLERANCE_MS;
    let mut config_path = PathBuf::from("validator_dm_config.json");
    let mut print_summary = true;

    while let Some(flag) = cur.next_flag() {
        match flag {
            "--decoded-results" => decoded = PathBuf::from(cur.value(flag)?),
            "--truth" => truth = Some(TruthSource::Jsonl(PathBuf::from(cur.value(flag)?))),
            "--truth-dir" => truth = Some(TruthSource::CacheDir(PathBuf::from(cur.value(flag)?))),
            "--out" => out = PathBuf::from(cur.value(flag)?),
            "--summary-out" => summary_out = PathBuf::from(cur.value(flag)?),
            "--last" => last = Some(cur.parse(flag)?),
            "--tolerance-ms" => tolerance_ms = cur.parse(flag)?,
            "--config" => config_path = PathBuf::from(cur.value(flag)?),
            "--no-summary" => print_summary = false,
            _ if common.accept(flag, cur)? => {}
            _ => return Err(format!("unknown argument: {flag}")),
        }
    }

    if tolerance_ms < 0 {
        return Err("--tolerance-ms must be >= 0".to_string());
    }

    Ok(ValidateConfig {
        decoded,
        truth: truth.ok_or("--truth or --truth-dir is required")?,
        out,
        summary_out,
        last: last.filter(|n| *n > 0),
        tolerance_ms,
        config_path,
        print_summary,
    })
}

fn print_help() {
    println!("dmbridge: vitals snapshots across an optical air gap");
    println!();
    println!("USAGE:");
    println!("    dmbridge <SUBCOMMAND> [OPTIONS]");
    println!();
    println!("SUBCOMMANDS:");
    println!("    generate    Write simulated vitals snapshots to the cache");
    println!("    receive     Accept live vitals over TCP and write them to the cache");
    println!("    encode      Turn the current cache snapshot into envelope bytes");
    println!("    decode      Turn envelope bytes into a decoded-results line");
    println!("    validate    Score decoded results against truth");
    println!();
    println!("GENERATE:");
    println!("    --cache <PATH>            Cache file (default: generator_cache.json)");
    println!("    --packet-id-state <PATH>  Sequence state (default: <cache>.packet_id)");
    println!("    --truth-out <PATH>        Truth JSONL log (default: none)");
    println!("    --append-truth            Append to an existing truth log");
    println!("    --truth-every-n <N>       Log truth every N cycles (default: 1)");
    println!("    --interval-ms <MS>        Cycle interval (default: 1000)");
    println!("    --count <N>               Cycles to run, -1 for forever (default: -1)");
    println!("    --seed <N>                Random seed (default: time-based)");
    println!("    --beds <N>                Beds to simulate, 1-6 (default: 6)");
    println!();
    println!("RECEIVE:");
    println!("    --host <ADDR>             Listen address (default: 0.0.0.0)");
    println!("    --port <N>                Listen port (default: 2575)");
    println!("    --cache <PATH>            Cache file (default: receiver_cache.json)");
    println!("    --claim-timeout-ms <MS>   Writer claim timeout (default: 2000)");
    println!();
    println!("ENCODE:");
    println!("    --cache <PATH>            Cache file to read (default: generator_cache.json)");
    println!("    --out <PATH>              Envelope output (default: packet.dmc)");
    println!("    --level <1-9>             zlib level (default: 6)");
    println!("    --beds <N>                Beds in the grid (default: 6)");
    println!();
    println!("DECODE:");
    println!("    --in <PATH>               Envelope bytes (required)");
    println!("    --results <PATH>          Decoded results JSONL (default: dataset/decoded_results.jsonl)");
    println!("    --source-image <NAME>     Image the bytes were read from");
    println!("    --cache <PATH>            Attribute the decode to this cache's snapshot time");
    println!("    --beds <N>                Beds in the grid (default: 6)");
    println!();
    println!("VALIDATE:");
    println!("    --decoded-results <PATH>  Decoded results JSONL (default: dataset/decoded_results.jsonl)");
    println!("    --truth <PATH>            Truth JSONL (generator truth or cache snapshot log)");
    println!("    --truth-dir <DIR>         Directory of cache snapshot .json files");
    println!("    --out <PATH>              Per-cell detail JSONL");
    println!("    --summary-out <PATH>      Summary JSON");
    println!("    --last <N>                Only the last N decoded records");
    println!("    --tolerance-ms <MS>       Max time skew for a truth match (default: 2000)");
    println!("    --config <PATH>           Validator config, created if missing");
    println!("    --no-summary              Don't print the summary");
    println!();
    println!("COMMON:");
    println!("    --lock-timeout-ms <MS>    Cache lock timeout (default: 5000)");
    println!("    --write-retries <N>       Atomic write attempts (default: 20)");
    println!("    --print-config            Print resolved configuration");
    println!("    --help, -h                Print this help");
    println!();
    println!("Log verbosity follows RUST_LOG (default: info).");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_generate_defaults() {
        let config = Config::from_args(&args(&["generate", "--seed", "7"])).unwrap();
        let Command::Generate(g) = config.command else {
            panic!("expected generate");
        };
        assert_eq!(g.cache_path, PathBuf::from("generator_cache.json"));
        assert_eq!(g.packet_id_state, PathBuf::from("generator_cache.json.packet_id"));
        assert_eq!(g.seed, 7);
        assert_eq!(g.count, None);
        assert_eq!(g.beds.len(), 6);
        assert_eq!(config.cache.write_retries, 20);
    }

    #[test]
    fn test_common_flags() {
        let config = Config::from_args(&args(&[
            "receive",
            "--port",
            "3000",
            "--lock-timeout-ms",
            "250",
            "--print-config",
        ]))
        .unwrap();
        assert!(config.print_config);
        assert_eq!(config.cache.lock_timeout, Duration::from_millis(250));
        let Command::Receive(r) = config.command else {
            panic!("expected receive");
        };
        assert_eq!(r.port, 3000);
    }

    #[test]
    fn test_invalid_level_rejected() {
        assert!(Config::from_args(&args(&["encode", "--level", "0"])).is_err());
        assert!(Config::from_args(&args(&["encode", "--level", "10"])).is_err());
        assert!(Config::from_args(&args(&["encode", "--level", "9"])).is_ok());
    }

    #[test]
    fn test_validate_requires_truth() {
        assert!(Config::from_args(&args(&["validate"])).is_err());
        let config = Config::from_args(&args(&["validate", "--truth-dir", "caches", "--last", "10"])).unwrap();
        let Command::Validate(v) = config.command else {
            panic!("expected validate");
        };
        assert_eq!(v.truth, TruthSource::CacheDir(PathBuf::from("caches")));
        assert_eq!(v.last, Some(10));
        assert_eq!(v.tolerance_ms, 2000);
    }

    #[test]
    fn test_errors() {
        assert!(Config::from_args(&[]).is_err());
        assert!(Config::from_args(&args(&["transmit"])).is_err());
        assert!(Config::from_args(&args(&["generate", "--bogus"])).is_err());
        assert!(Config::from_args(&args(&["generate", "--seed"])).is_err());
        assert!(Config::from_args(&args(&["generate", "--truth-every-n", "0"])).is_err());
        assert!(Config::from_args(&args(&["generate", "--beds", "7"])).is_err());
        assert!(Config::from_args(&args(&["decode"])).is_err());
    }

    #[test]
    fn test_negative_count_runs_forever() {
        let config = Config::from_args(&args(&["generate", "--count", "-1"])).unwrap();
        let Command::Generate(g) = config.command else {
            panic!("expected generate");
        };
        assert_eq!(g.count, None);
    }
}
