//! dmbridge: moves bedside vitals snapshots across an optical air gap.
//!
//! Roles run as separate processes and meet only at files:
//! `generate`/`receive` write the cache, `encode` turns it into envelope
//! bytes for the renderer, `decode` turns captured bytes into decoded-results
//! lines, and `validate` scores those lines against truth.

mod config;
mod generator;
mod input_gen;
mod receiver;
mod tools;

use anyhow::{Context, Result};
use config::{Command, Config};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Run with --help for usage");
            std::process::exit(2);
        }
    };

    if config.print_config {
        config.print();
    }

    match &config.command {
        Command::Generate(cfg) => {
            generator::run(cfg, &config.cache).context("generator failed")?;
        }
        Command::Receive(cfg) => receiver::run(cfg, &config.cache)?,
        Command::Encode(cfg) => {
            let report = tools::encode(cfg, &config.cache)
                .with_context(|| format!("failed to encode {}", cfg.cache_path.display()))?;
            println!(
                "packet_id={} packet={}B envelope={}B -> {}",
                report.packet_id,
                report.packet_len,
                report.envelope_len,
                cfg.out.display()
            );
        }
        Command::Decode(cfg) => {
            let record = tools::decode(cfg, &config.cache)
                .with_context(|| format!("failed to append to {}", cfg.results.display()))?;
            println!("{record}");
            if record["decode_ok"] != serde_json::Value::Bool(true) {
                std::process::exit(1);
            }
        }
        Command::Validate(cfg) => {
            tools::validate(cfg).context("validation failed")?;
        }
    }

    Ok(())
}
