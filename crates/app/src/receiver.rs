//! Live writer role.
//!
//! Accepts newline-delimited JSON bed updates over TCP, one thread per
//! connection:
//!
//! ```text
//! {"bed": "BED01", "vitals": {"HR": {"value": "72", "unit": "bpm"}, "SpO2": 97}}
//! ```
//!
//! Every accepted update is merged, snapshotted and persisted under the
//! aggregator lock, then answered with `ACK <packet_id>`. Anything else is
//! answered with `NAK <reason>` and the connection stays open.

use crate::config::ReceiveConfig;
use dmbridge_core::cache::{self, CacheOptions, SequenceStore};
use dmbridge_core::{Aggregator, BedRecord, Result, Snapshot, Source};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by every connection thread.
pub struct Receiver {
    aggregator: Aggregator,
    cache_path: PathBuf,
    sequence: SequenceStore,
    opts: CacheOptions,
}

impl Receiver {
    pub fn new(cache_path: PathBuf, opts: CacheOptions) -> Self {
        let sequence = SequenceStore::beside(&cache_path);
        Self {
            aggregator: Aggregator::new(Source::Receiver, sequence.load()),
            cache_path,
            sequence,
            opts,
        }
    }

    /// Write a snapshot of the current state without new data.
    pub fn tick(&self) -> Result<i64> {
        let snapshot = self.aggregator.tick(|s| self.persist(s))?;
        Ok(snapshot.sequence_id)
    }

    /// Handle one message line, returning the reply line.
    pub fn handle_line(&self, line: &str) -> String {
        let (bed, update) = match parse_update(line) {
            Ok(parsed) => parsed,
            Err(reason) => {
                debug!(reason = %reason, "rejected message");
                return format!("NAK {reason}");
            }
        };

        match self.aggregator.apply(&bed, update, |s| self.persist(s)) {
            Ok(snapshot) => format!("ACK {}", snapshot.sequence_id),
            Err(e) => {
                warn!(bed = %bed, error = %e, "cache persist failed; update kept in memory");
                "NAK persist".to_string()
            }
        }
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        cache::write_snapshot(&self.cache_path, snapshot, &self.opts)?;
        self.sequence.save(snapshot.sequence_id, &self.opts)
    }
}

/// Parse `{"bed": ..., "vitals": {...}}` into a bed update.
pub fn parse_update(line: &str) -> std::result::Result<(String, BedRecord), String> {
    let value: Value = serde_json::from_str(line).map_err(|_| "invalid json".to_string())?;
    let bed = value
        .get("bed")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .ok_or("missing bed")?;
    let vitals = value.get("vitals").and_then(Value::as_object).ok_or("missing vitals")?;

    let record = BedRecord::from_raw_vitals(vitals);
    if record.is_empty() {
        return Err("no numeric vitals".to_string());
    }
    Ok((bed.to_string(), record))
}

fn handle_client(stream: TcpStream, receiver: &Receiver) -> std::io::Result<()> {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    debug!(peer = %peer, "client connected");
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = receiver.handle_line(&line);
        writer.write_all(reply.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    debug!(peer = %peer, "client disconnected");
    Ok(())
}

/// Stops a running accept loop from another thread or a signal handler.
#[derive(Clone)]
pub struct Shutdown {
    stop: Arc<AtomicBool>,
    wake: SocketAddr,
}

impl Shutdown {
    pub fn for_listener(listener: &TcpListener) -> std::io::Result<Self> {
        let mut wake = listener.local_addr()?;
        // A wildcard bind is reachable through loopback
        if wake.ip().is_unspecified() {
            let loopback = match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            wake.set_ip(loopback);
        }
        Ok(Self {
            stop: Arc::new(AtomicBool::new(false)),
            wake,
        })
    }

    pub fn is_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Set the stop flag and unblock a pending `accept`.
    pub fn request(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = TcpStream::connect(self.wake) {
            debug!(addr = %self.wake, error = %e, "could not wake accept loop");
        }
    }
}

/// Accept connections until shutdown is requested, one thread each.
///
/// Connection threads already running are left to finish on their own.
pub fn serve(listener: TcpListener, receiver: Arc<Receiver>, shutdown: &Shutdown) {
    for stream in listener.incoming() {
        if shutdown.is_requested() {
            break;
        }
        match stream {
            Ok(stream) => {
                let receiver = Arc::clone(&receiver);
                std::thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &receiver) {
                        debug!(error = %e, "connection closed with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    info!("receiver stopped accepting");
}

pub fn run(config: &ReceiveConfig, opts: &CacheOptions) -> anyhow::Result<()> {
    use anyhow::Context;

    // Held until return; dropping it releases the claim
    let _claim = cache::claim_single_writer(&config.cache_path, Source::Receiver, config.claim_timeout);

    let receiver = Arc::new(Receiver::new(config.cache_path.clone(), *opts));
    match receiver.tick() {
        Ok(sequence) => debug!(sequence, "initial snapshot written"),
        Err(e) => warn!(error = %e, "initial snapshot failed"),
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, cache = %config.cache_path.display(), "receiver listening");

    let shutdown = Shutdown::for_listener(&listener).context("failed to read listener address")?;
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        on_signal.request();
    })
    .context("failed to install signal handler")?;

    serve(listener, receiver, &shutdown);
    Ok(())
}
