//! dmbridge-core: vitals snapshots across an optical air gap
//!
//! This library provides the core components for a system that:
//! - Aggregates bedside vitals per bed into timestamped snapshots
//! - Serializes snapshots into a quantized fixed-grid packet inside a
//!   compressed, CRC-checked envelope small enough for a 2-D matrix code
//! - Shares the latest snapshot between independent processes through a
//!   lock-file and atomic-rename cache protocol
//! - Validates decoded snapshots against ground truth
//!
//! # Architecture
//!
//! The system is designed around clear module boundaries:
//! - `quantize`: Field scale table and fixed-point conversion
//! - `packet`: Fixed-grid packet build/parse
//! - `framing`: zlib + CRC-32 envelope
//! - `lock`: Cooperative cross-process lock files
//! - `cache`: Atomic write/append, writer claim, sequence persistence
//! - `snapshot`: Snapshot model and cache record format
//! - `aggregator`: Mutex-guarded per-bed state
//! - `validate`: Truth alignment and per-field scoring
//! - `metrics`: Validation statistics and report
//!
//! # Design Principles
//!
//! - **No panics**: All errors are structured and recoverable
//! - **Fail per attempt**: A bad packet or record never blocks the next one
//! - **Bounded waits**: Lock and retry budgets are the only blocking points
//! - **Observable**: Structured `tracing` events at every retry and skip

pub mod aggregator;
pub mod cache;
pub mod error;
pub mod framing;
pub mod lock;
pub mod metrics;
pub mod packet;
pub mod quantize;
pub mod snapshot;
pub mod validate;

// Re-export commonly used types
pub use aggregator::Aggregator;
pub use cache::CacheOptions;
pub use error::{Error, Result};
pub use packet::{build_packet, parse_packet, PacketLayout};
pub use snapshot::{BedRecord, Snapshot, Source, VitalValue};
