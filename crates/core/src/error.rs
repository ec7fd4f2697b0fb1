//! Error types for the dmbridge system.
//!
//! All operations return structured errors rather than panicking. The
//! variants follow the failure domains of the round trip:
//! - Packet: structural violations of the fixed-grid binary record
//! - Envelope / CRC: framing and integrity failures of the transport wrapper
//! - Cache: lock contention, write-retry exhaustion, malformed cache records
//! - Validate: inputs the validation engine cannot start from
//!
//! Structural decode errors are fatal to a single attempt only. Cache errors
//! are recoverable by the calling loop (skip the cycle, try again).

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for all operations in the system.
#[derive(Debug, Error)]
pub enum Error {
    /// Packet build/parse error (e.g., bad magic, size mismatch)
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Envelope framing error (e.g., bad magic, zlib failure)
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// CRC validation failed, indicating the optical channel corrupted the blob
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Crc { expected: u32, actual: u32 },

    /// Cache synchronization error (lock timeout, retries exhausted)
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Validation engine error
    #[error("validation error: {0}")]
    Validate(#[from] ValidateError),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error, rejected before any I/O
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for contention-style failures the caller should retry next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Cache(CacheError::LockTimeout { .. }) | Error::Cache(CacheError::WriteExhausted { .. })
        )
    }
}

/// Packet errors.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Invalid magic number in packet header
    #[error("invalid packet magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },

    /// Version byte is not one this build understands
    #[error("unsupported packet version {version} (supported: {supported})")]
    UnsupportedVersion { version: u8, supported: u8 },

    /// Packet is too short to contain a valid header
    #[error("packet too short: need at least {required} bytes, got {actual}")]
    PacketTooShort { required: usize, actual: usize },

    /// Declared bed/field counts disagree with the caller's layout
    #[error("layout mismatch: packet declares {declared_beds}x{declared_fields}, expected {expected_beds}x{expected_fields}")]
    LayoutMismatch {
        declared_beds: usize,
        declared_fields: usize,
        expected_beds: usize,
        expected_fields: usize,
    },

    /// Body length doesn't match bed_count * (1 + field_count * 5)
    #[error("body length mismatch: layout requires {expected} bytes, got {actual}")]
    BodyLengthMismatch { expected: usize, actual: usize },

    /// Layout has more entries than a single count byte can express
    #[error("{what} count {count} exceeds maximum 255")]
    LayoutTooLarge { what: &'static str, count: usize },
}

/// Envelope errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Invalid magic number at the start of the envelope
    #[error("invalid envelope magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },

    /// Envelope is too short to contain magic, body and footer
    #[error("envelope too short: need at least {required} bytes, got {actual}")]
    EnvelopeTooShort { required: usize, actual: usize },

    /// zlib stream could not be inflated
    #[error("decompress failed: {0}")]
    Decompress(String),

    /// Compression level outside 1..=9
    #[error("compression level {0} out of range 1..=9")]
    InvalidLevel(u32),
}

/// Cache synchronization errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Lock file still held by someone else when the timeout elapsed
    #[error("timed out after {waited_ms}ms waiting for lock file: {}", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// Every bounded write attempt failed; target left untouched
    #[error("failed to update {} after {attempts} attempts: {source}; {hint}", path.display())]
    WriteExhausted {
        path: PathBuf,
        attempts: u32,
        hint: String,
        #[source]
        source: std::io::Error,
    },

    /// Required cache field has the wrong type
    #[error("malformed cache record: field `{field}` {reason}")]
    MalformedRecord { field: &'static str, reason: String },
}

/// Validation engine errors.
#[derive(Debug, Error)]
pub enum ValidateError {
    /// Input stream doesn't exist
    #[error("input not found: {}", .0.display())]
    MissingInput(PathBuf),

    /// Config file exists but cannot be used
    #[error("invalid validator config {}: {reason}", path.display())]
    InvalidConfig { path: PathBuf, reason: String },
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
