//! Envelope framing: compression and integrity around a packet.
//!
//! The optical channel is lossy, so every packet travels inside an envelope
//! that compresses it and carries a checksum of the original bytes.
//!
//! # Envelope Format
//!
//! ```text
//! +------------------+
//! | Magic (4 bytes)  |  0x44 0x4D 0x43 0x31 ("DMC1")
//! +------------------+
//! | zlib stream      |  compressed packet bytes
//! | (variable)       |
//! +------------------+
//! | crc32 (4)        |  u32 little-endian, CRC-32 of the UNCOMPRESSED packet
//! +------------------+
//! ```
//!
//! # CRC Coverage
//!
//! The CRC covers the packet exactly as passed to [`wrap`], so a match proves
//! the decompressed bytes are the bytes that were sent. Compression is only a
//! size optimization; nothing depends on the compressed length.

use crate::error::{EnvelopeError, Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Magic number for envelopes: "DMC1"
pub const MAGIC: [u8; 4] = *b"DMC1";

/// Size of the trailing CRC footer
const FOOTER_SIZE: usize = 4;

/// Smallest envelope: magic + at least one compressed byte + footer
const MIN_ENVELOPE_SIZE: usize = MAGIC.len() + 1 + FOOTER_SIZE;

/// Compression level used when the caller has no preference
pub const DEFAULT_LEVEL: u32 = 6;

/// Valid zlib compression levels
pub const LEVEL_RANGE: std::ops::RangeInclusive<u32> = 1..=9;

/// Compress a packet and append the CRC-32 of the uncompressed bytes.
///
/// # Errors
/// `EnvelopeError::InvalidLevel` if `level` is outside `1..=9`. The level is
/// never clamped.
pub fn wrap(packet: &[u8], level: u32) -> Result<Vec<u8>> {
    if !LEVEL_RANGE.contains(&level) {
        return Err(EnvelopeError::InvalidLevel(level).into());
    }

    let mut envelope = Vec::with_capacity(MAGIC.len() + packet.len() / 2 + FOOTER_SIZE);
    envelope.extend_from_slice(&MAGIC);

    let mut encoder = ZlibEncoder::new(envelope, Compression::new(level));
    encoder.write_all(packet)?;
    let mut envelope = encoder.finish()?;

    envelope.extend_from_slice(&crc32fast::hash(packet).to_le_bytes());
    Ok(envelope)
}

/// Verify and open an envelope.
///
/// # Errors
/// - `EnvelopeError::EnvelopeTooShort` if the blob can't hold magic + footer
/// - `EnvelopeError::InvalidMagic` if magic doesn't match
/// - `EnvelopeError::Decompress` if the zlib stream is corrupt
/// - `Error::Crc` if the decompressed bytes don't match the footer
pub fn unwrap(envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < MIN_ENVELOPE_SIZE {
        return Err(EnvelopeError::EnvelopeTooShort {
            required: MIN_ENVELOPE_SIZE,
            actual: envelope.len(),
        }
        .into());
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&envelope[..MAGIC.len()]);
    if magic != MAGIC {
        return Err(EnvelopeError::InvalidMagic {
            expected: MAGIC,
            actual: magic,
        }
        .into());
    }

    let footer_start = envelope.len() - FOOTER_SIZE;
    let mut footer = [0u8; FOOTER_SIZE];
    footer.copy_from_slice(&envelope[footer_start..]);
    let expected = u32::from_le_bytes(footer);

    let compressed = &envelope[MAGIC.len()..footer_start];
    let mut packet = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut packet)
        .map_err(|e| EnvelopeError::Decompress(e.to_string()))?;

    let actual = crc32fast::hash(&packet);
    if actual != expected {
        return Err(Error::Crc { expected, actual });
    }

    Ok(packet)
}
