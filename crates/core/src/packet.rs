//! Fixed-grid binary packet format.
//!
//! A packet is the compact serialization of a [`Snapshot`] for a
//! low-capacity optical channel. The grid shape is always
//! `bed_order x field_order`; beds or fields missing from the snapshot are
//! encoded as not-present, never omitted.
//!
//! # Packet Format
//!
//! ```text
//! +---------------------+
//! | Magic (4 bytes)     |  0x44 0x4D 0x50 0x31 ("DMP1")
//! +---------------------+
//! | version (1)         |  currently 1
//! +---------------------+
//! | bed_count (1)       |  number of beds in the grid
//! +---------------------+
//! | field_count (1)     |  number of fields per bed
//! +---------------------+
//! | reserved (1)        |  0
//! +---------------------+
//! | timestamp_ms (8)    |  i64 little-endian
//! +---------------------+
//! | per bed:            |
//! |   present (1)       |
//! |   per field:        |
//! |     present (1)     |
//! |     value (4)       |  i32 little-endian, quantized
//! +---------------------+
//! ```
//!
//! # Size Invariant
//!
//! Body length = bed_count * (1 + field_count * 5). Anything else is a
//! decode error.

use crate::error::{PacketError, Result};
use crate::quantize::QuantTable;
use crate::snapshot::{BedRecord, Snapshot, Source, VitalValue};
use std::collections::BTreeMap;

/// Magic number for packets: "DMP1"
pub const MAGIC: [u8; 4] = *b"DMP1";

/// Packet format version written by this build
pub const VERSION: u8 = 1;

/// Size of packet header in bytes
pub const HEADER_SIZE: usize = 16;

/// Bytes per field cell (presence + i32)
const CELL_SIZE: usize = 5;

/// Maximum beds or fields expressible in a count byte
pub const MAX_LAYOUT_ENTRIES: usize = u8::MAX as usize;

/// Standard bed order for a six-bed ward.
pub const STANDARD_BEDS: [&str; 6] = ["BED01", "BED02", "BED03", "BED04", "BED05", "BED06"];

/// Standard field order for the bedside monitor parameter set.
pub const STANDARD_FIELDS: [&str; 20] = [
    "HR", "ART_S", "ART_D", "ART_M", "CVP_M", "RAP_M", "SpO2", "TSKIN", "TRECT", "rRESP",
    "EtCO2", "RR", "VTe", "VTi", "Ppeak", "PEEP", "O2conc", "NO", "BSR1", "BSR2",
];

/// The agreed grid shape plus quantization scales.
///
/// Both ends of the optical channel must use the same layout.
#[derive(Debug, Clone)]
pub struct PacketLayout {
    beds: Vec<String>,
    fields: Vec<String>,
    table: QuantTable,
}

impl PacketLayout {
    /// Create a layout.
    ///
    /// # Errors
    /// `PacketError::LayoutTooLarge` if either order has more than 255
    /// entries. Checked before any packet is built.
    pub fn new(beds: Vec<String>, fields: Vec<String>, table: QuantTable) -> Result<Self> {
        if beds.len() > MAX_LAYOUT_ENTRIES {
            return Err(PacketError::LayoutTooLarge {
                what: "bed",
                count: beds.len(),
            }
            .into());
        }
        if fields.len() > MAX_LAYOUT_ENTRIES {
            return Err(PacketError::LayoutTooLarge {
                what: "field",
                count: fields.len(),
            }
            .into());
        }

        Ok(Self { beds, fields, table })
    }

    /// Six beds x twenty fields with temperature fields at scale 10.
    pub fn standard() -> Self {
        Self {
            beds: STANDARD_BEDS.iter().map(|s| s.to_string()).collect(),
            fields: STANDARD_FIELDS.iter().map(|s| s.to_string()).collect(),
            table: QuantTable::standard(),
        }
    }

    /// Standard fields and scales, first `count` beds.
    pub fn standard_with_beds(count: usize) -> Self {
        let mut layout = Self::standard();
        layout.beds.truncate(count);
        layout
    }

    pub fn beds(&self) -> &[String] {
        &self.beds
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn table(&self) -> &QuantTable {
        &self.table
    }

    /// Exact body length this layout requires.
    pub fn body_len(&self) -> usize {
        self.beds.len() * (1 + self.fields.len() * CELL_SIZE)
    }

    /// Exact packet length this layout requires.
    pub fn packet_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }
}

/// A parsed packet: the reconstructed bed/field grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// Snapshot time embedded by the sender
    pub timestamp_ms: i64,

    /// Present beds only; each holds its present fields
    pub beds: BTreeMap<String, BTreeMap<String, f64>>,
}

impl DecodedPacket {
    pub fn value(&self, bed: &str, field: &str) -> Option<f64> {
        self.beds.get(bed).and_then(|b| b.get(field)).copied()
    }

    pub fn is_bed_present(&self, bed: &str) -> bool {
        self.beds.contains_key(bed)
    }

    /// Rebuild a snapshot. The wire form carries no sequence id or units.
    pub fn to_snapshot(&self, sequence_id: i64, source: Source) -> Snapshot {
        let mut snapshot = Snapshot::new(self.timestamp_ms, sequence_id, source);
        for (bed, fields) in &self.beds {
            let mut record = BedRecord::new();
            for (field, value) in fields {
                record.insert(field.clone(), VitalValue::new(*value));
            }
            snapshot.insert_bed(bed.clone(), record);
        }
        snapshot
    }
}

/// Serialize a snapshot into the fixed grid.
///
/// Beds and fields the snapshot lacks become not-present cells. Beds or
/// fields the layout doesn't name are ignored.
pub fn build_packet(snapshot: &Snapshot, layout: &PacketLayout) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(layout.packet_len());

    // Header
    bytes.extend_from_slice(&MAGIC);
    bytes.push(VERSION);
    bytes.push(layout.beds.len() as u8);
    bytes.push(layout.fields.len() as u8);
    bytes.push(0);
    bytes.extend_from_slice(&snapshot.captured_at_ms.to_le_bytes());

    // Body
    for bed in &layout.beds {
        let record = snapshot.beds.get(bed);
        bytes.push(record.is_some() as u8);

        for field in &layout.fields {
            let value = record.and_then(|r| r.value(field));
            let (present, raw) = layout.table.quantize(field, value);
            bytes.push(present as u8);
            bytes.extend_from_slice(&raw.to_le_bytes());
        }
    }

    bytes
}

/// Parse a packet against the caller's expected layout.
///
/// # Errors
/// - `PacketError::PacketTooShort` if the header doesn't fit
/// - `PacketError::InvalidMagic` if magic doesn't match
/// - `PacketError::UnsupportedVersion` if version isn't `VERSION`
/// - `PacketError::LayoutMismatch` if declared counts differ from `layout`
/// - `PacketError::BodyLengthMismatch` if the body isn't exactly the grid size
pub fn parse_packet(bytes: &[u8], layout: &PacketLayout) -> Result<DecodedPacket> {
    if bytes.len() < HEADER_SIZE {
        return Err(PacketError::PacketTooShort {
            required: HEADER_SIZE,
            actual: bytes.len(),
        }
        .into());
    }

    let magic = read_array::<4>(bytes, 0);
    if magic != MAGIC {
        return Err(PacketError::InvalidMagic {
            expected: MAGIC,
            actual: magic,
        }
        .into());
    }

    let version = bytes[4];
    if version != VERSION {
        return Err(PacketError::UnsupportedVersion {
            version,
            supported: VERSION,
        }
        .into());
    }

    let bed_count = bytes[5] as usize;
    let field_count = bytes[6] as usize;
    if bed_count != layout.beds.len() || field_count != layout.fields.len() {
        return Err(PacketError::LayoutMismatch {
            declared_beds: bed_count,
            declared_fields: field_count,
            expected_beds: layout.beds.len(),
            expected_fields: layout.fields.len(),
        }
        .into());
    }

    let timestamp_ms = i64::from_le_bytes(read_array::<8>(bytes, 8));

    let body = &bytes[HEADER_SIZE..];
    let expected_body = layout.body_len();
    if body.len() != expected_body {
        return Err(PacketError::BodyLengthMismatch {
            expected: expected_body,
            actual: body.len(),
        }
        .into());
    }

    let mut beds = BTreeMap::new();
    let mut offset = 0;
    for bed in &layout.beds {
        let bed_present = body[offset] != 0;
        offset += 1;

        let mut fields = BTreeMap::new();
        for field in &layout.fields {
            let present = body[offset] != 0;
            let raw = i32::from_le_bytes(read_array::<4>(body, offset + 1));
            offset += CELL_SIZE;

            if let Some(value) = layout.table.dequantize(field, present, raw) {
                fields.insert(field.clone(), value);
            }
        }

        if bed_present {
            beds.insert(bed.clone(), fields);
        }
    }

    Ok(DecodedPacket { timestamp_ms, beds })
}

/// Copy `N` bytes at `offset`. Callers have already checked the length.
fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}
