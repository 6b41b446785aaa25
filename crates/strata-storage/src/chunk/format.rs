//! On-disk chunk layout
//!
//! ```text
//! active: [header 32][frame][frame]...
//! sealed: [header 32][frame]...[frame][map entries 8*n][footer 64]
//!
//! frame:  [body_len u32][crc32(body) u32][logical position u64][body][body_len u32]
//! map:    [logical_offset u32][physical_offset u32]   (scavenged chunks only)
//! ```
//!
//! All integers are little-endian. The trailing length of a frame lets a
//! reader walk a chunk backwards.

use strata_core::LogPosition;

use crate::error::StorageError;

pub const CHUNK_MAGIC: [u8; 4] = *b"STCH";
pub const FOOTER_MAGIC: [u8; 4] = *b"STFT";
pub const FORMAT_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 32;
pub const FOOTER_SIZE: usize = 64;
/// Bytes a frame adds around its body
pub const FRAME_OVERHEAD: usize = 20;
/// Length, CRC and position, read before the body
pub const FRAME_PREFIX_SIZE: usize = 16;
pub const MAP_ENTRY_SIZE: usize = 8;

const HEADER_FLAG_SCAVENGED: u8 = 1 << 0;
const FOOTER_FLAG_COMPLETED: u8 = 1 << 0;
const FOOTER_FLAG_HAS_MAP: u8 = 1 << 1;

/// Fixed-format chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_number: u32,
    pub chunk_size: u32,
    pub chunk_start_position: u64,
    pub chunk_end_position: u64,
    pub is_scavenged: bool,
}

impl ChunkHeader {
    pub fn new(chunk_number: u32, chunk_size: u32) -> Self {
        let start = chunk_number as u64 * chunk_size as u64;
        Self {
            chunk_number,
            chunk_size,
            chunk_start_position: start,
            chunk_end_position: start + chunk_size as u64,
            is_scavenged: false,
        }
    }

    /// Header for the replacement of this chunk
    pub fn scavenged(&self) -> Self {
        Self {
            is_scavenged: true,
            ..*self
        }
    }

    pub fn start(&self) -> LogPosition {
        LogPosition(self.chunk_start_position)
    }

    pub fn end(&self) -> LogPosition {
        LogPosition(self.chunk_end_position)
    }

    pub fn contains(&self, position: LogPosition) -> bool {
        position.0 >= self.chunk_start_position && position.0 < self.chunk_end_position
    }

    /// Offset of `position` within this chunk's logical range
    pub fn logical_offset(&self, position: LogPosition) -> u32 {
        (position.0 - self.chunk_start_position) as u32
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&CHUNK_MAGIC);
        buf[4] = FORMAT_VERSION;
        buf[5] = if self.is_scavenged { HEADER_FLAG_SCAVENGED } else { 0 };
        // 6..8 reserved
        buf[8..12].copy_from_slice(&self.chunk_number.to_le_bytes());
        buf[12..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.chunk_start_position.to_le_bytes());
        buf[24..32].copy_from_slice(&self.chunk_end_position.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StorageError> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::corrupt_chunk(
                u32::MAX,
                format!("header truncated to {} bytes", buf.len()),
            ));
        }
        let chunk_number = read_u32(buf, 8);
        if buf[0..4] != CHUNK_MAGIC {
            return Err(StorageError::corrupt_chunk(chunk_number, "bad header magic"));
        }
        if buf[4] != FORMAT_VERSION {
            return Err(StorageError::corrupt_chunk(
                chunk_number,
                format!("unsupported format version {}", buf[4]),
            ));
        }
        let header = Self {
            chunk_number,
            chunk_size: read_u32(buf, 12),
            chunk_start_position: read_u64(buf, 16),
            chunk_end_position: read_u64(buf, 24),
            is_scavenged: buf[5] & HEADER_FLAG_SCAVENGED != 0,
        };
        if header.chunk_end_position != header.chunk_start_position + header.chunk_size as u64 {
            return Err(StorageError::corrupt_chunk(
                chunk_number,
                "header range does not match chunk size",
            ));
        }
        Ok(header)
    }
}

/// Trailer written when a chunk is sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_completed: bool,
    pub has_map: bool,
    pub physical_data_size: u32,
    pub logical_data_size: u32,
    pub map_count: u32,
    pub hash: [u8; 32],
}

impl ChunkFooter {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..4].copy_from_slice(&FOOTER_MAGIC);
        let mut flags = 0u8;
        if self.is_completed {
            flags |= FOOTER_FLAG_COMPLETED;
        }
        if self.has_map {
            flags |= FOOTER_FLAG_HAS_MAP;
        }
        buf[4] = flags;
        buf[8..12].copy_from_slice(&self.physical_data_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.logical_data_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.map_count.to_le_bytes());
        buf[32..64].copy_from_slice(&self.hash);
        buf
    }

    /// Parse a footer; `None` if the bytes are not a completed footer,
    /// which is how an active chunk is recognised.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < FOOTER_SIZE || buf[0..4] != FOOTER_MAGIC {
            return None;
        }
        let flags = buf[4];
        if flags & FOOTER_FLAG_COMPLETED == 0 {
            return None;
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[32..64]);
        Some(Self {
            is_completed: true,
            has_map: flags & FOOTER_FLAG_HAS_MAP != 0,
            physical_data_size: read_u32(buf, 8),
            logical_data_size: read_u32(buf, 12),
            map_count: read_u32(buf, 16),
            hash,
        })
    }

    /// Total file length implied by this footer
    pub fn expected_file_len(&self) -> u64 {
        HEADER_SIZE as u64
            + self.physical_data_size as u64
            + self.map_count as u64 * MAP_ENTRY_SIZE as u64
            + FOOTER_SIZE as u64
    }
}

/// Logical-to-physical offset entry of a scavenged chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PositionMapEntry {
    pub logical_offset: u32,
    pub physical_offset: u32,
}

impl PositionMapEntry {
    pub fn to_bytes(&self) -> [u8; MAP_ENTRY_SIZE] {
        let mut buf = [0u8; MAP_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.logical_offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.physical_offset.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            logical_offset: read_u32(buf, 0),
            physical_offset: read_u32(buf, 4),
        }
    }
}

/// Encode a record body into a frame
pub fn encode_frame(position: LogPosition, body: &[u8]) -> Vec<u8> {
    let len = body.len() as u32;
    let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    frame.extend_from_slice(&position.0.to_le_bytes());
    frame.extend_from_slice(body);
    frame.extend_from_slice(&len.to_le_bytes());
    frame
}

/// Decoded frame prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    pub body_len: u32,
    pub crc: u32,
    pub position: LogPosition,
}

impl FramePrefix {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            body_len: read_u32(buf, 0),
            crc: read_u32(buf, 4),
            position: LogPosition(read_u64(buf, 8)),
        }
    }

    pub fn frame_len(&self) -> u32 {
        self.body_len.saturating_add(FRAME_OVERHEAD as u32)
    }
}

/// Check the CRC and trailing length of a frame whose body and suffix have
/// been read. Returns a description of the mismatch.
pub fn check_frame(prefix: &FramePrefix, body: &[u8], suffix: &[u8]) -> Result<(), String> {
    let trailing = read_u32(suffix, 0);
    if trailing != prefix.body_len {
        return Err(format!(
            "length prefix {} does not match suffix {}",
            prefix.body_len, trailing
        ));
    }
    let crc = crc32fast::hash(body);
    if crc != prefix.crc {
        return Err(format!(
            "crc mismatch: stored {:08x}, computed {:08x}",
            prefix.crc, crc
        ));
    }
    Ok(())
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
