//! Layer file header
//!
//! Fixed-size 4 KiB header at the start of every layer file, plus the
//! encoding of index trailer records. All integers little-endian.

use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::index::SegmentMapping;

/// Magic bytes identifying a stratabd layer file
pub const MAGIC: &[u8; 8] = b"STRATABD";

/// Current format version
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Header occupies the first 4 KiB; the data log starts right after
pub const HEADER_SIZE: u64 = 4096;

/// Size of one index trailer record
pub const RECORD_SIZE: u32 = 24;

// Flag bits
pub const FLAG_SEALED: u32 = 1 << 0;
pub const FLAG_SPARSE: u32 = 1 << 1;
pub const FLAG_ZFILE: u32 = 1 << 2;
pub const FLAG_CHECKSUM: u32 = 1 << 3;

/// Decoded layer file header
#[derive(Debug, Clone)]
pub struct Header {
    pub flags: u32,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    /// Logical size of the block device, in bytes
    pub virtual_size: u64,
    /// Start of the data log, in bytes from file start
    pub data_offset: u64,
    /// Start of the index trailer; 0 when no trailer has been persisted
    pub index_offset: u64,
    /// Number of records in the trailer
    pub index_count: u64,
    /// CRC32 of the trailer bytes, valid when FLAG_CHECKSUM is set
    pub index_crc: u32,
}

impl Header {
    pub fn new(virtual_size: u64, uuid: Uuid, parent_uuid: Uuid, flags: u32) -> Self {
        Header {
            flags,
            uuid,
            parent_uuid,
            virtual_size,
            data_offset: HEADER_SIZE,
            index_offset: 0,
            index_count: 0,
            index_crc: 0,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.flags & FLAG_SPARSE != 0
    }

    pub fn has_checksum(&self) -> bool {
        self.flags & FLAG_CHECKSUM != 0
    }

    /// Serialize into a 4 KiB block
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        buf[10..12].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..32].copy_from_slice(self.uuid.as_bytes());
        buf[32..48].copy_from_slice(self.parent_uuid.as_bytes());
        buf[48..56].copy_from_slice(&self.virtual_size.to_le_bytes());
        buf[56..64].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[72..80].copy_from_slice(&self.index_count.to_le_bytes());
        buf[80..84].copy_from_slice(&RECORD_SIZE.to_le_bytes());
        buf[84..88].copy_from_slice(&self.index_crc.to_le_bytes());
        buf
    }

    /// Parse and validate a header block
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(StrataError::corrupt("short header"));
        }
        if &buf[0..8] != MAGIC {
            return Err(StrataError::corrupt(format!(
                "bad magic: {:?}",
                &buf[0..8]
            )));
        }
        let major = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        if major != VERSION_MAJOR {
            return Err(StrataError::corrupt(format!(
                "unsupported version: {}",
                major
            )));
        }
        let flags = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let uuid = Uuid::from_slice(&buf[16..32]).map_err(|e| StrataError::corrupt(e.to_string()))?;
        let parent_uuid =
            Uuid::from_slice(&buf[32..48]).map_err(|e| StrataError::corrupt(e.to_string()))?;
        let virtual_size = u64::from_le_bytes(buf[48..56].try_into().unwrap());
        let data_offset = u64::from_le_bytes(buf[56..64].try_into().unwrap());
        let index_offset = u64::from_le_bytes(buf[64..72].try_into().unwrap());
        let index_count = u64::from_le_bytes(buf[72..80].try_into().unwrap());
        let record_size = u32::from_le_bytes(buf[80..84].try_into().unwrap());
        let index_crc = u32::from_le_bytes(buf[84..88].try_into().unwrap());

        if record_size != RECORD_SIZE {
            return Err(StrataError::corrupt(format!(
                "unexpected index record size: {}",
                record_size
            )));
        }
        if data_offset < HEADER_SIZE {
            return Err(StrataError::corrupt("data offset inside header"));
        }

        Ok(Header {
            flags,
            uuid,
            parent_uuid,
            virtual_size,
            data_offset,
            index_offset,
            index_count,
            index_crc,
        })
    }
}

// =============================================================================
// Index Trailer Records
// =============================================================================

/// Encode one mapping as a trailer record
pub fn encode_record(m: &SegmentMapping, out: &mut Vec<u8>) {
    out.extend_from_slice(&m.offset.to_le_bytes());
    out.extend_from_slice(&m.moffset.to_le_bytes());
    out.extend_from_slice(&m.length.to_le_bytes());
    out.push(m.zeroed as u8);
    out.push(m.tag);
    out.extend_from_slice(&[0u8; 2]);
}

/// Decode one trailer record
pub fn decode_record(buf: &[u8]) -> Result<SegmentMapping> {
    if buf.len() < RECORD_SIZE as usize {
        return Err(StrataError::corrupt("short index record"));
    }
    let offset = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let moffset = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let length = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    let zeroed = buf[20] != 0;
    let tag = buf[21];
    if length == 0 {
        return Err(StrataError::corrupt("zero-length index record"));
    }
    Ok(SegmentMapping {
        offset,
        length,
        moffset: if zeroed { 0 } else { moffset },
        zeroed,
        tag,
    })
}
