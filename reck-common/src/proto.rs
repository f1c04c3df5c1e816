//! Checkpoint file blocks.
//!
//! A checkpoint is the 4-byte [`MAGIC`] followed by `entry, payload` pairs.
//! Entries and region records use bincode with fixed-width integers, so every
//! entry and every record has the same encoded size.

use std::fmt;

use bincode::{config::Config, Decode, Encode};
use serde::Serialize;

use crate::{
    error::Result,
    maps::{MemoryRegion, Protection, Sharing, PATHNAME_CAPACITY},
};

pub const MAGIC: [u8; 4] = *b"RECK";

pub fn config() -> impl Config {
    bincode::config::standard().with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize)]
pub enum BlockKind {
    Regs,
    FpRegs,
    MemoryMap,
    /// Where a vdso or vvar region sat; a region record without content
    VdsoMap,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regs => write!(f, "REGS"),
            Self::FpRegs => write!(f, "FPREGS"),
            Self::MemoryMap => write!(f, "MEMORY_MAP"),
            Self::VdsoMap => write!(f, "VDSO_MAP"),
        }
    }
}

/// Index entry preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize)]
pub struct BlockEntry {
    pub kind: BlockKind,
    /// File position of the payload (not of this entry)
    pub offset: u64,
    /// Payload length in bytes
    pub size: u64,
}

impl BlockEntry {
    pub fn encoded_len() -> Result<usize> {
        let sample = BlockEntry {
            kind: BlockKind::Regs,
            offset: 0,
            size: 0,
        };
        Ok(bincode::encode_to_vec(sample, config())?.len())
    }

    /// File position just past the payload, `None` if it does not fit in a u64.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

impl fmt::Display for BlockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} offset: {} size: {}", self.kind, self.offset, self.size)
    }
}

/// Fixed-size serialized form of a [`MemoryRegion`].
#[derive(Clone, PartialEq, Eq, Encode, Decode)]
pub struct RegionRecord {
    pub start: u64,
    pub end: u64,
    pub prot: i32,
    pub flags: i32,
    pub offset: u64,
    pub device_major: u32,
    pub device_minor: u32,
    pub inode: u64,
    /// NUL-padded
    pub pathname: [u8; PATHNAME_CAPACITY],
}

impl RegionRecord {
    pub fn encoded_len() -> Result<usize> {
        let sample = RegionRecord::from(&MemoryRegion::default());
        Ok(bincode::encode_to_vec(sample, config())?.len())
    }
}

impl From<&MemoryRegion> for RegionRecord {
    fn from(region: &MemoryRegion) -> Self {
        let mut pathname = [0u8; PATHNAME_CAPACITY];
        let bytes = region.pathname.as_bytes();
        let len = bytes.len().min(PATHNAME_CAPACITY - 1);
        pathname[..len].copy_from_slice(&bytes[..len]);

        Self {
            start: region.start,
            end: region.end,
            prot: region.prot.bits(),
            flags: Sharing::bits(region.sharing),
            offset: region.offset,
            device_major: region.device.0,
            device_minor: region.device.1,
            inode: region.inode,
            pathname,
        }
    }
}

impl From<&RegionRecord> for MemoryRegion {
    fn from(record: &RegionRecord) -> Self {
        let len = record
            .pathname
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(PATHNAME_CAPACITY);

        Self {
            start: record.start,
            end: record.end,
            prot: Protection::from_bits(record.prot),
            sharing: Sharing::from_bits(record.flags),
            offset: record.offset,
            device: (record.device_major, record.device_minor),
            inode: record.inode,
            pathname: String::from_utf8_lossy(&record.pathname[..len]).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::parse_line;

    #[test]
    fn test_entry_encoding_is_fixed_width() {
        let len = BlockEntry::encoded_len().unwrap();
        let big = BlockEntry {
            kind: BlockKind::MemoryMap,
            offset: u64::MAX,
            size: u64::MAX,
        };
        assert_eq!(bincode::encode_to_vec(big, config()).unwrap().len(), len);
        assert_eq!(len, 4 + 8 + 8);
    }

    #[test]
    fn test_record_encoding_is_fixed_width() {
        let len = RegionRecord::encoded_len().unwrap();
        assert!(len >= PATHNAME_CAPACITY);

        let region = parse_line("7f0000000000-7f0000001000 rw-p 00000000 08:01 1234 /lib/test.so");
        let record = RegionRecord::from(&region);
        let buf = bincode::encode_to_vec(record, config()).unwrap();
        assert_eq!(buf.len(), len);

        let (decoded, read): (RegionRecord, usize) = bincode::decode_from_slice(&buf, config()).unwrap();
        assert_eq!(read, len);
        assert_eq!(MemoryRegion::from(&decoded), region);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut buf = bincode::encode_to_vec(
            BlockEntry {
                kind: BlockKind::Regs,
                offset: 24,
                size: 8,
            },
            config(),
        )
        .unwrap();
        buf[0] = 7;

        assert!(bincode::decode_from_slice::<BlockEntry, _>(&buf, config()).is_err());
    }

    #[test]
    fn test_display() {
        let entry = BlockEntry {
            kind: BlockKind::FpRegs,
            offset: 260,
            size: 512,
        };
        assert_eq!(entry.to_string(), "FPREGS offset: 260 size: 512");
        assert_eq!(entry.end(), Some(772));
    }

    #[test]
    fn test_end_does_not_wrap() {
        let entry = BlockEntry {
            kind: BlockKind::Regs,
            offset: 24,
            size: u64::MAX - 10,
        };
        assert_eq!(entry.end(), None);
    }
}
