//! Fixed 32-byte archive header.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "GEOD"
//!      4     2  format_version (u16 LE)
//!      6     2  flags (u16 LE, reserved, must be 0)
//!      8    16  archive_uuid
//!     24     4  entry_count (u32 LE)
//!     28     4  header_crc32 over bytes 0..28
//! ```

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Write};
use thiserror::Error;
use uuid::Uuid;

pub const MAGIC: &[u8; 4] = b"GEOD";
pub const FORMAT_VERSION: u16 = 1;
pub const SUPERBLOCK_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum SuperblockError {
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported container format version: {0}")]
    UnsupportedVersion(u16),
    #[error("Superblock checksum mismatch")]
    ChecksumMismatch,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub format_version: u16,
    pub flags:          u16,
    pub archive_uuid:   Uuid,
    pub entry_count:    u32,
}

impl Superblock {
    pub fn new(entry_count: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            flags:          0,
            archive_uuid:   Uuid::new_v4(),
            entry_count,
        }
    }

    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf[..4].copy_from_slice(MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], self.format_version);
        LittleEndian::write_u16(&mut buf[6..8], self.flags);
        buf[8..24].copy_from_slice(self.archive_uuid.as_bytes());
        LittleEndian::write_u32(&mut buf[24..28], self.entry_count);
        let crc = crc32fast::hash(&buf[..28]);
        LittleEndian::write_u32(&mut buf[28..], crc);
        buf
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    pub fn from_bytes(buf: &[u8; SUPERBLOCK_SIZE]) -> Result<Self, SuperblockError> {
        if &buf[..4] != MAGIC {
            return Err(SuperblockError::InvalidMagic);
        }
        let stored_crc = LittleEndian::read_u32(&buf[28..]);
        if crc32fast::hash(&buf[..28]) != stored_crc {
            return Err(SuperblockError::ChecksumMismatch);
        }
        let mut r = Cursor::new(&buf[4..28]);
        let format_version = r.read_u16::<LittleEndian>()?;
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }
        let flags = r.read_u16::<LittleEndian>()?;
        let mut uuid_bytes = [0u8; 16];
        io::Read::read_exact(&mut r, &mut uuid_bytes)?;
        let entry_count = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            format_version,
            flags,
            archive_uuid: Uuid::from_bytes(uuid_bytes),
            entry_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_survives_serialization() {
        let sb = Superblock::new(7);
        let bytes = sb.to_bytes();
        assert_eq!(Superblock::from_bytes(&bytes).unwrap(), sb);
    }

    #[test]
    fn detects_corruption() {
        let mut bytes = Superblock::new(3).to_bytes();
        bytes[25] ^= 0xFF;
        assert!(matches!(Superblock::from_bytes(&bytes), Err(SuperblockError::ChecksumMismatch)));
    }

    #[test]
    fn rejects_foreign_magic() {
        let mut bytes = Superblock::new(3).to_bytes();
        bytes[..4].copy_from_slice(b"GZIP");
        assert!(matches!(Superblock::from_bytes(&bytes), Err(SuperblockError::InvalidMagic)));
    }
}
