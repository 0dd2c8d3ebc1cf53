//! Self-describing entry header.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "GENT" (u32 LE 0x544E4547)
//!      4     1  codec id
//!      5     1  flags
//!      6     2  name_len (u16 LE)
//!      8     8  compressed_size (u64 LE)
//!     16     8  uncompressed_size (u64 LE)
//!     24    32  BLAKE3 of uncompressed content (zero when SEALED)
//!     56     n  name (UTF-8)
//!   56+n     4  header_crc32 over bytes 0..56+n
//! ```

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::codec::CodecId;

pub const ENTRY_MAGIC: u32 = 0x544E_4547;
pub const ENTRY_FIXED_SIZE: usize = 56;

/// Content integrity is provided by AEAD; no digest is recorded.
pub const FLAG_SEALED: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub codec:             CodecId,
    pub flags:             u8,
    pub name:              String,
    pub compressed_size:   u64,
    pub uncompressed_size: u64,
    pub digest:            [u8; 32],
}

/// Why a header could not be parsed.  The reader maps these onto
/// structural or security errors.
#[derive(Debug)]
pub enum HeaderFault {
    BadMagic(u32),
    NameTooLong(usize),
    NameNotUtf8,
    ChecksumMismatch,
    UnknownCodec(u8),
    Io(io::Error),
}

impl From<io::Error> for HeaderFault {
    fn from(e: io::Error) -> Self {
        HeaderFault::Io(e)
    }
}

impl EntryHeader {
    pub fn is_sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    /// Digest to verify after decompression, if one was recorded.
    pub fn expected_digest(&self) -> Option<[u8; 32]> {
        if self.is_sealed() { None } else { Some(self.digest) }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let name = self.name.as_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry name too long"))?;

        let mut buf = Vec::with_capacity(ENTRY_FIXED_SIZE + name.len() + 4);
        buf.write_u32::<LittleEndian>(ENTRY_MAGIC)?;
        buf.write_u8(self.codec.id())?;
        buf.write_u8(self.flags)?;
        buf.write_u16::<LittleEndian>(name_len)?;
        buf.write_u64::<LittleEndian>(self.compressed_size)?;
        buf.write_u64::<LittleEndian>(self.uncompressed_size)?;
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(name);
        let crc = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(crc)?;
        writer.write_all(&buf)
    }

    /// Parse a header.  `read_exact` is supplied by the caller so that
    /// header bytes are still counted against the archive size cap.
    pub fn read_with<F>(mut read_exact: F, max_name_len: usize) -> Result<Self, HeaderFault>
    where
        F: FnMut(&mut [u8]) -> io::Result<()>,
    {
        let mut fixed = [0u8; ENTRY_FIXED_SIZE];
        read_exact(&mut fixed)?;

        let magic = LittleEndian::read_u32(&fixed[0..4]);
        if magic != ENTRY_MAGIC {
            return Err(HeaderFault::BadMagic(magic));
        }
        let codec_id = fixed[4];
        let flags = fixed[5];
        let name_len = LittleEndian::read_u16(&fixed[6..8]) as usize;
        if name_len > max_name_len {
            return Err(HeaderFault::NameTooLong(name_len));
        }
        let compressed_size = LittleEndian::read_u64(&fixed[8..16]);
        let uncompressed_size = LittleEndian::read_u64(&fixed[16..24]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&fixed[24..56]);

        let mut name = vec![0u8; name_len];
        read_exact(&mut name)?;
        let mut crc_bytes = [0u8; 4];
        read_exact(&mut crc_bytes)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&fixed);
        hasher.update(&name);
        if hasher.finalize() != LittleEndian::read_u32(&crc_bytes) {
            return Err(HeaderFault::ChecksumMismatch);
        }

        let codec = CodecId::from_id(codec_id).ok_or(HeaderFault::UnknownCodec(codec_id))?;
        let name = String::from_utf8(name).map_err(|_| HeaderFault::NameNotUtf8)?;

        Ok(Self { codec, flags, name, compressed_size, uncompressed_size, digest })
    }

    /// Convenience for plain readers (tests, inspection tools).
    pub fn read<R: Read>(mut reader: R, max_name_len: usize) -> Result<Self, HeaderFault> {
        Self::read_with(|buf| reader.read_exact(buf), max_name_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntryHeader {
        EntryHeader {
            codec:             CodecId::Zstd,
            flags:             0,
            name:              "asset/a1.jpg".into(),
            compressed_size:   120,
            uncompressed_size: 4096,
            digest:            [9u8; 32],
        }
    }

    #[test]
    fn header_layout_is_stable() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        assert_eq!(buf.len(), ENTRY_FIXED_SIZE + "asset/a1.jpg".len() + 4);
        assert_eq!(&buf[..4], b"GENT");
        assert_eq!(EntryHeader::read(&buf[..], 255).unwrap(), sample());
    }

    #[test]
    fn flipped_size_byte_fails_checksum() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        buf[17] ^= 0x40;
        assert!(matches!(EntryHeader::read(&buf[..], 255), Err(HeaderFault::ChecksumMismatch)));
    }

    #[test]
    fn long_names_are_refused_before_reading_them() {
        let mut header = sample();
        header.name = "x".repeat(300);
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert!(matches!(EntryHeader::read(&buf[..], 255), Err(HeaderFault::NameTooLong(300))));
    }

    #[test]
    fn sealed_entries_skip_digest() {
        let mut header = sample();
        header.flags = FLAG_SEALED;
        assert_eq!(header.expected_digest(), None);
        assert_eq!(sample().expected_digest(), Some([9u8; 32]));
    }
}
