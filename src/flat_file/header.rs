// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The 25-byte record header every `FlatFile` entry begins with.

use crate::checksum::crc32;
use crate::coding::{read_u32, read_u64, read_u8, write_u32, write_u64, write_u8, Decode, Encode};
use crate::error::Error;
use std::io::{Read, Write};

pub(super) const HEADER_LEN: u64 = 25;

pub(super) const FLAG_VALID: u8 = 1 << 0;
pub(super) const FLAG_MARKED: u8 = 1 << 1;
pub(super) const FLAG_COMPRESSED: u8 = 1 << 2;

/// A blob record header: either a valid/marked/compressed record, or (when `FLAG_VALID` is
/// clear) a free region of `length` bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) struct BlobHeader {
    pub flags: u8,
    pub length: u64,
    pub id: u64,
    pub payload_crc: u32,
}

impl BlobHeader {
    pub fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    pub fn is_marked(&self) -> bool {
        self.flags & FLAG_MARKED != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn free(length: u64) -> Self {
        Self {
            flags: 0,
            length,
            id: 0,
            payload_crc: 0,
        }
    }

    /// CRC over the first 21 bytes of the encoded header (everything but the header CRC
    /// itself).
    fn header_crc(&self) -> u32 {
        let mut buf = Vec::with_capacity(21);
        buf.push(self.flags);
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.payload_crc.to_le_bytes());
        crc32(&buf)
    }
}

impl Encode for BlobHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        write_u8(writer, self.flags)?;
        write_u64(writer, self.length)?;
        write_u64(writer, self.id)?;
        write_u32(writer, self.payload_crc)?;
        write_u32(writer, self.header_crc())?;
        Ok(())
    }
}

impl Decode for BlobHeader {
    fn decode_from<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let flags = read_u8(reader)?;
        let length = read_u64(reader)?;
        let id = read_u64(reader)?;
        let payload_crc = read_u32(reader)?;
        let stored_header_crc = read_u32(reader)?;

        let header = Self {
            flags,
            length,
            id,
            payload_crc,
        };

        let expected = header.header_crc();
        if expected != stored_header_crc {
            return Err(Error::ChecksumMismatch {
                expected,
                got: stored_header_crc,
            });
        }

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let header = BlobHeader {
            flags: FLAG_VALID | FLAG_MARKED,
            length: 42,
            id: 7,
            payload_crc: 0xDEAD_BEEF,
        };

        let mut buf = Vec::new();
        header.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN as usize);

        let decoded = BlobHeader::decode_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn detects_corrupted_header() {
        let header = BlobHeader::free(10);
        let mut buf = Vec::new();
        header.encode_into(&mut buf).unwrap();
        buf[0] ^= 0xFF;

        let err = BlobHeader::decode_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }
}
