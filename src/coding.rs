// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed-width little-endian coding used by every on-disk record in this crate.
//!
//! Every record format in the spec is a byte-exact, fixed-width layout (no varints), so
//! `Encode`/`Decode` here just wrap `byteorder`'s little-endian read/write calls.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Trait to serialize a fixed-layout record.
pub trait Encode {
    /// Serializes into a writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;

    /// Serializes into a freshly allocated vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("writing into a Vec cannot fail");
        v
    }
}

/// Trait to deserialize a fixed-layout record.
pub trait Decode {
    /// Deserializes from a reader.
    fn decode_from<R: Read>(reader: &mut R) -> crate::Result<Self>
    where
        Self: Sized;
}

pub(crate) fn write_u64<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    writer.write_u64::<LittleEndian>(value)
}

pub(crate) fn read_u64<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    reader.read_u64::<LittleEndian>()
}

pub(crate) fn write_u32<W: Write>(writer: &mut W, value: u32) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(value)
}

pub(crate) fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    reader.read_u32::<LittleEndian>()
}

pub(crate) fn write_u16<W: Write>(writer: &mut W, value: u16) -> std::io::Result<()> {
    writer.write_u16::<LittleEndian>(value)
}

pub(crate) fn read_u16<R: Read>(reader: &mut R) -> std::io::Result<u16> {
    reader.read_u16::<LittleEndian>()
}

pub(crate) fn write_u8<W: Write>(writer: &mut W, value: u8) -> std::io::Result<()> {
    writer.write_u8(value)
}

pub(crate) fn read_u8<R: Read>(reader: &mut R) -> std::io::Result<u8> {
    reader.read_u8()
}
