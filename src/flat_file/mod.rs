// Copyright (c) 2024-present, the perobs-core authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The payload store: a sequential file of self-describing, CRC-protected records (see
//! §3/§4.2 of the design). Each record is either a valid `(id, bytes)` blob or a free
//! region left behind by a delete, ready for exact-fit reuse through the `SpaceManager`.

mod header;

use crate::checksum::crc32;
use crate::coding::{Decode, Encode};
use crate::error::{Error, Result};
use crate::space_manager::SpaceManager;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use header::{BlobHeader, FLAG_COMPRESSED, FLAG_MARKED, FLAG_VALID, HEADER_LEN};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One record surfaced by a sequential scan.
#[derive(Debug, Clone, Copy)]
pub enum ScanEntry {
    /// A live `(id, bytes)` record.
    Valid { offset: u64, id: u64, marked: bool },
    /// A free region available for exact-fit reuse.
    Free { offset: u64, length: u64 },
}

pub struct FlatFile {
    file: File,
    path: PathBuf,
}

impl FlatFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { file, path })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_header_at(&mut self, offset: u64) -> Result<BlobHeader> {
        self.file.seek(SeekFrom::Start(offset))?;
        BlobHeader::decode_from(&mut self.file)
    }

    fn write_header_at(&mut self, offset: u64, header: &BlobHeader) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        header.encode_into(&mut self.file)?;
        Ok(())
    }

    /// Writes `bytes` under `id`, reusing an exact-fit free region from `space_manager` if
    /// one exists for the (post-compression) on-disk payload length, otherwise appending at
    /// the file tail. Returns the byte offset of the new record's header.
    pub fn write(
        &mut self,
        space_manager: &mut SpaceManager,
        id: u64,
        bytes: &[u8],
        compress: bool,
    ) -> Result<u64> {
        let payload = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(bytes)?;
            encoder.finish()?
        } else {
            bytes.to_vec()
        };

        let on_disk_len = payload.len() as u64;

        let offset = match space_manager.get_space(on_disk_len)? {
            Some((offset, _)) => offset,
            None => self.len()?,
        };

        let flags = FLAG_VALID | if compress { FLAG_COMPRESSED } else { 0 };
        let header = BlobHeader {
            flags,
            length: on_disk_len,
            id,
            payload_crc: crc32(&payload),
        };

        self.file.seek(SeekFrom::Start(offset))?;
        header.encode_into(&mut self.file)?;
        self.file.write_all(&payload)?;
        self.file.flush()?;
        self.file.sync_data()?;

        Ok(offset)
    }

    /// Reads the record at `offset`, requiring its header to carry `id`.
    pub fn read(&mut self, id: u64, offset: u64) -> Result<Vec<u8>> {
        let header = self.read_header_at(offset)?;
        if !header.is_valid() || header.id != id {
            return Err(Error::NotFound);
        }

        let mut payload = vec![0u8; header.length as usize];
        self.file.read_exact(&mut payload)?;

        let got = crc32(&payload);
        if got != header.payload_crc {
            return Err(Error::ChecksumMismatch {
                expected: header.payload_crc,
                got,
            });
        }

        if header.is_compressed() {
            let mut decoder = ZlibDecoder::new(payload.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        } else {
            Ok(payload)
        }
    }

    /// Clears the valid flag on the record at `offset`, turning it into a free region.
    /// Returns the region's on-disk length, to be handed to a `SpaceManager`.
    pub fn delete(&mut self, offset: u64) -> Result<u64> {
        let header = self.read_header_at(offset)?;
        if !header.is_valid() {
            return Err(Error::Corruption(format!(
                "{:?}: record at offset {offset} is not valid",
                self.path
            )));
        }

        let free_header = BlobHeader::free(header.length);
        self.write_header_at(offset, &free_header)?;
        self.file.flush()?;
        self.file.sync_data()?;

        Ok(header.length)
    }

    /// Sets the mark bit on the record at `offset`.
    pub fn mark(&mut self, offset: u64) -> Result<()> {
        let mut header = self.read_header_at(offset)?;
        if !header.is_valid() {
            return Err(Error::Corruption(format!(
                "{:?}: record at offset {offset} is not valid",
                self.path
            )));
        }
        header.flags |= FLAG_MARKED;
        self.write_header_at(offset, &header)
    }

    /// Reports whether the record at `offset` is currently marked.
    pub fn is_marked(&mut self, offset: u64) -> Result<bool> {
        Ok(self.read_header_at(offset)?.is_marked())
    }

    /// Clears the mark bit on every valid record via a sequential scan.
    pub fn clear_all_marks(&mut self) -> Result<()> {
        let len = self.len()?;
        let mut pos = 0u64;

        while pos < len {
            let mut header = self.read_header_at(pos)?;
            if header.is_valid() && header.is_marked() {
                header.flags &= !FLAG_MARKED;
                self.write_header_at(pos, &header)?;
            }
            pos += HEADER_LEN + header.length;
        }

        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Walks every record from the start of the file in order, aborting (with
    /// `Error::ChecksumMismatch`) at the first corrupted header.
    pub fn scan<F: FnMut(ScanEntry) -> Result<()>>(&mut self, mut f: F) -> Result<()> {
        let len = self.len()?;
        let mut pos = 0u64;

        while pos < len {
            let header = self.read_header_at(pos)?;
            let entry = if header.is_valid() {
                ScanEntry::Valid {
                    offset: pos,
                    id: header.id,
                    marked: header.is_marked(),
                }
            } else {
                ScanEntry::Free {
                    offset: pos,
                    length: header.length,
                }
            };
            f(entry)?;
            pos += HEADER_LEN + header.length;
        }

        Ok(())
    }

    /// Like [`scan`](Self::scan), but on a corrupted header it skips forward byte-by-byte
    /// until it can resynchronize on a header whose CRC checks out, logging the skipped
    /// range instead of aborting. Returns the number of bytes skipped.
    pub fn scan_recover<F: FnMut(ScanEntry) -> Result<()>>(&mut self, mut f: F) -> Result<u64> {
        let len = self.len()?;
        let mut pos = 0u64;
        let mut skipped = 0u64;
        let mut resync_start: Option<u64> = None;

        while pos < len {
            match self.read_header_at(pos) {
                Ok(header) if pos + HEADER_LEN + header.length <= len => {
                    if let Some(start) = resync_start.take() {
                        log::warn!(
                            "{:?}: skipped corrupted range [{start}, {pos}) while recovering",
                            self.path
                        );
                    }

                    let entry = if header.is_valid() {
                        ScanEntry::Valid {
                            offset: pos,
                            id: header.id,
                            marked: header.is_marked(),
                        }
                    } else {
                        ScanEntry::Free {
                            offset: pos,
                            length: header.length,
                        }
                    };
                    f(entry)?;
                    pos += HEADER_LEN + header.length;
                }
                _ => {
                    resync_start.get_or_insert(pos);
                    pos += 1;
                    skipped += 1;
                }
            }
        }

        if let Some(start) = resync_start {
            log::warn!(
                "{:?}: skipped corrupted range [{start}, {len}) while recovering",
                self.path
            );
        }

        Ok(skipped)
    }

    /// Compacts the file in place: every valid record slides down over any preceding
    /// deleted space, `relocated` is invoked for every record that actually moved, and the
    /// file is truncated to the size of its live data. No free regions remain afterwards.
    pub fn defragment<F: FnMut(u64, u64, u64) -> Result<()>>(
        &mut self,
        mut relocated: F,
    ) -> Result<()> {
        let len = self.len()?;
        let mut read_pos = 0u64;
        let mut write_pos = 0u64;

        while read_pos < len {
            let header = self.read_header_at(read_pos)?;
            let record_len = HEADER_LEN + header.length;

            if header.is_valid() {
                if write_pos != read_pos {
                    self.file.seek(SeekFrom::Start(read_pos))?;
                    let mut buf = vec![0u8; record_len as usize];
                    self.file.read_exact(&mut buf)?;
                    self.file.seek(SeekFrom::Start(write_pos))?;
                    self.file.write_all(&buf)?;
                    relocated(header.id, read_pos, write_pos)?;
                }
                write_pos += record_len;
            }

            read_pos += record_len;
        }

        self.file.set_len(write_pos)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
