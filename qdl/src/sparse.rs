// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::borrow::Cow;

use tracing::warn;

use crate::error::{QdlError, Result};

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const FILE_HEADER_LEN: usize = 28;
pub const CHUNK_HEADER_LEN: usize = 12;

const SPARSE_MAJOR_VERSION: u16 = 1;

pub const CHUNK_TYPE_RAW: u16 = 0xCAC1;
pub const CHUNK_TYPE_FILL: u16 = 0xCAC2;
pub const CHUNK_TYPE_SKIP: u16 = 0xCAC3;
pub const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_size: u16,
    pub chunk_hdr_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

impl SparseHeader {
    /// Decode the 28-byte file header. `Ok(None)` means "not a sparse
    /// image"; a matching magic with a malformed remainder is an error.
    pub fn parse(buf: &[u8]) -> Result<Option<SparseHeader>> {
        if buf.len() < 4 || le32(buf, 0) != SPARSE_MAGIC {
            return Ok(None);
        }
        if buf.len() < FILE_HEADER_LEN {
            return Err(QdlError::Sparse(format!(
                "truncated file header ({} bytes)",
                buf.len()
            )));
        }

        let header = SparseHeader {
            magic: SPARSE_MAGIC,
            major_version: le16(buf, 4),
            minor_version: le16(buf, 6),
            file_hdr_size: le16(buf, 8),
            chunk_hdr_size: le16(buf, 10),
            block_size: le32(buf, 12),
            total_blocks: le32(buf, 16),
            total_chunks: le32(buf, 20),
            image_checksum: le32(buf, 24),
        };

        if header.major_version != SPARSE_MAJOR_VERSION {
            return Err(QdlError::Sparse(format!(
                "unsupported major version {}",
                header.major_version
            )));
        }
        if (header.file_hdr_size as usize) < FILE_HEADER_LEN
            || (header.chunk_hdr_size as usize) < CHUNK_HEADER_LEN
        {
            return Err(QdlError::Sparse(format!(
                "implausible header sizes ({}/{})",
                header.file_hdr_size, header.chunk_hdr_size
            )));
        }
        if header.block_size == 0 || header.block_size % 4 != 0 {
            return Err(QdlError::Sparse(format!(
                "block size {} isn't a positive multiple of 4",
                header.block_size
            )));
        }

        Ok(Some(header))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SparseChunk<'a> {
    pub chunk_type: u16,
    /// Output length in blocks
    pub blocks: u32,
    /// On-disk length including the chunk header
    pub total_bytes: u32,
    pub payload: &'a [u8],
}

/// An Android sparse image over a borrowed blob.
#[derive(Debug, Clone, Copy)]
pub struct Sparse<'a> {
    pub header: SparseHeader,
    data: &'a [u8],
}

impl<'a> Sparse<'a> {
    pub fn from(blob: &'a [u8]) -> Result<Option<Sparse<'a>>> {
        match SparseHeader::parse(blob)? {
            Some(header) => Ok(Some(Sparse { header, data: blob })),
            None => Ok(None),
        }
    }

    /// Size of the fully expanded image in bytes.
    pub fn expanded_size(&self) -> u64 {
        self.header.total_blocks as u64 * self.header.block_size as u64
    }

    /// Walk the chunk records in file order.
    pub fn chunks(&self) -> Chunks<'a> {
        Chunks {
            header: self.header,
            data: self.data,
            pos: self.header.file_hdr_size as usize,
            index: 0,
            done: false,
        }
    }

    /// Expand into `(offset, data-or-hole, size)` segments. Offsets are
    /// cumulative and block-aligned; holes cover Skip chunks and
    /// zero-pattern Fill chunks.
    pub fn read(&self) -> Segments<'a> {
        Segments {
            chunks: self.chunks(),
            block_size: self.header.block_size as u64,
            offset: 0,
        }
    }
}

pub struct Chunks<'a> {
    header: SparseHeader,
    data: &'a [u8],
    pos: usize,
    index: u32,
    done: bool,
}

impl<'a> Chunks<'a> {
    fn parse_next(&mut self) -> Result<Option<SparseChunk<'a>>> {
        if self.index == self.header.total_chunks {
            if self.pos < self.data.len() {
                warn!(
                    "{} trailing bytes after the last sparse chunk",
                    self.data.len() - self.pos
                );
            }
            return Ok(None);
        }

        let hdr_len = self.header.chunk_hdr_size as usize;
        if self.pos + hdr_len > self.data.len() {
            return Err(QdlError::Sparse(format!(
                "chunk {} header extends past the end of the image",
                self.index
            )));
        }

        let chunk_type = le16(self.data, self.pos);
        let blocks = le32(self.data, self.pos + 4);
        let total_bytes = le32(self.data, self.pos + 8);

        if (total_bytes as usize) < hdr_len || self.pos + total_bytes as usize > self.data.len() {
            return Err(QdlError::Sparse(format!(
                "chunk {} claims {total_bytes} bytes, which don't fit the image",
                self.index
            )));
        }

        let payload = &self.data[self.pos + hdr_len..self.pos + total_bytes as usize];
        let out_bytes = blocks as u64 * self.header.block_size as u64;

        match chunk_type {
            CHUNK_TYPE_RAW => {
                if payload.len() as u64 != out_bytes {
                    return Err(QdlError::Sparse(format!(
                        "raw chunk {} carries {} bytes, expected {out_bytes}",
                        self.index,
                        payload.len()
                    )));
                }
            }
            CHUNK_TYPE_FILL | CHUNK_TYPE_CRC32 => {
                if payload.len() != 4 {
                    return Err(QdlError::Sparse(format!(
                        "chunk {} carries {} payload bytes, expected 4",
                        self.index,
                        payload.len()
                    )));
                }
            }
            CHUNK_TYPE_SKIP => {
                if !payload.is_empty() {
                    return Err(QdlError::Sparse(format!(
                        "skip chunk {} carries {} payload bytes",
                        self.index,
                        payload.len()
                    )));
                }
            }
            t => {
                return Err(QdlError::Sparse(format!(
                    "unknown chunk type {t:#06x} at index {}",
                    self.index
                )));
            }
        }

        self.pos += total_bytes as usize;
        self.index += 1;

        Ok(Some(SparseChunk {
            chunk_type,
            blocks,
            total_bytes,
            payload,
        }))
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<SparseChunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.parse_next() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseSegment<'a> {
    pub offset: u64,
    /// `None` is a hole the flasher may skip over
    pub data: Option<Cow<'a, [u8]>>,
    pub size: usize,
}

pub struct Segments<'a> {
    chunks: Chunks<'a>,
    block_size: u64,
    offset: u64,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<SparseSegment<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = match self.chunks.next()? {
                Ok(c) => c,
                Err(e) => return Some(Err(e)),
            };

            let size = (chunk.blocks as u64 * self.block_size) as usize;
            let offset = self.offset;

            match chunk.chunk_type {
                CHUNK_TYPE_RAW => {
                    self.offset += size as u64;
                    return Some(Ok(SparseSegment {
                        offset,
                        data: Some(Cow::Borrowed(chunk.payload)),
                        size,
                    }));
                }
                CHUNK_TYPE_FILL => {
                    self.offset += size as u64;
                    if chunk.payload == [0, 0, 0, 0] {
                        // A zeroed fill is indistinguishable from a hole
                        return Some(Ok(SparseSegment {
                            offset,
                            data: None,
                            size,
                        }));
                    }

                    let mut out = Vec::with_capacity(size);
                    while out.len() < size {
                        out.extend_from_slice(chunk.payload);
                    }
                    out.truncate(size);
                    return Some(Ok(SparseSegment {
                        offset,
                        data: Some(Cow::Owned(out)),
                        size,
                    }));
                }
                CHUNK_TYPE_SKIP => {
                    self.offset += size as u64;
                    return Some(Ok(SparseSegment {
                        offset,
                        data: None,
                        size,
                    }));
                }
                // Advisory only, contributes no output
                CHUNK_TYPE_CRC32 => continue,
                t => return Some(Err(QdlError::Sparse(format!("unknown chunk type {t:#06x}")))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 4096;

    fn file_header(total_blocks: u32, total_chunks: u32) -> Vec<u8> {
        let mut buf = vec![];
        buf.extend(SPARSE_MAGIC.to_le_bytes());
        buf.extend(1u16.to_le_bytes());
        buf.extend(0u16.to_le_bytes());
        buf.extend(28u16.to_le_bytes());
        buf.extend(12u16.to_le_bytes());
        buf.extend((BLOCK as u32).to_le_bytes());
        buf.extend(total_blocks.to_le_bytes());
        buf.extend(total_chunks.to_le_bytes());
        buf.extend(0u32.to_le_bytes());
        buf
    }

    fn chunk(chunk_type: u16, blocks: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![];
        buf.extend(chunk_type.to_le_bytes());
        buf.extend(0u16.to_le_bytes());
        buf.extend(blocks.to_le_bytes());
        buf.extend(((CHUNK_HEADER_LEN + payload.len()) as u32).to_le_bytes());
        buf.extend(payload);
        buf
    }

    /// 9 blocks across 6 chunks: raw, fill, skip, zero-fill, raw, crc32.
    fn fixture() -> (Vec<u8>, Vec<u8>) {
        let raw_a: Vec<u8> = (0..2 * BLOCK).map(|i| (i % 251) as u8).collect();
        let raw_b: Vec<u8> = (0..BLOCK).map(|i| (i % 13) as u8).collect();

        let mut img = file_header(9, 6);
        img.extend(chunk(CHUNK_TYPE_RAW, 2, &raw_a));
        img.extend(chunk(CHUNK_TYPE_FILL, 2, &[0xAA, 0xBB, 0xCC, 0xDD]));
        img.extend(chunk(CHUNK_TYPE_SKIP, 2, &[]));
        img.extend(chunk(CHUNK_TYPE_FILL, 2, &[0, 0, 0, 0]));
        img.extend(chunk(CHUNK_TYPE_RAW, 1, &raw_b));
        img.extend(chunk(CHUNK_TYPE_CRC32, 0, &[0x12, 0x34, 0x56, 0x78]));

        let mut expanded = raw_a;
        for _ in 0..2 * BLOCK / 4 {
            expanded.extend([0xAA, 0xBB, 0xCC, 0xDD]);
        }
        expanded.extend(vec![0u8; 4 * BLOCK]);
        expanded.extend(raw_b);

        (img, expanded)
    }

    #[test]
    fn header_fields() {
        let (img, _) = fixture();
        let header = SparseHeader::parse(&img).unwrap().unwrap();
        assert_eq!(header.magic, 0xED26FF3A);
        assert_eq!(header.total_blocks, 9);
        assert_eq!(header.total_chunks, 6);
        assert_eq!(header.block_size, 4096);
        assert_eq!(header.file_hdr_size, 28);
        assert_eq!(header.chunk_hdr_size, 12);
    }

    #[test]
    fn non_sparse_blob_is_none() {
        assert!(Sparse::from(&[0u8; 64]).unwrap().is_none());
        assert!(Sparse::from(b"ab").unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let img = file_header(9, 6);
        assert!(SparseHeader::parse(&img[..16]).is_err());
    }

    #[test]
    fn expansion_matches_reference() {
        let (img, expanded) = fixture();
        let sparse = Sparse::from(&img).unwrap().unwrap();
        assert_eq!(sparse.expanded_size(), 9 * 4096);

        let mut out = vec![];
        for seg in sparse.read() {
            let seg = seg.unwrap();
            assert_eq!(out.len() as u64, seg.offset);
            match seg.data {
                Some(data) => {
                    assert_eq!(data.len(), seg.size);
                    out.extend_from_slice(&data);
                }
                None => out.extend(vec![0u8; seg.size]),
            }
        }

        assert_eq!(out.len(), 36864);
        assert_eq!(out, expanded);
    }

    #[test]
    fn offsets_are_contiguous_and_block_aligned() {
        let (img, _) = fixture();
        let sparse = Sparse::from(&img).unwrap().unwrap();

        let mut expected = 0u64;
        for seg in sparse.read() {
            let seg = seg.unwrap();
            assert_eq!(seg.offset, expected);
            assert_eq!(seg.offset % 4096, 0);
            expected = seg.offset + seg.size as u64;
        }
        assert_eq!(expected, 9 * 4096);
    }

    #[test]
    fn zero_fill_is_a_hole() {
        let (img, _) = fixture();
        let sparse = Sparse::from(&img).unwrap().unwrap();
        let segs: Vec<_> = sparse.read().map(|s| s.unwrap()).collect();

        // raw, fill, skip-hole, zero-fill-hole, raw; crc32 emits nothing
        assert_eq!(segs.len(), 5);
        assert!(segs[1].data.is_some());
        assert!(segs[2].data.is_none());
        assert!(segs[3].data.is_none());
    }

    #[test]
    fn oversized_chunk_is_an_error() {
        let mut img = file_header(2, 1);
        let mut bad = chunk(CHUNK_TYPE_RAW, 2, &vec![0xFFu8; 2 * BLOCK]);
        bad.truncate(bad.len() - 100);
        img.extend(bad);

        let sparse = Sparse::from(&img).unwrap().unwrap();
        assert!(sparse.read().any(|s| s.is_err()));
    }

    #[test]
    fn unknown_chunk_type_is_an_error() {
        let mut img = file_header(1, 1);
        img.extend(chunk(0xCAFE, 1, &[]));

        let sparse = Sparse::from(&img).unwrap().unwrap();
        assert!(sparse.chunks().next().unwrap().is_err());
    }
}
