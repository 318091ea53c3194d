//! xbstream chunk layout.
//!
//! Every chunk starts with a fixed 14-byte prefix followed by the path:
//!
//! ```text
//! MAGIC(8) | FLAGS(1) | TYPE(1) | PATHLEN(4) | PATH(PATHLEN)
//! ```
//!
//! `EOF` chunks end there.  `PAYLOAD` and `SPARSE` chunks continue with
//!
//! ```text
//! [MAP_COUNT(4) if SPARSE] | LEN(8) | OFFSET(8) | CRC32(4)
//! [MAP_COUNT × (SKIP(4), LEN(4))] | PAYLOAD(LEN)
//! ```
//!
//! All integers are big-endian.  The CRC32 covers the raw sparse-map bytes
//! followed by the payload.

use byteorder::{BigEndian, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{self, Write};

pub const CHUNK_MAGIC: &[u8; 8] = b"XBSTCK01";

/// Magic + flags + type + path length.
pub const CHUNK_HEADER_CONSTANT_LEN: usize = 8 + 1 + 1 + 4;

/// Paths of this many bytes or more are rejected on both ends.
pub const MAX_PATH_LEN: usize = 512;

/// Readers may skip a chunk of unknown type only when this bit is set.
pub const FLAG_IGNORABLE: u8 = 0x01;

/// Size of one encoded `(skip, len)` sparse-map pair.
pub const SPARSE_ENTRY_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Payload,
    Sparse,
    Eof,
    Unknown(u8),
}

impl ChunkType {
    pub fn code(self) -> u8 {
        match self {
            ChunkType::Payload    => b'P',
            ChunkType::Sparse     => b'S',
            ChunkType::Eof        => b'E',
            ChunkType::Unknown(c) => c,
        }
    }

    pub fn carries_payload(self) -> bool {
        matches!(self, ChunkType::Payload | ChunkType::Sparse)
    }
}

impl From<u8> for ChunkType {
    fn from(code: u8) -> Self {
        match code {
            b'P' => ChunkType::Payload,
            b'S' => ChunkType::Sparse,
            b'E' => ChunkType::Eof,
            c    => ChunkType::Unknown(c),
        }
    }
}

/// One run of a sparse region: advance by `skip` bytes of hole, then `len`
/// bytes of data taken from the chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SparseChunk {
    pub skip: u32,
    pub len:  u32,
}

impl SparseChunk {
    pub fn new(skip: u32, len: u32) -> Self {
        Self { skip, len }
    }
}

/// Total bytes a sparse map advances the destination file by, holes included.
pub fn sparse_extent(map: &[SparseChunk]) -> u64 {
    map.iter().map(|c| c.skip as u64 + c.len as u64).sum()
}

/// Sum of all `skip` fields in a sparse map.
pub fn sparse_skipped(map: &[SparseChunk]) -> u64 {
    map.iter().map(|c| c.skip as u64).sum()
}

/// Header of a data-carrying chunk.  The payload is written separately so
/// large buffers never need to be copied into the header scratch space.
#[derive(Debug, Clone)]
pub struct ChunkHeader<'a> {
    pub flags:      u8,
    pub chunk_type: ChunkType,
    pub path:       &'a str,
    pub length:     u64,
    pub offset:     u64,
    pub checksum:   u32,
    pub sparse_map: &'a [SparseChunk],
}

impl<'a> ChunkHeader<'a> {
    /// Build a PAYLOAD header with the checksum of `data`.
    pub fn payload(path: &'a str, offset: u64, data: &[u8]) -> Self {
        Self {
            flags:      0,
            chunk_type: ChunkType::Payload,
            path,
            length:     data.len() as u64,
            offset,
            checksum:   chunk_checksum(&[], data),
            sparse_map: &[],
        }
    }

    /// Build a SPARSE header; the checksum covers the encoded map then `data`.
    pub fn sparse(path: &'a str, offset: u64, map: &'a [SparseChunk], data: &[u8]) -> Self {
        Self {
            flags:      0,
            chunk_type: ChunkType::Sparse,
            path,
            length:     data.len() as u64,
            offset,
            checksum:   chunk_checksum(map, data),
            sparse_map: map,
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        write_prefix(&mut writer, self.flags, self.chunk_type, self.path)?;
        if self.chunk_type == ChunkType::Sparse {
            writer.write_u32::<BigEndian>(self.sparse_map.len() as u32)?;
        }
        writer.write_u64::<BigEndian>(self.length)?;
        writer.write_u64::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.checksum)?;
        for entry in self.sparse_map {
            writer.write_u32::<BigEndian>(entry.skip)?;
            writer.write_u32::<BigEndian>(entry.len)?;
        }
        Ok(())
    }
}

/// Write an EOF chunk, which terminates the chunk sequence of `path`.
pub fn write_eof<W: Write>(mut writer: W, path: &str) -> io::Result<()> {
    write_prefix(&mut writer, 0, ChunkType::Eof, path)
}

fn write_prefix<W: Write>(writer: &mut W, flags: u8, chunk_type: ChunkType, path: &str) -> io::Result<()> {
    writer.write_all(CHUNK_MAGIC)?;
    writer.write_u8(flags)?;
    writer.write_u8(chunk_type.code())?;
    writer.write_u32::<BigEndian>(path.len() as u32)?;
    writer.write_all(path.as_bytes())
}

/// Encode a sparse map exactly as it appears on the wire.
pub fn encode_sparse_map(map: &[SparseChunk]) -> Vec<u8> {
    let mut out = Vec::with_capacity(map.len() * SPARSE_ENTRY_LEN);
    for entry in map {
        out.extend_from_slice(&entry.skip.to_be_bytes());
        out.extend_from_slice(&entry.len.to_be_bytes());
    }
    out
}

pub fn chunk_checksum(map: &[SparseChunk], data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    if !map.is_empty() {
        hasher.update(&encode_sparse_map(map));
    }
    hasher.update(data);
    hasher.finalize()
}
