use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use std::io::{self, Read};

use crate::chunk::{
    ChunkType, SparseChunk, CHUNK_HEADER_CONSTANT_LEN, CHUNK_MAGIC, FLAG_IGNORABLE, MAX_PATH_LEN,
    SPARSE_ENTRY_LEN,
};
use super::StreamError;

/// Upper bound on the payload capacity reserved up front; larger payloads
/// grow the buffer as bytes actually arrive.
const MAX_RESERVE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    Chunk,
    Eof,
}

/// One parsed chunk.  Reused across reads: buffers are cleared and grown on
/// demand, never shrunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub flags:           u8,
    pub chunk_type:      ChunkType,
    pub path:            String,
    pub sparse_map:      Vec<SparseChunk>,
    pub length:          usize,
    pub offset:          u64,
    pub checksum:        u32,
    /// Stream offset of the checksum field, for diagnostics.
    pub checksum_offset: u64,
    pub data:            Vec<u8>,
    map_crc:             Hasher,
    scratch:             Vec<u8>,
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            flags:           0,
            chunk_type:      ChunkType::Eof,
            path:            String::new(),
            sparse_map:      Vec::new(),
            length:          0,
            offset:          0,
            checksum:        0,
            checksum_offset: 0,
            data:            Vec::new(),
            map_crc:         Hasher::new(),
            scratch:         Vec::new(),
        }
    }
}

impl Chunk {
    pub fn is_ignorable(&self) -> bool {
        self.flags & FLAG_IGNORABLE != 0
    }

    /// Check the CRC32 over the sparse-map bytes followed by the payload.
    pub fn validate_checksum(&self) -> Result<(), StreamError> {
        let mut hasher = self.map_crc.clone();
        hasher.update(&self.data);
        let actual = hasher.finalize();
        if actual != self.checksum {
            return Err(StreamError::ChecksumMismatch {
                offset:   self.checksum_offset,
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Bytes this chunk advances its file by: holes plus payload.
    pub fn extent(&self) -> u64 {
        self.sparse_map.iter().map(|c| c.skip as u64).sum::<u64>() + self.length as u64
    }
}

/// Sequential chunk parser over one input stream.
pub struct XbReader<R: Read> {
    input:  R,
    offset: u64,
}

impl<R: Read> XbReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, offset: 0 }
    }

    /// Bytes consumed from the input so far.
    pub fn offset(&self) -> u64 { self.offset }

    pub fn into_inner(self) -> R { self.input }

    /// Parse the next chunk into `chunk`.
    ///
    /// Returns [`ReadResult::Eof`] only when the input ends cleanly on a
    /// chunk boundary; a partial chunk is [`StreamError::Truncated`].
    pub fn read_chunk(&mut self, chunk: &mut Chunk) -> Result<ReadResult, StreamError> {
        let mut prefix = [0u8; CHUNK_HEADER_CONSTANT_LEN];
        let got = read_full(&mut self.input, &mut prefix)?;
        if got == 0 {
            return Ok(ReadResult::Eof);
        }
        if got < prefix.len() {
            return Err(StreamError::Truncated { offset: self.offset + got as u64 });
        }

        if &prefix[..8] != CHUNK_MAGIC {
            return Err(StreamError::BadMagic { offset: self.offset });
        }
        self.offset += 8;

        chunk.flags = prefix[8];
        self.offset += 1;

        chunk.chunk_type = ChunkType::from(prefix[9]);
        if let ChunkType::Unknown(code) = chunk.chunk_type {
            if !chunk.is_ignorable() {
                return Err(StreamError::UnknownChunkType { code, offset: self.offset });
            }
        }
        self.offset += 1;

        let path_len = BigEndian::read_u32(&prefix[10..14]) as usize;
        if path_len >= MAX_PATH_LEN {
            return Err(StreamError::PathTooLong { len: path_len, offset: self.offset });
        }
        self.offset += 4;

        self.fill_scratch(chunk, path_len)?;
        let path = std::str::from_utf8(&chunk.scratch)
            .map_err(|_| StreamError::InvalidPath { offset: self.offset })?;
        chunk.path.clear();
        chunk.path.push_str(path);
        self.offset += path_len as u64;

        chunk.sparse_map.clear();
        chunk.data.clear();
        chunk.length = 0;
        chunk.offset = 0;
        chunk.checksum = 0;
        chunk.map_crc = Hasher::new();

        if chunk.chunk_type == ChunkType::Eof {
            return Ok(ReadResult::Chunk);
        }

        let map_count = if chunk.chunk_type == ChunkType::Sparse {
            let mut count = [0u8; 4];
            self.read_exact(&mut count)?;
            self.offset += 4;
            BigEndian::read_u32(&count) as usize
        } else {
            0
        };

        let mut fixed = [0u8; 20];
        self.read_exact(&mut fixed)?;

        let length = BigEndian::read_u64(&fixed[0..8]);
        chunk.length = usize::try_from(length)
            .map_err(|_| StreamError::ChunkTooLarge { length, offset: self.offset })?;
        self.offset += 8;

        chunk.offset = BigEndian::read_u64(&fixed[8..16]);
        self.offset += 8;

        chunk.checksum = BigEndian::read_u32(&fixed[16..20]);
        chunk.checksum_offset = self.offset;
        self.offset += 4;

        if map_count > 0 {
            let map_bytes = map_count
                .checked_mul(SPARSE_ENTRY_LEN)
                .ok_or(StreamError::ChunkTooLarge { length: map_count as u64, offset: self.offset })?;
            self.fill_scratch(chunk, map_bytes)?;
            chunk.map_crc.update(&chunk.scratch);
            chunk.sparse_map.reserve(map_count);
            for pair in chunk.scratch.chunks_exact(SPARSE_ENTRY_LEN) {
                chunk.sparse_map.push(SparseChunk {
                    skip: BigEndian::read_u32(&pair[0..4]),
                    len:  BigEndian::read_u32(&pair[4..8]),
                });
            }
            self.offset += map_bytes as u64;
        }
        if chunk.chunk_type == ChunkType::Sparse {
            let mapped: u64 = chunk.sparse_map.iter().map(|c| c.len as u64).sum();
            if mapped != length {
                return Err(StreamError::SparseMap { mapped, length });
            }
        }

        if chunk.length > 0 {
            chunk.data.reserve(chunk.length.min(MAX_RESERVE));
            let read = (&mut self.input).take(length).read_to_end(&mut chunk.data)?;
            if read < chunk.length {
                return Err(StreamError::Truncated { offset: self.offset + read as u64 });
            }
            self.offset += length;
        }

        Ok(ReadResult::Chunk)
    }

    fn fill_scratch(&mut self, chunk: &mut Chunk, len: usize) -> Result<(), StreamError> {
        chunk.scratch.clear();
        if len == 0 {
            return Ok(());
        }
        let read = (&mut self.input).take(len as u64).read_to_end(&mut chunk.scratch)?;
        if read < len {
            return Err(StreamError::Truncated { offset: self.offset + read as u64 });
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let got = read_full(&mut self.input, buf)?;
        if got < buf.len() {
            return Err(StreamError::Truncated { offset: self.offset + got as u64 });
        }
        Ok(())
    }
}

/// Read until `buf` is full or the input ends.  Returns the bytes read.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{write_eof, ChunkHeader};

    fn encode(path: &str, offset: u64, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        ChunkHeader::payload(path, offset, data).write(&mut out).unwrap();
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn empty_input_is_clean_eof() {
        let mut reader = XbReader::new(&[][..]);
        let mut chunk = Chunk::default();
        assert_eq!(reader.read_chunk(&mut chunk).unwrap(), ReadResult::Eof);
    }

    #[test]
    fn parses_payload_then_eof() {
        let mut bytes = encode("x/y", 0, b"payload");
        write_eof(&mut bytes, "x/y").unwrap();

        let mut reader = XbReader::new(&bytes[..]);
        let mut chunk = Chunk::default();
        assert_eq!(reader.read_chunk(&mut chunk).unwrap(), ReadResult::Chunk);
        assert_eq!(chunk.chunk_type, ChunkType::Payload);
        assert_eq!(chunk.path, "x/y");
        assert_eq!(chunk.data, b"payload");
        chunk.validate_checksum().unwrap();

        assert_eq!(reader.read_chunk(&mut chunk).unwrap(), ReadResult::Chunk);
        assert_eq!(chunk.chunk_type, ChunkType::Eof);
        assert!(chunk.data.is_empty());
        assert_eq!(reader.read_chunk(&mut chunk).unwrap(), ReadResult::Eof);
        assert_eq!(reader.offset(), bytes.len() as u64);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode("p", 0, b"z");
        bytes[0] = b'Y';
        let err = XbReader::new(&bytes[..]).read_chunk(&mut Chunk::default()).unwrap_err();
        assert!(matches!(err, StreamError::BadMagic { offset: 0 }));
    }

    #[test]
    fn unknown_type_needs_ignorable_flag() {
        let mut bytes = encode("p", 0, b"z");
        bytes[9] = b'Q';
        let err = XbReader::new(&bytes[..]).read_chunk(&mut Chunk::default()).unwrap_err();
        assert!(matches!(err, StreamError::UnknownChunkType { code: b'Q', .. }));

        bytes[8] = FLAG_IGNORABLE;
        let mut chunk = Chunk::default();
        assert_eq!(XbReader::new(&bytes[..]).read_chunk(&mut chunk).unwrap(), ReadResult::Chunk);
        assert_eq!(chunk.chunk_type, ChunkType::Unknown(b'Q'));
    }

    #[test]
    fn oversized_path_is_rejected() {
        let mut bytes = Vec::from(&CHUNK_MAGIC[..]);
        bytes.extend_from_slice(&[0, b'P']);
        bytes.extend_from_slice(&(MAX_PATH_LEN as u32).to_be_bytes());
        let err = XbReader::new(&bytes[..]).read_chunk(&mut Chunk::default()).unwrap_err();
        assert!(matches!(err, StreamError::PathTooLong { len: MAX_PATH_LEN, .. }));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let bytes = encode("p", 0, b"0123456789");
        let cut = &bytes[..bytes.len() - 3];
        let err = XbReader::new(cut).read_chunk(&mut Chunk::default()).unwrap_err();
        assert!(matches!(err, StreamError::Truncated { .. }));
    }

    #[test]
    fn buffers_are_reused_across_chunks() {
        let mut bytes = encode("a", 0, &[7u8; 4096]);
        bytes.extend(encode("a", 4096, b"tiny"));
        let mut reader = XbReader::new(&bytes[..]);
        let mut chunk = Chunk::default();
        reader.read_chunk(&mut chunk).unwrap();
        let capacity = chunk.data.capacity();
        reader.read_chunk(&mut chunk).unwrap();
        assert_eq!(chunk.data, b"tiny");
        assert_eq!(chunk.data.capacity(), capacity);
    }
}
