//! xbstream container encoder and decoder.
//!
//! # Writer
//! [`XbWriter`] owns one destination byte stream.  Each logical file is
//! written through an [`XbWriterFile`], which coalesces small writes into
//! chunks of up to the writer's chunk size and terminates the file with an
//! EOF chunk on close.  Any number of writer files may be open on one
//! writer at a time; every chunk reaches the destination in a single locked
//! write, so chunks of different files interleave but never tear.
//!
//! # Reader
//! [`XbReader`] parses one chunk at a time into a caller-owned, reusable
//! [`Chunk`].  It validates the magic, the chunk type and the path length;
//! checksum validation is left to the caller so it can happen outside the
//! lock that serialises parsing.

use std::io;
use thiserror::Error;

pub mod reader;
pub mod writer;

pub use reader::{Chunk, ReadResult, XbReader};
pub use writer::{XbWriter, XbWriterFile, DEFAULT_CHUNK_SIZE};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("wrong chunk magic at offset {offset:#x}")]
    BadMagic { offset: u64 },
    #[error("unknown chunk type {code:#04x} at offset {offset:#x}")]
    UnknownChunkType { code: u8, offset: u64 },
    #[error("path length ({len}) is too large at offset {offset:#x}")]
    PathTooLong { len: usize, offset: u64 },
    #[error("path is not valid UTF-8 at offset {offset:#x}")]
    InvalidPath { offset: u64 },
    #[error("unexpected end of stream at offset {offset:#x}")]
    Truncated { offset: u64 },
    #[error("chunk length is too large at offset {offset:#x}: {length:#x}")]
    ChunkTooLarge { length: u64, offset: u64 },
    #[error("invalid checksum at offset {offset:#x}: expected {expected:#010x}, read {actual:#010x}")]
    ChecksumMismatch { offset: u64, expected: u32, actual: u32 },
    #[error("out-of-order chunk for {path}: real offset = {actual:#x}, expected offset = {expected:#x}")]
    OutOfOrder { path: String, expected: u64, actual: u64 },
    #[error("sparse map covers {mapped} bytes but the buffer holds {length}")]
    SparseMap { mapped: u64, length: u64 },
    #[error("absolute path not allowed: {0}")]
    AbsolutePath(String),
    #[error("{0} is already closed")]
    Closed(String),
}

impl StreamError {
    /// Everything but an I/O failure means the stream itself is malformed.
    pub fn is_format(&self) -> bool {
        !matches!(self, StreamError::Io(_) | StreamError::Closed(_))
    }
}

/// Return the portion of `path` that is safe to create under a target
/// directory, along with the length of the stripped unsafe prefix.
///
/// Everything up to and including the last `..` component is dropped, then
/// any leading `/`.  A path that is entirely unsafe becomes `"."`.
pub fn safer_name_suffix(path: &str) -> (&str, usize) {
    let mut start = 0;
    let mut pos = 0;
    for segment in path.split('/') {
        let end = pos + segment.len();
        if segment == ".." {
            start = (end + 1).min(path.len());
        }
        pos = end + 1;
    }
    let trimmed = path[start..].trim_start_matches('/');
    let prefix_len = path.len() - trimmed.len();
    if trimmed.is_empty() {
        (".", prefix_len)
    } else {
        (trimmed, prefix_len)
    }
}
