use std::io::{self, Write};
use std::mem;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::chunk::{self, sparse_skipped, ChunkHeader, SparseChunk, MAX_PATH_LEN};
use crate::lock_order::lock_fine;
use super::StreamError;

/// Writes smaller than this are coalesced into one PAYLOAD chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Encoder state for one destination stream.
pub struct XbWriter<W: Write> {
    out:        Mutex<W>,
    chunk_size: usize,
}

impl<W: Write> XbWriter<W> {
    pub fn new(out: W) -> Self {
        Self::with_chunk_size(out, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(out: W, chunk_size: usize) -> Self {
        Self { out: Mutex::new(out), chunk_size: chunk_size.max(1) }
    }

    pub fn chunk_size(&self) -> usize { self.chunk_size }

    /// Start a new logical file on this stream.
    pub fn open(self: &Arc<Self>, path: &str) -> Result<XbWriterFile<W>, StreamError> {
        if path.len() >= MAX_PATH_LEN {
            return Err(StreamError::PathTooLong { len: path.len(), offset: 0 });
        }
        debug!(path, "xbstream file opened");
        Ok(XbWriterFile {
            writer: Arc::clone(self),
            path:   path.to_owned(),
            offset: 0,
            buf:    Vec::new(),
            encoded: Vec::with_capacity(chunk::CHUNK_HEADER_CONSTANT_LEN + path.len() + 24),
            closed: false,
        })
    }

    /// Run `f` with exclusive access to the destination.
    pub fn with_output<T>(&self, f: impl FnOnce(&mut W) -> T) -> T {
        let mut out = lock_fine(&self.out);
        f(&mut out)
    }

    /// Flush the destination.  Open writer files stay usable.
    pub fn done(&self) -> io::Result<()> {
        lock_fine(&self.out).flush()
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand one whole encoded chunk to the destination in a single write.
    fn emit(&self, chunk: &[u8]) -> io::Result<()> {
        lock_fine(&self.out).write_all(chunk)
    }
}

/// One logical file being encoded onto an [`XbWriter`].
pub struct XbWriterFile<W: Write> {
    writer: Arc<XbWriter<W>>,
    path:   String,
    /// Logical offset of the next byte to be emitted.
    offset: u64,
    buf:    Vec<u8>,
    /// Header and payload of the chunk being emitted.
    encoded: Vec<u8>,
    closed: bool,
}

impl<W: Write> XbWriterFile<W> {
    pub fn path(&self) -> &str { &self.path }

    /// Logical size written so far, buffered bytes included.
    pub fn len(&self) -> u64 { self.offset + self.buf.len() as u64 }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.check_open()?;
        let chunk_size = self.writer.chunk_size();
        if self.buf.len() + data.len() < chunk_size {
            self.buf.extend_from_slice(data);
            return Ok(());
        }
        self.flush()?;
        if data.len() < chunk_size {
            self.buf.extend_from_slice(data);
            Ok(())
        } else {
            self.emit_payload(data)
        }
    }

    /// Emit `data` as one SPARSE chunk described by `map`.
    pub fn write_sparse(&mut self, data: &[u8], map: &[SparseChunk]) -> Result<(), StreamError> {
        self.check_open()?;
        let mapped: u64 = map.iter().map(|c| c.len as u64).sum();
        if mapped != data.len() as u64 {
            return Err(StreamError::SparseMap { mapped, length: data.len() as u64 });
        }
        self.flush()?;

        self.encoded.clear();
        ChunkHeader::sparse(&self.path, self.offset, map, data).write(&mut self.encoded)?;
        self.encoded.extend_from_slice(data);
        self.writer.emit(&self.encoded)?;
        self.offset += sparse_skipped(map) + data.len() as u64;
        Ok(())
    }

    /// Emit any buffered bytes as a PAYLOAD chunk.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut pending = mem::take(&mut self.buf);
        let res = self.emit_payload(&pending);
        pending.clear();
        self.buf = pending;
        res
    }

    /// Flush and terminate this file with an EOF chunk.  The destination
    /// stays open.  A second call is a no-op.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.encoded.clear();
        chunk::write_eof(&mut self.encoded, &self.path)?;
        self.writer.emit(&self.encoded)?;
        self.closed = true;
        debug!(path = %self.path, size = self.offset, "xbstream file closed");
        Ok(())
    }

    fn emit_payload(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.encoded.clear();
        ChunkHeader::payload(&self.path, self.offset, data).write(&mut self.encoded)?;
        self.encoded.extend_from_slice(data);
        self.writer.emit(&self.encoded)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    fn check_open(&self) -> Result<(), StreamError> {
        if self.closed {
            Err(StreamError::Closed(self.path.clone()))
        } else {
            Ok(())
        }
    }
}
