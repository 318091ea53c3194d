//! Compression adapters used by the compressing and decompressing stages.
//!
//! # Streams
//! A zstd stream is a concatenation of complete frames, one per sink
//! `write`.  An lz4 stream is a sequence of blocks, each framed as
//!
//! ```text
//! RAW_LEN(4,BE) | STORED_LEN(4,BE, top bit = stored uncompressed) | DATA
//! ```
//!
//! The file-name suffix is the only place the codec is recorded; the
//! extraction side picks a decoder from it.

use std::io;
use thiserror::Error;
use zstd::stream::raw::{CParameter, Decoder, Encoder, InBuffer, Operation, OutBuffer};
use zstd::zstd_safe::{CCtx, DCtx};

/// Set on `STORED_LEN` when the block did not shrink and is stored raw.
pub const LZ4_RAW_FLAG: u32 = 0x8000_0000;

/// Size of one lz4 block header.
pub const LZ4_BLOCK_HEADER_LEN: usize = 8;

/// Largest block the lz4 framing accepts on decode.
pub const LZ4_MAX_BLOCK: usize = 64 * 1024 * 1024;

// ── CodecId enum ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    Zstd,
    Lz4,
}

impl CodecId {
    /// Human-readable name (for diagnostics only).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::Zstd => "zstd",
            CodecId::Lz4  => "lz4",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "zstd" => Some(CodecId::Zstd),
            "lz4"  => Some(CodecId::Lz4),
            _      => None,
        }
    }

    /// Extension appended to the destination name of a compressed file.
    pub fn suffix(self) -> &'static str {
        match self {
            CodecId::Zstd => ".zst",
            CodecId::Lz4  => ".lz4",
        }
    }

    /// Identify a compressed file by its suffix, returning the codec and the
    /// name with the suffix removed.
    pub fn strip_suffix(path: &str) -> Option<(Self, &str)> {
        [CodecId::Zstd, CodecId::Lz4]
            .into_iter()
            .find_map(|id| path.strip_suffix(id.suffix()).map(|base| (id, base)))
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Corrupt lz4 block header: {0}")]
    BadBlock(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn comp_err(e: io::Error) -> CodecError { CodecError::Compression(e.to_string()) }
fn decomp_err(e: io::Error) -> CodecError { CodecError::Decompression(e.to_string()) }

// ── zstd ─────────────────────────────────────────────────────────────────────

/// Streaming zstd compressor.  Each call to [`compress_frame`] produces one
/// complete frame, delivered to `emit` in pieces no larger than the scratch
/// buffer.
///
/// [`compress_frame`]: ZstdCompressor::compress_frame
pub struct ZstdCompressor {
    encoder: Encoder<'static>,
    scratch: Vec<u8>,
}

impl ZstdCompressor {
    /// `threads > 1` enables zstd's own worker pool for this context.
    pub fn new(level: i32, threads: u32) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(level).map_err(comp_err)?;
        if threads > 1 {
            encoder
                .set_parameter(CParameter::NbWorkers(threads))
                .map_err(comp_err)?;
        }
        Ok(Self { encoder, scratch: vec![0u8; CCtx::out_size() * 2] })
    }

    pub fn compress_frame<E, F>(&mut self, input: &[u8], mut emit: F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
        E: From<CodecError>,
    {
        if input.is_empty() {
            return Ok(());
        }
        let step = CCtx::in_size().max(1);
        let reserve = CCtx::out_size();
        let mut filled = 0;
        let mut pieces = input.chunks(step).peekable();

        while let Some(piece) = pieces.next() {
            let mut src = InBuffer::around(piece);
            while src.pos() < piece.len() {
                filled += {
                    let mut out = OutBuffer::around(&mut self.scratch[filled..]);
                    self.encoder.run(&mut src, &mut out).map_err(comp_err)?;
                    out.pos()
                };
                if self.scratch.len() - filled < reserve {
                    emit(&self.scratch[..filled])?;
                    filled = 0;
                }
            }
            if pieces.peek().is_none() {
                loop {
                    let (produced, remaining) = {
                        let mut out = OutBuffer::around(&mut self.scratch[filled..]);
                        let remaining = self.encoder.finish(&mut out, true).map_err(comp_err)?;
                        (out.pos(), remaining)
                    };
                    filled += produced;
                    if remaining == 0 {
                        break;
                    }
                    emit(&self.scratch[..filled])?;
                    filled = 0;
                }
            }
        }
        if filled > 0 {
            emit(&self.scratch[..filled])?;
        }
        self.encoder.reinit().map_err(comp_err)?;
        Ok(())
    }
}

/// Streaming zstd decompressor.  Input may be split anywhere, including
/// across frame boundaries.
pub struct ZstdDecompressor {
    decoder: Decoder<'static>,
    scratch: Vec<u8>,
    /// Last non-idle hint from the decoder; zero once a frame is complete.
    hint:    usize,
}

impl ZstdDecompressor {
    pub fn new() -> Result<Self, CodecError> {
        Ok(Self {
            decoder: Decoder::new().map_err(decomp_err)?,
            scratch: vec![0u8; DCtx::out_size()],
            hint:    0,
        })
    }

    /// True when the input so far ends on a frame boundary.
    pub fn finished(&self) -> bool { self.hint == 0 }

    pub fn decompress<E, F>(&mut self, input: &[u8], mut emit: F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
        E: From<CodecError>,
    {
        let mut src = InBuffer::around(input);
        loop {
            let consumed = src.pos();
            let (produced, hint) = {
                let mut out = OutBuffer::around(&mut self.scratch[..]);
                let hint = self.decoder.run(&mut src, &mut out).map_err(decomp_err)?;
                (out.pos(), hint)
            };
            // An idle call past the end of a frame reports the next header's
            // size; only calls that made progress describe the frame state.
            if produced > 0 || src.pos() > consumed {
                self.hint = hint;
            }
            if produced > 0 {
                emit(&self.scratch[..produced])?;
            }
            if src.pos() == input.len() && produced < self.scratch.len() {
                return Ok(());
            }
        }
    }
}

// ── lz4 blocks ───────────────────────────────────────────────────────────────

/// Compress one block and frame it.  Blocks that do not shrink are stored raw.
pub fn lz4_compress_block(raw: &[u8]) -> Vec<u8> {
    let packed = lz4_flex::block::compress(raw);
    let (body, stored_len) = if packed.len() < raw.len() {
        (&packed[..], packed.len() as u32)
    } else {
        (raw, raw.len() as u32 | LZ4_RAW_FLAG)
    };
    let mut out = Vec::with_capacity(LZ4_BLOCK_HEADER_LEN + body.len());
    out.extend_from_slice(&(raw.len() as u32).to_be_bytes());
    out.extend_from_slice(&stored_len.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Incremental parser for a stream of framed lz4 blocks.
#[derive(Default)]
pub struct Lz4BlockDecoder {
    pending: Vec<u8>,
}

impl Lz4BlockDecoder {
    pub fn new() -> Self { Self::default() }

    /// Bytes received but not yet forming a whole block.
    pub fn pending(&self) -> usize { self.pending.len() }

    /// Feed `input`; every complete block is decoded and passed to `emit`.
    pub fn feed<E, F>(&mut self, input: &[u8], mut emit: F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
        E: From<CodecError>,
    {
        self.pending.extend_from_slice(input);
        let mut pos = 0;
        while self.pending.len() - pos >= LZ4_BLOCK_HEADER_LEN {
            let head = &self.pending[pos..pos + LZ4_BLOCK_HEADER_LEN];
            let raw_len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
            let stored = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
            let is_raw = stored & LZ4_RAW_FLAG != 0;
            let stored_len = (stored & !LZ4_RAW_FLAG) as usize;

            if raw_len > LZ4_MAX_BLOCK || stored_len > LZ4_MAX_BLOCK {
                return Err(CodecError::BadBlock(format!(
                    "block of {raw_len} bytes ({stored_len} stored) exceeds the limit"
                ))
                .into());
            }
            if is_raw && stored_len != raw_len {
                return Err(CodecError::BadBlock(format!(
                    "raw block stores {stored_len} bytes for {raw_len}"
                ))
                .into());
            }
            let start = pos + LZ4_BLOCK_HEADER_LEN;
            if self.pending.len() - start < stored_len {
                break;
            }
            let body = &self.pending[start..start + stored_len];
            if is_raw {
                emit(body)?;
            } else {
                let plain = lz4_flex::block::decompress(body, raw_len)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                emit(&plain)?;
            }
            pos = start + stored_len;
        }
        self.pending.drain(..pos);
        Ok(())
    }
}
