//! Decompressing Sink: the extraction-side inverse of [`CompressSink`].
//! The codec suffix is dropped from the destination name.
//!
//! [`CompressSink`]: super::CompressSink

use std::sync::Arc;

use tracing::debug;

use crate::codec::{CodecError, CodecId, Lz4BlockDecoder, ZstdDecompressor};
use super::{Datasink, DsFile, FileStat, Pipe, SinkError};

pub struct DecompressSink {
    codec: CodecId,
    pipe:  Pipe,
}

impl DecompressSink {
    pub fn new(codec: CodecId) -> Self {
        Self { codec, pipe: Pipe::default() }
    }
}

impl Datasink for DecompressSink {
    fn name(&self) -> &'static str { "decompress" }

    fn open(&self, path: &str, stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        let dest_path = path.strip_suffix(self.codec.suffix()).unwrap_or(path);
        let dest = self.pipe.get(self.name())?.open(dest_path, stat)?;
        let engine = match self.codec {
            CodecId::Zstd => Engine::Zstd(ZstdDecompressor::new()?),
            CodecId::Lz4  => Engine::Lz4(Lz4BlockDecoder::new()),
        };
        debug!(path = dest_path, codec = self.codec.name(), "decompressing into");
        Ok(Box::new(DecompressFile { path: path.to_owned(), dest, engine, closed: false }))
    }

    fn set_pipe(&self, pipe: Arc<dyn Datasink>) {
        self.pipe.set(pipe);
    }
}

enum Engine {
    Zstd(ZstdDecompressor),
    Lz4(Lz4BlockDecoder),
}

pub struct DecompressFile {
    path:   String,
    dest:   Box<dyn DsFile>,
    engine: Engine,
    closed: bool,
}

impl DsFile for DecompressFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed(self.path.clone()));
        }
        let dest = &mut self.dest;
        match &mut self.engine {
            Engine::Zstd(dec) => dec.decompress(buf, |out| dest.write(out)),
            Engine::Lz4(dec)  => dec.feed(buf, |out| dest.write(out)),
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let truncated = match &self.engine {
            Engine::Zstd(dec) if !dec.finished() => {
                Some(CodecError::Decompression(format!("{} ends inside a zstd frame", self.path)))
            }
            Engine::Lz4(dec) if dec.pending() > 0 => Some(CodecError::BadBlock(format!(
                "{} ends inside a block ({} bytes left over)",
                self.path,
                dec.pending()
            ))),
            _ => None,
        };
        self.dest.close()?;
        match truncated {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
