//! Compressing Sink.
//!
//! zstd: every `write` becomes one complete frame, produced incrementally
//! through a bounded scratch buffer.  lz4: every `write` is cut into blocks
//! that are compressed in parallel on a pool shared by all files of the
//! stage, then forwarded in order.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use crate::codec::{lz4_compress_block, CodecError, CodecId, ZstdCompressor};
use super::{Datasink, DatasinkOptions, DsFile, FileStat, Pipe, SinkError};

pub struct CompressSink {
    codec:      CodecId,
    level:      i32,
    threads:    usize,
    block_size: usize,
    pool:       Option<Arc<rayon::ThreadPool>>,
    pipe:       Pipe,
}

impl CompressSink {
    pub fn new(opts: &DatasinkOptions) -> Result<Self, SinkError> {
        let threads = opts.compress_threads.max(1);
        let pool = match opts.compress {
            CodecId::Lz4 => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("lz4-{i}"))
                    .build()
                    .map_err(|e| CodecError::Compression(e.to_string()))?,
            )),
            CodecId::Zstd => None,
        };
        Ok(Self {
            codec: opts.compress,
            level: opts.compress_level,
            threads,
            block_size: opts.compress_chunk_size.max(1),
            pool,
            pipe: Pipe::default(),
        })
    }

    pub fn codec(&self) -> CodecId { self.codec }
}

impl Datasink for CompressSink {
    fn name(&self) -> &'static str { "compress" }

    fn open(&self, path: &str, stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        let dest_path = format!("{path}{}", self.codec.suffix());
        let dest = self.pipe.get(self.name())?.open(&dest_path, stat)?;
        let engine = match &self.pool {
            Some(pool) => Engine::Lz4 { pool: Arc::clone(pool), block_size: self.block_size },
            None => Engine::Zstd(ZstdCompressor::new(self.level, self.threads as u32)?),
        };
        debug!(path = %dest_path, codec = self.codec.name(), "compressed file opened");
        Ok(Box::new(CompressFile { path: dest_path, dest, engine, closed: false }))
    }

    fn set_pipe(&self, pipe: Arc<dyn Datasink>) {
        self.pipe.set(pipe);
    }
}

enum Engine {
    Zstd(ZstdCompressor),
    Lz4 { pool: Arc<rayon::ThreadPool>, block_size: usize },
}

pub struct CompressFile {
    path:   String,
    dest:   Box<dyn DsFile>,
    engine: Engine,
    closed: bool,
}

impl DsFile for CompressFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed(self.path.clone()));
        }
        let dest = &mut self.dest;
        match &mut self.engine {
            Engine::Zstd(enc) => enc.compress_frame(buf, |out| dest.write(out)),
            Engine::Lz4 { pool, block_size } => {
                let blocks: Vec<Vec<u8>> =
                    pool.install(|| buf.par_chunks(*block_size).map(lz4_compress_block).collect());
                blocks.iter().try_for_each(|block| dest.write(block))
            }
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.dest.close()
    }
}
