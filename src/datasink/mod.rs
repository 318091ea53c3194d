//! Composable pipeline stages.
//!
//! A [`Datasink`] is one stage instance.  `open` yields a [`DsFile`] for one
//! logical source file; the file is written with `write` (and optionally
//! `write_sparse`) and finished with exactly one effective `close`.  Stages
//! that forward data hold their downstream stage as a *pipe*, set with
//! [`Datasink::set_pipe`] before first use.  The pipe is shared, never owned:
//! dropping or deinitialising an upstream stage leaves its downstream alone.
//!
//! ```text
//! producer → compress / encrypt → xbstream → local | fifo | stdout
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::chunk::SparseChunk;
use crate::codec::{CodecError, CodecId};
use crate::crypto::CryptoError;
use crate::stream::{StreamError, DEFAULT_CHUNK_SIZE};

pub mod buffer;
pub mod compress;
pub mod decompress;
pub mod decrypt;
pub mod encrypt;
pub mod fifo;
pub mod local;
pub mod stdout;
pub mod tmpfile;
pub mod xbstream;

pub use buffer::BufferSink;
pub use compress::CompressSink;
pub use decompress::DecompressSink;
pub use decrypt::DecryptSink;
pub use encrypt::EncryptSink;
pub use fifo::FifoSink;
pub use local::LocalSink;
pub use stdout::StdoutSink;
pub use tmpfile::TmpfileSink;
pub use xbstream::XbstreamSink;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("cannot initialise {path}: {source}")]
    Init { path: PathBuf, source: io::Error },
    #[error("cannot open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("FIFO pool exhausted: all {capacity} streams are in use")]
    PoolExhausted { capacity: usize },
    #[error("I/O error on {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("timed out after {secs}s waiting for the other end of {path}")]
    Timeout { path: PathBuf, secs: u64 },
    #[error("{0} does not support sparse writes")]
    SparseUnsupported(String),
    #[error("{0} stage has no downstream stage")]
    NoPipe(&'static str),
    #[error("{0} is already closed")]
    Closed(String),
    #[error("pool holds {actual} of {expected} streams at deinit")]
    PoolLeak { expected: usize, actual: usize },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Coarse classification of a [`SinkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Init,
    Open,
    Io,
    Format,
    Timeout,
}

impl SinkError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SinkError::Init { .. } | SinkError::PoolLeak { .. } | SinkError::NoPipe(_) => ErrorCategory::Init,
            SinkError::Open { .. } | SinkError::PoolExhausted { .. } => ErrorCategory::Open,
            SinkError::Timeout { .. } => ErrorCategory::Timeout,
            SinkError::Stream(e) if e.is_format() => ErrorCategory::Format,
            SinkError::Codec(CodecError::Decompression(_) | CodecError::BadBlock(_)) => ErrorCategory::Format,
            SinkError::Crypto(CryptoError::DecryptionFailed | CryptoError::BadFrame(_) | CryptoError::TooShort) => {
                ErrorCategory::Format
            }
            SinkError::Crypto(CryptoError::MissingKey | CryptoError::KeyDerivation(_)) => ErrorCategory::Init,
            _ => ErrorCategory::Io,
        }
    }

    pub(crate) fn io(path: &str, source: io::Error) -> Self {
        SinkError::Io { path: path.to_owned(), source }
    }
}

// ── Stage traits ─────────────────────────────────────────────────────────────

/// Source-file metadata passed to `open`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub size:  u64,
    pub mtime: Option<SystemTime>,
}

impl FileStat {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self { size: meta.len(), mtime: meta.modified().ok() }
    }
}

pub trait Datasink: Send + Sync {
    /// Short stage name for diagnostics.
    fn name(&self) -> &'static str;

    fn open(&self, path: &str, stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError>;

    /// Chain `pipe` as this stage's downstream.  Leaf stages have nowhere to
    /// forward to and ignore it.
    fn set_pipe(&self, _pipe: Arc<dyn Datasink>) {}

    /// Release stage resources.  Every file opened on the stage must be
    /// closed first.
    fn deinit(&self) -> Result<(), SinkError> { Ok(()) }
}

/// One logical file open on a stage.  Not safe for concurrent use; a
/// `DsFile` is moved between threads, never shared.
pub trait DsFile: Send {
    /// Resolved destination path.
    fn path(&self) -> &str;

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError>;

    fn supports_sparse(&self) -> bool { false }

    /// Write `buf` as described by `map`: for each entry skip `skip` bytes,
    /// then write the next `len` bytes of `buf`.
    fn write_sparse(&mut self, _buf: &[u8], _map: &[SparseChunk]) -> Result<(), SinkError> {
        Err(SinkError::SparseUnsupported(self.path().to_owned()))
    }

    /// Finish the file.  Calls after the first are no-ops.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Sparse write that falls back to dense zero-filled writes when `file`
/// cannot represent holes.
pub fn write_sparse_or_dense(file: &mut dyn DsFile, buf: &[u8], map: &[SparseChunk]) -> Result<(), SinkError> {
    if file.supports_sparse() {
        return file.write_sparse(buf, map);
    }
    let zeros = [0u8; 64 * 1024];
    let mut pos = 0usize;
    for entry in map {
        let mut hole = entry.skip as usize;
        while hole > 0 {
            let n = hole.min(zeros.len());
            file.write(&zeros[..n])?;
            hole -= n;
        }
        let end = pos + entry.len as usize;
        let data = buf.get(pos..end).ok_or(StreamError::SparseMap {
            mapped: crate::chunk::sparse_extent(map) - crate::chunk::sparse_skipped(map),
            length: buf.len() as u64,
        })?;
        if !data.is_empty() {
            file.write(data)?;
        }
        pos = end;
    }
    Ok(())
}

/// Downstream link of a forwarding stage.
#[derive(Default)]
pub struct Pipe {
    inner: RwLock<Option<Arc<dyn Datasink>>>,
}

impl Pipe {
    pub fn set(&self, pipe: Arc<dyn Datasink>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(pipe);
    }

    pub fn get(&self, stage: &'static str) -> Result<Arc<dyn Datasink>, SinkError> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SinkError::NoPipe(stage))
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasinkKind {
    Local,
    Stdout,
    Fifo,
    Xbstream,
    Compress,
    Encrypt,
    Decompress,
    Decrypt,
    Tmpfile,
    Buffer,
}

/// Tuning for every stage the factory can build.
#[derive(Debug, Clone)]
pub struct DatasinkOptions {
    /// Number of FIFOs, and of parallel stream contexts in front of them.
    pub fifo_streams:        usize,
    pub fifo_timeout:        Duration,
    pub compress:            CodecId,
    pub compress_level:      i32,
    pub compress_threads:    usize,
    /// Block size for the lz4 variant's parallel split.
    pub compress_chunk_size: usize,
    pub buffer_size:         usize,
    /// Passphrase for the encrypt and decrypt stages.
    pub encrypt_key:         Option<String>,
    pub tmpdir:              PathBuf,
    /// Payload coalescing threshold of the container encoder.
    pub chunk_size:          usize,
}

impl Default for DatasinkOptions {
    fn default() -> Self {
        Self {
            fifo_streams:        1,
            fifo_timeout:        Duration::from_secs(60),
            compress:            CodecId::Zstd,
            compress_level:      3,
            compress_threads:    1,
            compress_chunk_size: 64 * 1024,
            buffer_size:         1024 * 1024,
            encrypt_key:         None,
            tmpdir:              std::env::temp_dir(),
            chunk_size:          DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Build a stage of `kind` rooted at `root`.  `root` is only meaningful for
/// local and FIFO stages.
pub fn create(kind: DatasinkKind, root: &Path, opts: &DatasinkOptions) -> Result<Arc<dyn Datasink>, SinkError> {
    let key = || opts.encrypt_key.clone().ok_or(SinkError::Crypto(CryptoError::MissingKey));
    Ok(match kind {
        DatasinkKind::Local      => Arc::new(LocalSink::new(root)?),
        DatasinkKind::Stdout     => Arc::new(StdoutSink::new()),
        DatasinkKind::Fifo       => Arc::new(FifoSink::new(root, opts.fifo_streams, opts.fifo_timeout)?),
        DatasinkKind::Xbstream   => Arc::new(XbstreamSink::new(opts.fifo_streams, opts.chunk_size)),
        DatasinkKind::Compress   => Arc::new(CompressSink::new(opts)?),
        DatasinkKind::Encrypt    => Arc::new(EncryptSink::new(&key()?)?),
        DatasinkKind::Decompress => Arc::new(DecompressSink::new(opts.compress)),
        DatasinkKind::Decrypt    => Arc::new(DecryptSink::new(&key()?)),
        DatasinkKind::Tmpfile    => Arc::new(TmpfileSink::new(&opts.tmpdir)),
        DatasinkKind::Buffer     => Arc::new(BufferSink::new(opts.buffer_size)),
    })
}

/// Build `kind` and chain it in front of `pipe`.
pub fn create_piped(
    kind: DatasinkKind,
    root: &Path,
    opts: &DatasinkOptions,
    pipe: Arc<dyn Datasink>,
) -> Result<Arc<dyn Datasink>, SinkError> {
    let stage = create(kind, root, opts)?;
    stage.set_pipe(pipe);
    Ok(stage)
}
