//! Local File Sink: mirrors logical paths under a root directory.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::chunk::SparseChunk;
use super::{Datasink, DsFile, FileStat, SinkError};

pub struct LocalSink {
    root:   PathBuf,
    synced: Arc<AtomicUsize>,
}

impl LocalSink {
    /// Create `root` (and parents) if missing.
    pub fn new(root: &Path) -> Result<Self, SinkError> {
        fs::create_dir_all(root).map_err(|source| SinkError::Init { path: root.to_path_buf(), source })?;
        Ok(Self { root: root.to_path_buf(), synced: Arc::new(AtomicUsize::new(0)) })
    }

    pub fn root(&self) -> &Path { &self.root }

    /// Number of files fsynced and closed so far.
    pub fn files_synced(&self) -> usize {
        self.synced.load(Ordering::Relaxed)
    }
}

impl Datasink for LocalSink {
    fn name(&self) -> &'static str { "local" }

    fn open(&self, path: &str, _stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|source| SinkError::Open { path: parent.to_path_buf(), source })?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .map_err(|source| SinkError::Open { path: full.clone(), source })?;
        debug!(path = %full.display(), "local file opened");
        Ok(Box::new(LocalFile {
            path:         full.to_string_lossy().into_owned(),
            file:         Some(file),
            trailing_end: None,
            synced:       Arc::clone(&self.synced),
        }))
    }

    fn deinit(&self) -> Result<(), SinkError> {
        debug!(root = %self.root.display(), files = self.files_synced(), "local sink finished");
        Ok(())
    }
}

pub struct LocalFile {
    path:         String,
    file:         Option<File>,
    /// Set when the last sparse write ended inside a hole: the offset the
    /// file must be extended to on close.
    trailing_end: Option<u64>,
    synced:       Arc<AtomicUsize>,
}

impl LocalFile {
    fn file(&mut self) -> Result<&mut File, SinkError> {
        self.file.as_mut().ok_or_else(|| SinkError::Closed(self.path.clone()))
    }
}

impl DsFile for LocalFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        let path = self.path.clone();
        self.file()?.write_all(buf).map_err(|e| SinkError::io(&path, e))?;
        self.trailing_end = None;
        Ok(())
    }

    fn supports_sparse(&self) -> bool { true }

    fn write_sparse(&mut self, buf: &[u8], map: &[SparseChunk]) -> Result<(), SinkError> {
        let path = self.path.clone();
        let io = |e| SinkError::io(&path, e);
        let file = self.file()?;
        let mut pos = 0usize;
        for entry in map {
            file.seek(SeekFrom::Current(entry.skip as i64)).map_err(io)?;
            let end = pos + entry.len as usize;
            let data = buf.get(pos..end).ok_or_else(|| {
                io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "sparse map exceeds buffer"))
            })?;
            file.write_all(data).map_err(io)?;
            pos = end;
        }
        let ends_in_hole = map.last().is_some_and(|c| c.len == 0 && c.skip > 0);
        let trailing_end = if ends_in_hole {
            Some(file.stream_position().map_err(io)?)
        } else {
            None
        };
        self.trailing_end = trailing_end;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let io = |e| SinkError::io(&self.path, e);
        if let Some(end) = self.trailing_end.take() {
            // Materialise the final size without writing the hole.
            file.seek(SeekFrom::Start(end - 1)).map_err(io)?;
            file.write_all(&[0]).map_err(io)?;
        }
        file.sync_all().map_err(io)?;
        self.synced.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.path, "local file closed");
        Ok(())
    }
}
