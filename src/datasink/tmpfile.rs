//! Temp-file spooling stage.  Files are written to anonymous temporary
//! files and only replayed through the downstream stage, one whole file at a
//! time, when the stage is deinitialised.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::lock_order::lock_coarse;
use super::{Datasink, DsFile, FileStat, Pipe, SinkError};

const REPLAY_BUF: usize = 1024 * 1024;

struct Spooled {
    path: String,
    stat: FileStat,
    file: NamedTempFile,
}

pub struct TmpfileSink {
    dir:     PathBuf,
    spooled: Arc<Mutex<Vec<Spooled>>>,
    pipe:    Pipe,
}

impl TmpfileSink {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), spooled: Arc::default(), pipe: Pipe::default() }
    }

    /// Files closed and waiting to be replayed.
    pub fn spooled(&self) -> usize { lock_coarse(&self.spooled).len() }
}

impl Datasink for TmpfileSink {
    fn name(&self) -> &'static str { "tmpfile" }

    fn open(&self, path: &str, stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        let file = NamedTempFile::new_in(&self.dir)
            .map_err(|source| SinkError::Open { path: self.dir.clone(), source })?;
        debug!(path, spool = %file.path().display(), "spooling file");
        Ok(Box::new(TmpFile {
            path:    path.to_owned(),
            stat:    *stat,
            file:    Some(file),
            spooled: Arc::clone(&self.spooled),
        }))
    }

    fn set_pipe(&self, pipe: Arc<dyn Datasink>) {
        self.pipe.set(pipe);
    }

    fn deinit(&self) -> Result<(), SinkError> {
        let files = std::mem::take(&mut *lock_coarse(&self.spooled));
        if files.is_empty() {
            return Ok(());
        }
        let pipe = self.pipe.get(self.name())?;
        let mut buf = vec![0u8; REPLAY_BUF];
        for mut spooled in files {
            let io = |e| SinkError::io(&spooled.path, e);
            let src = spooled.file.as_file_mut();
            src.seek(SeekFrom::Start(0)).map_err(io)?;
            let mut dest = pipe.open(&spooled.path, &spooled.stat)?;
            loop {
                let n = src.read(&mut buf).map_err(io)?;
                if n == 0 {
                    break;
                }
                dest.write(&buf[..n])?;
            }
            dest.close()?;
            debug!(path = %spooled.path, "spooled file replayed");
        }
        Ok(())
    }
}

pub struct TmpFile {
    path:    String,
    stat:    FileStat,
    file:    Option<NamedTempFile>,
    spooled: Arc<Mutex<Vec<Spooled>>>,
}

impl DsFile for TmpFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        let file = self.file.as_mut().ok_or_else(|| SinkError::Closed(self.path.clone()))?;
        file.write_all(buf).map_err(|e| SinkError::io(&self.path, e))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush().map_err(|e| SinkError::io(&self.path, e))?;
        lock_coarse(&self.spooled).push(Spooled { path: self.path.clone(), stat: self.stat, file });
        Ok(())
    }
}
