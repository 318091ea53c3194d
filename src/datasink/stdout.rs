//! Standard-output sink.  All files share the one process-wide stream, which
//! `close` flushes but never closes.

use std::io::{self, Write};

use tracing::debug;

use super::{Datasink, DsFile, FileStat, SinkError};

#[derive(Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self { Self }
}

impl Datasink for StdoutSink {
    fn name(&self) -> &'static str { "stdout" }

    fn open(&self, path: &str, _stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        debug!(path, "stdout file opened");
        Ok(Box::new(StdoutFile { path: path.to_owned(), closed: false }))
    }
}

pub struct StdoutFile {
    path:   String,
    closed: bool,
}

impl DsFile for StdoutFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed(self.path.clone()));
        }
        io::stdout().lock().write_all(buf).map_err(|e| SinkError::io(&self.path, e))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        io::stdout().flush().map_err(|e| SinkError::io(&self.path, e))
    }
}
