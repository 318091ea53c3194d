//! Container-encoder stage with parallel stream contexts.
//!
//! The stage holds K stream contexts, each one [`XbWriter`] bound lazily to
//! its own downstream file (for example one FIFO).  `open` rotates the
//! context list so logical files are dealt out round-robin; files that land
//! on the same context share its destination, and the writer keeps their
//! chunks whole.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::chunk::SparseChunk;
use crate::lock_order::lock_coarse;
use crate::stream::{XbWriter, XbWriterFile};
use super::{Datasink, DsFile, FileStat, Pipe, SinkError};

/// Destination of one stream context: a downstream file, bound on first use.
#[derive(Default)]
pub struct SinkOutput {
    dest: Option<Box<dyn DsFile>>,
}

impl Write for SinkOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.dest.as_mut() {
            Some(dest) => dest.write(buf).map_err(io::Error::other),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "stream context has no destination")),
        }
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

struct StreamContext {
    index:  usize,
    writer: Arc<XbWriter<SinkOutput>>,
}

pub struct XbstreamSink {
    contexts: Mutex<VecDeque<Arc<StreamContext>>>,
    pipe:     Pipe,
}

impl XbstreamSink {
    /// `streams` contexts, each coalescing payload up to `chunk_size` bytes.
    pub fn new(streams: usize, chunk_size: usize) -> Self {
        let contexts = (0..streams.max(1))
            .map(|index| {
                Arc::new(StreamContext {
                    index,
                    writer: Arc::new(XbWriter::with_chunk_size(SinkOutput::default(), chunk_size)),
                })
            })
            .collect();
        Self { contexts: Mutex::new(contexts), pipe: Pipe::default() }
    }

    pub fn streams(&self) -> usize { lock_coarse(&self.contexts).len() }

    /// Like [`Datasink::open`], returning the concrete file type.
    pub fn open_file(&self, path: &str, stat: &FileStat) -> Result<XbstreamFile, SinkError> {
        let pipe = self.pipe.get(self.name())?;
        let ctx = {
            let mut list = lock_coarse(&self.contexts);
            let ctx = list.pop_front().ok_or(SinkError::NoPipe("xbstream"))?;
            list.push_back(Arc::clone(&ctx));
            ctx
        };

        ctx.writer.with_output(|out| -> Result<(), SinkError> {
            if out.dest.is_none() {
                out.dest = Some(pipe.open(path, stat)?);
                debug!(context = ctx.index, path, "stream context bound");
            }
            Ok(())
        })?;

        let file = ctx.writer.open(path)?;
        Ok(XbstreamFile { inner: file, context: ctx.index })
    }
}

impl Datasink for XbstreamSink {
    fn name(&self) -> &'static str { "xbstream" }

    fn open(&self, path: &str, stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        Ok(Box::new(self.open_file(path, stat)?))
    }

    fn set_pipe(&self, pipe: Arc<dyn Datasink>) {
        self.pipe.set(pipe);
    }

    fn deinit(&self) -> Result<(), SinkError> {
        let contexts: Vec<_> = lock_coarse(&self.contexts).iter().cloned().collect();
        let mut first_err = None;
        for ctx in contexts {
            let res = ctx.writer.with_output(|out| match out.dest.take() {
                Some(mut dest) => dest.close(),
                None => Ok(()),
            });
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// One logical file encoded onto a stream context.
pub struct XbstreamFile {
    inner:   XbWriterFile<SinkOutput>,
    context: usize,
}

impl XbstreamFile {
    /// Index of the stream context this file was assigned to.
    pub fn context(&self) -> usize { self.context }
}

impl DsFile for XbstreamFile {
    fn path(&self) -> &str { self.inner.path() }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        Ok(self.inner.write(buf)?)
    }

    fn supports_sparse(&self) -> bool { true }

    fn write_sparse(&mut self, buf: &[u8], map: &[SparseChunk]) -> Result<(), SinkError> {
        Ok(self.inner.write_sparse(buf, map)?)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(self.inner.close()?)
    }
}
