//! Buffering stage: accumulates small writes and forwards them downstream
//! in large blocks, cutting the number of downstream writes (and, behind a
//! container encoder, the number of chunks) on small-write workloads.

use std::sync::Arc;

use tracing::debug;

use super::{Datasink, DsFile, FileStat, Pipe, SinkError};

pub struct BufferSink {
    capacity: usize,
    pipe:     Pipe,
}

impl BufferSink {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), pipe: Pipe::default() }
    }
}

impl Datasink for BufferSink {
    fn name(&self) -> &'static str { "buffer" }

    fn open(&self, path: &str, stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        let dest = self.pipe.get(self.name())?.open(path, stat)?;
        Ok(Box::new(BufferFile {
            path:          path.to_owned(),
            dest,
            buf:           Vec::with_capacity(self.capacity),
            capacity:      self.capacity,
            bytes_written: 0,
            closed:        false,
        }))
    }

    fn set_pipe(&self, pipe: Arc<dyn Datasink>) {
        self.pipe.set(pipe);
    }
}

pub struct BufferFile {
    path:          String,
    dest:          Box<dyn DsFile>,
    buf:           Vec<u8>,
    capacity:      usize,
    bytes_written: u64,
    closed:        bool,
}

impl BufferFile {
    fn flush(&mut self) -> Result<(), SinkError> {
        if !self.buf.is_empty() {
            self.dest.write(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl DsFile for BufferFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed(self.path.clone()));
        }
        // Large writes bypass the buffer.
        if buf.len() >= self.capacity {
            self.flush()?;
            self.dest.write(buf)?;
        } else {
            if self.buf.len() + buf.len() > self.capacity {
                self.flush()?;
            }
            self.buf.extend_from_slice(buf);
        }
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush()?;
        debug!(path = %self.path, bytes = self.bytes_written, "buffered file closed");
        self.dest.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the size of every write it receives.
    #[derive(Default)]
    struct Sizes(Arc<Mutex<Vec<usize>>>);

    struct SizesFile(Arc<Mutex<Vec<usize>>>);

    impl Datasink for Sizes {
        fn name(&self) -> &'static str { "sizes" }
        fn open(&self, _: &str, _: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
            Ok(Box::new(SizesFile(Arc::clone(&self.0))))
        }
    }

    impl DsFile for SizesFile {
        fn path(&self) -> &str { "sizes" }
        fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(buf.len());
            Ok(())
        }
        fn close(&mut self) -> Result<(), SinkError> { Ok(()) }
    }

    #[test]
    fn small_writes_are_batched() {
        let sizes = Sizes::default();
        let seen = Arc::clone(&sizes.0);
        let sink = BufferSink::new(8);
        sink.set_pipe(Arc::new(sizes));

        let mut f = sink.open("f", &FileStat::default()).unwrap();
        f.write(b"hello").unwrap();
        f.write(b" world!").unwrap();
        f.write(&[0u8; 20]).unwrap();
        f.write(b"ab").unwrap();
        f.close().unwrap();
        assert_eq!(*seen.lock().unwrap(), [5, 7, 20, 2]);
    }
}
