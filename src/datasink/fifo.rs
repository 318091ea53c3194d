//! FIFO Pool Sink.
//!
//! `init` creates `thread_0 .. thread_{N-1}` under the stream directory and
//! attaches to each as the writer.  Each `open` borrows one attached FIFO
//! from the pool; `close` hands it back without closing the descriptor, so
//! the reader stays attached across any number of logical files.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::lock_order::lock_coarse;
use super::{Datasink, DsFile, FileStat, SinkError};

/// Written by the writer once attached; the reader checks it before use.
pub const FIFO_CONTROL_BYTE: u8 = b'X';

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub fn fifo_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("thread_{index}"))
}

// ── Pool ─────────────────────────────────────────────────────────────────────

/// Fixed-capacity pool.  Items are lent out as [`PoolSlot`]s and come back
/// when the slot is dropped.
pub struct SlotPool<T> {
    slots:    Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> SlotPool<T> {
    pub fn new(items: Vec<T>) -> Arc<Self> {
        let capacity = items.len();
        Arc::new(Self { slots: Mutex::new(items), capacity })
    }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn available(&self) -> usize { lock_coarse(&self.slots).len() }

    /// Borrow an item, or `None` when every item is lent out.
    pub fn acquire(self: &Arc<Self>) -> Option<PoolSlot<T>> {
        let item = lock_coarse(&self.slots).pop()?;
        Some(PoolSlot { pool: Arc::clone(self), item: Some(item) })
    }

    /// Take every pooled item out, leaving the pool empty.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *lock_coarse(&self.slots))
    }
}

pub struct PoolSlot<T> {
    pool: Arc<SlotPool<T>>,
    item: Option<T>,
}

impl<T> Deref for PoolSlot<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().unwrap_or_else(|| unreachable!("slot emptied before drop"))
    }
}

impl<T> DerefMut for PoolSlot<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!("slot emptied before drop"))
    }
}

impl<T> Drop for PoolSlot<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            lock_coarse(&self.pool.slots).push(item);
        }
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────────

struct AttachedFifo {
    path: PathBuf,
    file: File,
}

pub struct FifoSink {
    dir:  PathBuf,
    pool: Arc<SlotPool<AttachedFifo>>,
}

impl FifoSink {
    /// Create `streams` FIFOs under `dir` and wait up to `timeout` for a
    /// reader to attach to each.
    pub fn new(dir: &Path, streams: usize, timeout: Duration) -> Result<Self, SinkError> {
        fs::create_dir_all(dir).map_err(|source| SinkError::Init { path: dir.to_path_buf(), source })?;

        let paths: Vec<PathBuf> = (0..streams).map(|i| fifo_path(dir, i)).collect();
        for (i, path) in paths.iter().enumerate() {
            if let Err(source) = make_fifo(path) {
                if source.kind() == io::ErrorKind::AlreadyExists {
                    warn!(path = %path.display(), "FIFO already exists; is another backup running?");
                } else {
                    remove_fifos(&paths[..i]);
                }
                return Err(SinkError::Init { path: path.clone(), source });
            }
        }

        let mut attached = Vec::with_capacity(streams);
        for path in &paths {
            match open_for_write_with_timeout(path, timeout) {
                Ok(file) => attached.push(AttachedFifo { path: path.clone(), file }),
                Err(e) => {
                    drop(attached);
                    remove_fifos(&paths);
                    return Err(e);
                }
            }
        }
        // Hand out thread_0 first.
        attached.reverse();
        debug!(dir = %dir.display(), streams, "FIFO pool ready");
        Ok(Self { dir: dir.to_path_buf(), pool: SlotPool::new(attached) })
    }

    pub fn capacity(&self) -> usize { self.pool.capacity() }

    pub fn available(&self) -> usize { self.pool.available() }
}

impl Datasink for FifoSink {
    fn name(&self) -> &'static str { "fifo" }

    fn open(&self, path: &str, _stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        let slot = self
            .pool
            .acquire()
            .ok_or(SinkError::PoolExhausted { capacity: self.pool.capacity() })?;
        let fifo = slot.path.to_string_lossy().into_owned();
        debug!(path, fifo = %fifo, "FIFO stream assigned");
        Ok(Box::new(FifoFile { path: fifo, slot: Some(slot) }))
    }

    fn deinit(&self) -> Result<(), SinkError> {
        let fifos = self.pool.drain();
        if fifos.len() != self.pool.capacity() {
            return Err(SinkError::PoolLeak { expected: self.pool.capacity(), actual: fifos.len() });
        }
        debug!(dir = %self.dir.display(), "FIFO pool closed");
        Ok(())
    }
}

pub struct FifoFile {
    path: String,
    slot: Option<PoolSlot<AttachedFifo>>,
}

impl DsFile for FifoFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        let slot = self.slot.as_mut().ok_or_else(|| SinkError::Closed(self.path.clone()))?;
        slot.file.write_all(buf).map_err(|e| SinkError::io(&self.path, e))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        // Dropping the slot returns the still-open FIFO to the pool.
        self.slot.take();
        Ok(())
    }
}

// ── FIFO attach helpers ──────────────────────────────────────────────────────

pub fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn remove_fifos(paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}

fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is owned by `file` and open for the duration of both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open `path` non-blocking, retrying once per interval while `retryable`
/// holds, for at most `timeout`.
fn open_with_retry(
    path: &Path,
    opts: &OpenOptions,
    timeout: Duration,
    retryable: impl Fn(&io::Error) -> bool,
) -> Result<File, SinkError> {
    let attempts = timeout.as_secs().max(1);
    let mut attempt = 0;
    loop {
        match opts.open(path) {
            Ok(file) => return Ok(file),
            Err(e) if retryable(&e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(SinkError::Timeout { path: path.to_path_buf(), secs: timeout.as_secs() });
                }
                thread::sleep(RETRY_INTERVAL.min(timeout));
            }
            Err(source) => return Err(SinkError::Open { path: path.to_path_buf(), source }),
        }
    }
}

/// Attach to `path` as its writer.  Opening a FIFO for writing fails with
/// `ENXIO` until a reader exists, so the open is retried up to `timeout`.
pub fn open_for_write_with_timeout(path: &Path, timeout: Duration) -> Result<File, SinkError> {
    let mut opts = OpenOptions::new();
    opts.write(true).custom_flags(libc::O_NONBLOCK);
    let mut file = open_with_retry(path, &opts, timeout, |e| {
        matches!(e.raw_os_error(), Some(libc::ENXIO) | Some(libc::ENOENT))
    })?;

    let open_err = |source| SinkError::Open { path: path.to_path_buf(), source };
    set_blocking(&file).map_err(open_err)?;
    // Wakes the reader, which waits for readable data before going blocking.
    file.write_all(&[FIFO_CONTROL_BYTE]).map_err(open_err)?;
    debug!(path = %path.display(), "FIFO attached for writing");
    Ok(file)
}

/// Attach to `path` as its reader and wait up to `timeout` for the writer's
/// control byte.
pub fn open_for_read_with_timeout(path: &Path, timeout: Duration) -> Result<File, SinkError> {
    let mut opts = OpenOptions::new();
    opts.read(true).custom_flags(libc::O_NONBLOCK);
    let mut file = open_with_retry(path, &opts, timeout, |e| e.kind() == io::ErrorKind::NotFound)?;

    let open_err = |source| SinkError::Open { path: path.to_path_buf(), source };
    let deadline = Instant::now() + timeout;
    loop {
        let mut pfd = libc::pollfd { fd: file.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let left = deadline.saturating_duration_since(Instant::now());
        let millis = left.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: `pfd` is a valid pollfd for the single descriptor passed.
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ready > 0 {
            break;
        }
        if ready == 0 {
            return Err(SinkError::Timeout { path: path.to_path_buf(), secs: timeout.as_secs() });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(open_err(err));
        }
    }

    set_blocking(&file).map_err(open_err)?;
    let mut control = [0u8; 1];
    file.read_exact(&mut control).map_err(open_err)?;
    if control[0] != FIFO_CONTROL_BYTE {
        return Err(open_err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected FIFO control byte {:#04x}", control[0]),
        )));
    }
    debug!(path = %path.display(), "FIFO attached for reading");
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_lends_until_empty_and_refills_on_drop() {
        let pool = SlotPool::new(vec![1u32, 2]);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(*a + *b, 3);
        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().unwrap();
        drop((b, c));
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn fifo_names_are_fixed() {
        assert_eq!(fifo_path(Path::new("/s"), 3), PathBuf::from("/s/thread_3"));
    }

    #[test]
    fn existing_fifo_is_an_init_error() {
        let dir = tempfile::tempdir().unwrap();
        make_fifo(&fifo_path(dir.path(), 0)).unwrap();
        let err = FifoSink::new(dir.path(), 1, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, SinkError::Init { .. }));
    }

    #[test]
    fn writer_without_reader_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = FifoSink::new(dir.path(), 1, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, SinkError::Timeout { secs: 1, .. }));
        assert!(!fifo_path(dir.path(), 0).exists());
    }
}
