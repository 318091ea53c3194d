//! Extraction Coordinator.
//!
//! Each input stream is read by N workers sharing one [`XbReader`].  A
//! worker parses one chunk under the stream's coarse lock and, before
//! releasing it, takes a ticket from the chunk's File Entry.  Tickets are
//! served in parse order under the entry's own lock, so chunks of one file
//! are applied strictly in stream order while different files are written
//! in parallel, and no worker ever holds the stream lock and an entry lock
//! at the same time.
//!
//! A failing worker raises a shared cancellation flag; the others stop at
//! their next chunk boundary.  Whatever was written before the failure stays
//! on disk.

use std::collections::HashMap;
use std::io::Read;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::chunk::ChunkType;
use crate::codec::CodecId;
use crate::datasink::encrypt::ENCRYPT_SUFFIX;
use crate::datasink::{
    write_sparse_or_dense, Datasink, DecompressSink, DecryptSink, DsFile, FileStat, LocalSink, SinkError,
};
use crate::lock_order::{lock_coarse, lock_fine, wait_fine};
use crate::stream::{safer_name_suffix, Chunk, ReadResult, StreamError, XbReader};

/// Extraction settings.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Worker threads per input stream.
    pub threads:        usize,
    /// Route `.zst` / `.lz4` files through a decompressing stage.
    pub decompress:     bool,
    /// Route `.xbcrypt` files through a decrypting stage.
    pub decrypt_key:    Option<String>,
    /// Accept paths with leading `/` or `..` components.
    pub absolute_names: bool,
    /// Log every extracted file at `info`.
    pub verbose:        bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { threads: 1, decompress: false, decrypt_key: None, absolute_names: false, verbose: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files:  u64,
    pub chunks: u64,
    pub bytes:  u64,
}

#[derive(Default)]
struct Stats {
    files:  AtomicU64,
    chunks: AtomicU64,
    bytes:  AtomicU64,
}

impl Stats {
    fn summary(&self) -> ExtractSummary {
        ExtractSummary {
            files:  self.files.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            bytes:  self.bytes.load(Ordering::Relaxed),
        }
    }
}

// ── Destination routing ──────────────────────────────────────────────────────

/// Stage chains chosen per file by name suffix.
struct Routes {
    plain:        Arc<dyn Datasink>,
    decompress:   Vec<(CodecId, Arc<dyn Datasink>)>,
    decrypt:      Option<Arc<dyn Datasink>>,
    decrypt_then: Vec<(CodecId, Arc<dyn Datasink>)>,
}

impl Routes {
    fn new(target: Arc<dyn Datasink>, opts: &ExtractOptions) -> Self {
        let codecs = if opts.decompress { vec![CodecId::Zstd, CodecId::Lz4] } else { Vec::new() };
        let decompress: Vec<(CodecId, Arc<dyn Datasink>)> = codecs
            .iter()
            .map(|&codec| (codec, piped(Arc::new(DecompressSink::new(codec)), &target)))
            .collect();

        let (decrypt, decrypt_then) = match &opts.decrypt_key {
            Some(key) => {
                let plain = piped(Arc::new(DecryptSink::new(key)), &target);
                let chained = decompress
                    .iter()
                    .map(|(codec, stage)| (*codec, piped(Arc::new(DecryptSink::new(key)), stage)))
                    .collect();
                (Some(plain), chained)
            }
            None => (None, Vec::new()),
        };
        Self { plain: target, decompress, decrypt, decrypt_then }
    }

    fn route(&self, path: &str) -> &Arc<dyn Datasink> {
        let find = |table: &[(CodecId, Arc<dyn Datasink>)], name: &str| {
            CodecId::strip_suffix(name)
                .and_then(|(codec, _)| table.iter().position(|(c, _)| *c == codec))
        };
        if let (Some(decrypt), Some(base)) = (&self.decrypt, path.strip_suffix(ENCRYPT_SUFFIX)) {
            return match find(&self.decrypt_then[..], base) {
                Some(i) => &self.decrypt_then[i].1,
                None => decrypt,
            };
        }
        match find(&self.decompress[..], path) {
            Some(i) => &self.decompress[i].1,
            None => &self.plain,
        }
    }
}

fn piped(stage: Arc<dyn Datasink>, pipe: &Arc<dyn Datasink>) -> Arc<dyn Datasink> {
    stage.set_pipe(Arc::clone(pipe));
    stage
}

// ── Per-stream and per-file state ────────────────────────────────────────────

struct FileEntry {
    path:  String,
    state: Mutex<EntryState>,
    turn:  Condvar,
}

#[derive(Default)]
struct EntryState {
    /// Ticket allowed to apply next.
    serving:     u64,
    next_offset: u64,
    dest:        Option<Box<dyn DsFile>>,
    /// A ticket holder gave up; later tickets must not apply.
    abandoned:   bool,
}

impl FileEntry {
    fn new(path: &str) -> Self {
        Self { path: path.to_owned(), state: Mutex::default(), turn: Condvar::new() }
    }
}

struct Slot {
    entry:       Arc<FileEntry>,
    next_ticket: u64,
}

struct StreamState<R: Read> {
    reader:   XbReader<R>,
    files:    HashMap<String, Slot>,
    finished: bool,
}

struct SharedStream<R: Read> {
    index: usize,
    state: Mutex<StreamState<R>>,
}

// ── Coordinator ──────────────────────────────────────────────────────────────

pub struct Extractor {
    routes: Routes,
    opts:   ExtractOptions,
}

impl Extractor {
    /// Extract into a directory tree rooted at `target_dir`.
    pub fn new(target_dir: &Path, opts: ExtractOptions) -> Result<Self, SinkError> {
        let local: Arc<dyn Datasink> = Arc::new(LocalSink::new(target_dir)?);
        Ok(Self::with_target(local, opts))
    }

    /// Extract into an arbitrary stage.
    pub fn with_target(target: Arc<dyn Datasink>, opts: ExtractOptions) -> Self {
        Self { routes: Routes::new(target, &opts), opts }
    }

    pub fn extract<R: Read + Send>(&self, input: R) -> Result<ExtractSummary, SinkError> {
        self.extract_all(vec![input])
    }

    /// Extract several independent streams at once, each with its own
    /// workers.  Returns the first error any worker hit.
    pub fn extract_all<R: Read + Send>(&self, inputs: Vec<R>) -> Result<ExtractSummary, SinkError> {
        let streams: Vec<SharedStream<R>> = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| SharedStream {
                index,
                state: Mutex::new(StreamState {
                    reader:   XbReader::new(input),
                    files:    HashMap::new(),
                    finished: false,
                }),
            })
            .collect();
        let cancel = AtomicBool::new(false);
        let stats = Stats::default();
        let threads = self.opts.threads.max(1);

        let results: Vec<Result<(), SinkError>> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(streams.len() * threads);
            for stream in &streams {
                for worker in 0..threads {
                    let (cancel, stats) = (&cancel, &stats);
                    handles.push(scope.spawn(move || self.worker(worker, stream, cancel, stats)));
                }
            }
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut first_err = results.into_iter().find_map(Result::err);
        for stream in &streams {
            if let Err(e) = close_unfinished(stream) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                let summary = stats.summary();
                debug!(files = summary.files, chunks = summary.chunks, bytes = summary.bytes, "extraction finished");
                Ok(summary)
            }
        }
    }

    fn worker<R: Read>(
        &self,
        worker: usize,
        stream: &SharedStream<R>,
        cancel: &AtomicBool,
        stats: &Stats,
    ) -> Result<(), SinkError> {
        let mut chunk = Chunk::default();
        loop {
            if cancel.load(Ordering::Acquire) {
                return Ok(());
            }
            let next = self.next_chunk(stream, &mut chunk);
            let res = match next {
                Ok(Some((entry, ticket))) => self.apply_in_turn(&entry, ticket, &chunk, cancel, stats),
                Ok(None) => return Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                cancel.store(true, Ordering::Release);
                error!(stream = stream.index, worker, path = %chunk.path, error = %e, "extraction worker failed");
                return Err(e);
            }
        }
    }

    /// Parse the next chunk under the stream lock and take its ticket.
    /// Chunks of unknown but ignorable type are skipped here.
    fn next_chunk<R: Read>(
        &self,
        stream: &SharedStream<R>,
        chunk: &mut Chunk,
    ) -> Result<Option<(Arc<FileEntry>, u64)>, SinkError> {
        let mut state = lock_coarse(&stream.state);
        loop {
            if state.finished {
                return Ok(None);
            }
            match state.reader.read_chunk(chunk) {
                Ok(ReadResult::Chunk) => {}
                Ok(ReadResult::Eof) => {
                    state.finished = true;
                    return Ok(None);
                }
                Err(e) => {
                    state.finished = true;
                    return Err(e.into());
                }
            }

            if let ChunkType::Unknown(code) = chunk.chunk_type {
                warn!(path = %chunk.path, code, "skipping ignorable chunk of unknown type");
                continue;
            }
            if !self.opts.absolute_names && safer_name_suffix(&chunk.path).1 > 0 {
                state.finished = true;
                return Err(StreamError::AbsolutePath(chunk.path.clone()).into());
            }

            let slot = state.files.entry(chunk.path.clone()).or_insert_with(|| Slot {
                entry:       Arc::new(FileEntry::new(&chunk.path)),
                next_ticket: 0,
            });
            let ticket = slot.next_ticket;
            slot.next_ticket += 1;
            let entry = Arc::clone(&slot.entry);
            if chunk.chunk_type == ChunkType::Eof {
                state.files.remove(&chunk.path);
            }
            return Ok(Some((entry, ticket)));
        }
    }

    /// Wait for `ticket` to be served on `entry`, then apply the chunk.
    fn apply_in_turn(
        &self,
        entry: &FileEntry,
        ticket: u64,
        chunk: &Chunk,
        cancel: &AtomicBool,
        stats: &Stats,
    ) -> Result<(), SinkError> {
        let mut state = lock_fine(&entry.state);
        while state.serving != ticket && !state.abandoned && !cancel.load(Ordering::Acquire) {
            state = wait_fine(&entry.turn, state);
        }
        if state.serving != ticket || state.abandoned || cancel.load(Ordering::Acquire) {
            state.abandoned = true;
            entry.turn.notify_all();
            return Ok(());
        }

        let res = self.apply(&entry.path, &mut state, chunk, stats);
        match res {
            Ok(()) => state.serving += 1,
            Err(_) => state.abandoned = true,
        }
        entry.turn.notify_all();
        res
    }

    fn apply(&self, path: &str, state: &mut EntryState, chunk: &Chunk, stats: &Stats) -> Result<(), SinkError> {
        if chunk.chunk_type.carries_payload() {
            chunk.validate_checksum()?;
            if chunk.offset != state.next_offset {
                return Err(StreamError::OutOfOrder {
                    path:     path.to_owned(),
                    expected: state.next_offset,
                    actual:   chunk.offset,
                }
                .into());
            }
        }

        let dest = match state.dest.take() {
            Some(dest) => dest,
            None => self.routes.route(path).open(path, &FileStat::default())?,
        };
        let dest = state.dest.insert(dest);

        match chunk.chunk_type {
            ChunkType::Payload => dest.write(&chunk.data)?,
            ChunkType::Sparse => write_sparse_or_dense(&mut **dest, &chunk.data, &chunk.sparse_map)?,
            ChunkType::Eof => {
                dest.close()?;
                state.dest = None;
                stats.files.fetch_add(1, Ordering::Relaxed);
                if self.opts.verbose {
                    info!(path, "extracted");
                } else {
                    debug!(path, size = state.next_offset, "file extracted");
                }
            }
            ChunkType::Unknown(_) => {}
        }

        if chunk.chunk_type.carries_payload() {
            state.next_offset += chunk.extent();
            stats.chunks.fetch_add(1, Ordering::Relaxed);
            stats.bytes.fetch_add(chunk.length as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Close files whose EOF chunk never arrived.
fn close_unfinished<R: Read>(stream: &SharedStream<R>) -> Result<(), SinkError> {
    let files = mem::take(&mut lock_coarse(&stream.state).files);
    let mut first_err = None;
    for (path, slot) in files {
        let mut state = lock_fine(&slot.entry.state);
        if let Some(mut dest) = state.dest.take() {
            warn!(path = %path, "stream ended before the file was complete");
            if let Err(e) = dest.close() {
                first_err.get_or_insert(e);
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}
