#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use xbstream::datasink::{Datasink, DsFile, FileStat, SinkError};
use xbstream::XbWriter;

/// In-memory terminal stage: every opened path maps to the bytes written to it.
#[derive(Clone, Default)]
pub struct Capture {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl Capture {
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }
}

impl Datasink for Capture {
    fn name(&self) -> &'static str { "capture" }

    fn open(&self, path: &str, _stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        self.files.lock().unwrap().insert(path.to_owned(), Vec::new());
        Ok(Box::new(CaptureFile { path: path.to_owned(), files: Arc::clone(&self.files) }))
    }
}

struct CaptureFile {
    path:  String,
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl DsFile for CaptureFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        self.files.lock().unwrap().get_mut(&self.path).unwrap().extend_from_slice(buf);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> { Ok(()) }
}

/// Encode `files` onto one stream, all open at once, writing `piece` bytes
/// of each file in turn so their chunks interleave.
pub fn encode_interleaved(files: &[(String, Vec<u8>)], chunk_size: usize, piece: usize) -> Vec<u8> {
    let writer = Arc::new(XbWriter::with_chunk_size(Vec::new(), chunk_size));
    let mut open: Vec<_> = files.iter().map(|(name, _)| writer.open(name).unwrap()).collect();
    let piece = piece.max(1);
    let mut pos = 0;
    loop {
        let mut wrote = false;
        for (f, (_, data)) in open.iter_mut().zip(files) {
            if pos < data.len() {
                f.write(&data[pos..(pos + piece).min(data.len())]).unwrap();
                wrote = true;
            }
        }
        if !wrote {
            break;
        }
        pos += piece;
    }
    for f in &mut open {
        f.close().unwrap();
    }
    drop(open);
    Arc::try_unwrap(writer).ok().unwrap().into_inner()
}
