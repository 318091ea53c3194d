//! Decrypting Sink.  Frames may arrive split across any number of writes;
//! keys are derived once per distinct salt and cached for the stage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::crypto::{decrypt, derive_key, CryptoError, FrameHeader, FRAME_HEADER_LEN, SALT_LEN};
use crate::lock_order::lock_fine;
use super::encrypt::ENCRYPT_SUFFIX;
use super::{Datasink, DsFile, FileStat, Pipe, SinkError};

type KeyCache = Mutex<HashMap<[u8; SALT_LEN], Arc<[u8; 32]>>>;

pub struct DecryptSink {
    passphrase: String,
    keys:       Arc<KeyCache>,
    pipe:       Pipe,
}

impl DecryptSink {
    pub fn new(passphrase: &str) -> Self {
        Self { passphrase: passphrase.to_owned(), keys: Arc::default(), pipe: Pipe::default() }
    }
}

impl Datasink for DecryptSink {
    fn name(&self) -> &'static str { "decrypt" }

    fn open(&self, path: &str, stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        let dest_path = path.strip_suffix(ENCRYPT_SUFFIX).unwrap_or(path);
        let dest = self.pipe.get(self.name())?.open(dest_path, stat)?;
        debug!(path = dest_path, "decrypting into");
        Ok(Box::new(DecryptFile {
            path:       path.to_owned(),
            dest,
            passphrase: self.passphrase.clone(),
            keys:       Arc::clone(&self.keys),
            pending:    Vec::new(),
            closed:     false,
        }))
    }

    fn set_pipe(&self, pipe: Arc<dyn Datasink>) {
        self.pipe.set(pipe);
    }
}

pub struct DecryptFile {
    path:       String,
    dest:       Box<dyn DsFile>,
    passphrase: String,
    keys:       Arc<KeyCache>,
    pending:    Vec<u8>,
    closed:     bool,
}

impl DecryptFile {
    fn key_for(&self, salt: &[u8; SALT_LEN]) -> Result<Arc<[u8; 32]>, CryptoError> {
        if let Some(key) = lock_fine(&self.keys).get(salt) {
            return Ok(Arc::clone(key));
        }
        let key = Arc::new(derive_key(&self.passphrase, salt)?);
        Ok(Arc::clone(lock_fine(&self.keys).entry(*salt).or_insert(key)))
    }
}

impl DsFile for DecryptFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed(self.path.clone()));
        }
        self.pending.extend_from_slice(buf);
        let mut pos = 0;
        while let Some(header) = FrameHeader::parse(&self.pending[pos..])? {
            let end = pos + header.frame_len();
            if self.pending.len() < end {
                break;
            }
            let key = self.key_for(&header.salt)?;
            let plain = decrypt(&key, &self.pending[pos + FRAME_HEADER_LEN..end])?;
            self.dest.write(&plain)?;
            pos = end;
        }
        self.pending.drain(..pos);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let leftover = self.pending.len();
        self.dest.close()?;
        if leftover > 0 {
            return Err(CryptoError::BadFrame(format!("{} ends inside a frame ({leftover} bytes)", self.path)).into());
        }
        Ok(())
    }
}
