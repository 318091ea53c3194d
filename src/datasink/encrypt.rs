//! Encrypting Sink.  Each `write` is sealed into one AES-256-GCM frame; the
//! key is derived once per stage and its salt travels in every frame.

use std::sync::Arc;

use tracing::debug;

use crate::crypto::{derive_key, new_salt, seal_frame, SALT_LEN};
use super::{Datasink, DsFile, FileStat, Pipe, SinkError};

/// Extension appended to encrypted files.
pub const ENCRYPT_SUFFIX: &str = ".xbcrypt";

pub struct EncryptSink {
    key:  Arc<[u8; 32]>,
    salt: [u8; SALT_LEN],
    pipe: Pipe,
}

impl EncryptSink {
    pub fn new(passphrase: &str) -> Result<Self, SinkError> {
        let salt = new_salt();
        let key = derive_key(passphrase, &salt)?;
        Ok(Self { key: Arc::new(key), salt, pipe: Pipe::default() })
    }
}

impl Datasink for EncryptSink {
    fn name(&self) -> &'static str { "encrypt" }

    fn open(&self, path: &str, stat: &FileStat) -> Result<Box<dyn DsFile>, SinkError> {
        let dest_path = format!("{path}{ENCRYPT_SUFFIX}");
        let dest = self.pipe.get(self.name())?.open(&dest_path, stat)?;
        debug!(path = %dest_path, "encrypted file opened");
        Ok(Box::new(EncryptFile {
            path: dest_path,
            dest,
            key: Arc::clone(&self.key),
            salt: self.salt,
            closed: false,
        }))
    }

    fn set_pipe(&self, pipe: Arc<dyn Datasink>) {
        self.pipe.set(pipe);
    }
}

pub struct EncryptFile {
    path:   String,
    dest:   Box<dyn DsFile>,
    key:    Arc<[u8; 32]>,
    salt:   [u8; SALT_LEN],
    closed: bool,
}

impl DsFile for EncryptFile {
    fn path(&self) -> &str { &self.path }

    fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed(self.path.clone()));
        }
        if buf.is_empty() {
            return Ok(());
        }
        let frame = seal_frame(&self.key, &self.salt, buf)?;
        self.dest.write(&frame)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.dest.close()
    }
}
