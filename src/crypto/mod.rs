//! AES-256-GCM encryption and Argon2id key derivation for encrypted streams.
//!
//! Key derivation: Argon2id(passphrase, salt) → 32-byte key, once per stage.
//! Every sink `write` becomes one self-contained frame:
//!
//! ```text
//! MAGIC(8) | SALT(16) | BODY_LEN(8,BE) | nonce(12) | ciphertext | GCM tag(16)
//! ```
//!
//! `BODY_LEN` counts the nonce, ciphertext and tag.  Carrying the salt in
//! every frame lets a reader derive the key from the first frame it sees.

use argon2::{Argon2, Algorithm, Version, Params};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::Aes256Gcm;
use thiserror::Error;

/// Byte length of the AES-GCM nonce prepended to every encrypted payload.
pub const NONCE_LEN: usize = 12;

/// Byte length of the GCM authentication tag.
pub const TAG_LEN: usize = 16;

pub const SALT_LEN: usize = 16;

pub const FRAME_MAGIC: &[u8; 8] = b"XBCRYPT1";

/// Magic + salt + body length.
pub const FRAME_HEADER_LEN: usize = 8 + SALT_LEN + 8;

/// Frames larger than this are treated as corruption.
pub const MAX_FRAME_BODY: u64 = 1 << 31;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: wrong password or corrupted data")]
    DecryptionFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Encrypted payload too short (minimum {} bytes)", NONCE_LEN + TAG_LEN)]
    TooShort,
    #[error("Stream is encrypted but no key was provided")]
    MissingKey,
    #[error("Bad encrypted frame: {0}")]
    BadFrame(String),
}

/// Derive a 256-bit encryption key from a passphrase and a salt using Argon2id.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(19 * 1024, 2, 1, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// A fresh random salt.
pub fn new_salt() -> [u8; SALT_LEN] {
    *uuid::Uuid::new_v4().as_bytes()
}

/// Encrypt `plaintext` with AES-256-GCM using a random nonce.
///
/// Returns `nonce (12 B) || ciphertext || GCM-tag (16 B)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an AES-256-GCM payload produced by [`encrypt`].
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = aes_gcm::Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt `plaintext` into one complete frame.
pub fn seal_frame(key: &[u8; 32], salt: &[u8; SALT_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let body = encrypt(key, plaintext)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(FRAME_MAGIC);
    frame.extend_from_slice(salt);
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub salt:     [u8; SALT_LEN],
    pub body_len: usize,
}

impl FrameHeader {
    /// Parse a frame header from the front of `buf`.  `Ok(None)` means more
    /// bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, CryptoError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        if &buf[..8] != FRAME_MAGIC {
            return Err(CryptoError::BadFrame("wrong magic".into()));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[8..8 + SALT_LEN]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[8 + SALT_LEN..FRAME_HEADER_LEN]);
        let body_len = u64::from_be_bytes(len);
        if body_len > MAX_FRAME_BODY || body_len < (NONCE_LEN + TAG_LEN) as u64 {
            return Err(CryptoError::BadFrame(format!("implausible body length {body_len}")));
        }
        Ok(Some(Self { salt, body_len: body_len as usize }))
    }

    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body_len
    }
}
