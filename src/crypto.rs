//! AES-256-GCM tile encryption.
//!
//! Encrypted payloads use the envelope
//!
//! ```text
//! ┌───────────┬────────────────────────┐
//! │   Nonce   │   Ciphertext + Tag     │
//! │  12 bytes │       N + 16 bytes     │
//! └───────────┴────────────────────────┘
//! ```
//!
//! with the algorithm id authenticated as associated data. Key management is
//! the caller's business; arrays only receive an [`EncryptionKey`].

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

const AAD: &[u8] = b"tessera/aes-256-gcm";

/// Encryption failures. A wrong key surfaces as [`CryptoError::DecryptFailed`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The object is encrypted but no key was supplied.
    #[error("object is encrypted with {0:?} but no key was supplied")]
    MissingKey(EncryptionType),
    /// A key was supplied for an unencrypted object.
    #[error("encryption key supplied for an unencrypted object")]
    UnexpectedKey,
    /// Unknown encryption type byte.
    #[error("unknown encryption type {0}")]
    UnknownType(u8),
    /// Key material has the wrong length.
    #[error("invalid key length {0}, expected {KEY_LEN}")]
    InvalidKey(usize),
    /// Ciphertext shorter than nonce + tag.
    #[error("ciphertext truncated ({0} bytes)")]
    Truncated(usize),
    /// Encryption failed.
    #[error("encryption failed")]
    EncryptFailed,
    /// Authentication failed: wrong key or tampered ciphertext.
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptFailed,
}

/// Encryption scheme recorded in generic tile headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionType {
    /// Plaintext.
    None,
    /// AES-256-GCM.
    Aes256Gcm,
}

impl EncryptionType {
    /// On-disk discriminant.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Aes256Gcm => 1,
        }
    }

    /// Parse an on-disk discriminant.
    pub fn from_u8(value: u8) -> Result<Self, CryptoError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Aes256Gcm),
            other => Err(CryptoError::UnknownType(other)),
        }
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyBytes([u8; KEY_LEN]);

/// A 32-byte AES-256 key, zeroized on drop and never printed.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: KeyBytes,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl EncryptionKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            bytes: KeyBytes(bytes),
        }
    }

    /// Create a key from a slice, which must be exactly [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(bytes.len()))?;
        Ok(Self::new(array))
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.bytes.0).map_err(|_| CryptoError::InvalidKey(KEY_LEN))
    }

    /// Encrypt `plaintext` into a nonce-prefixed envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: AAD,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt an envelope produced by [`EncryptionKey::encrypt`].
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(envelope.len()));
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: AAD,
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

/// Optional key carried by array handles, writers and readers.
pub(crate) fn encryption_type(key: Option<&EncryptionKey>) -> EncryptionType {
    match key {
        Some(_) => EncryptionType::Aes256Gcm,
        None => EncryptionType::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_wrong_key() {
        let key = EncryptionKey::new([7u8; KEY_LEN]);
        let envelope = key.encrypt(b"tile bytes").expect("encrypt");
        assert_eq!(envelope.len(), NONCE_LEN + 10 + TAG_LEN);
        assert_eq!(key.decrypt(&envelope).expect("decrypt"), b"tile bytes");

        let other = EncryptionKey::new([8u8; KEY_LEN]);
        assert_eq!(other.decrypt(&envelope), Err(CryptoError::DecryptFailed));
        assert_eq!(key.decrypt(&envelope[..10]), Err(CryptoError::Truncated(10)));
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = EncryptionKey::from_slice(&[1u8; KEY_LEN]).expect("key");
        assert!(format!("{key:?}").contains("REDACTED"));
        assert!(matches!(
            EncryptionKey::from_slice(&[0u8; 3]),
            Err(CryptoError::InvalidKey(3))
        ));
    }
}
