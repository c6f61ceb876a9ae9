//! Payload encryption.
//!
//! Broker payloads may be sealed with AES-256-GCM. The sealed form is
//! `base64(nonce || ciphertext)` so it survives text-only transports.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

pub type SharedCipher = Arc<dyn PayloadCipher>;

/// Passes payloads through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl PayloadCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::config(format!(
                "payload encryption key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("invalid key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let key = STANDARD
            .decode(key_b64.trim())
            .map_err(|e| Error::config(format!("invalid PAYLOAD_ENCRYPTION_KEY: {}", e)))?;
        Self::new(&key)
    }
}

impl PayloadCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| Error::Crypto(format!("encrypt failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed).into_bytes())
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let raw = STANDARD
            .decode(sealed)
            .map_err(|e| Error::Crypto(format!("not a sealed payload: {}", e)))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::Crypto("sealed payload too short".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(format!("decrypt failed: {}", e)))
    }
}
