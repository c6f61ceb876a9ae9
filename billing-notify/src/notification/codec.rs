//! Wire codec for broker payloads.

use tracing::debug;

use crate::Result;
use crate::crypto::{PlaintextCipher, SharedCipher};
use crate::domain::BillingNotificationMessage;
use std::sync::Arc;

/// Seals messages for the broker and opens whatever comes back.
#[derive(Clone)]
pub struct MessageCodec {
    cipher: SharedCipher,
}

impl MessageCodec {
    pub fn new(cipher: SharedCipher) -> Self {
        Self { cipher }
    }

    pub fn plaintext() -> Self {
        Self::new(Arc::new(PlaintextCipher))
    }

    pub fn seal(&self, message: &BillingNotificationMessage) -> Result<Vec<u8>> {
        self.seal_raw(message.to_json()?.as_bytes())
    }

    /// Seal an already serialized payload, e.g. an outbox row.
    pub fn seal_raw(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.cipher.encrypt(payload)
    }

    /// Decrypt and deserialize. Payloads that do not decrypt are read as
    /// plaintext, which keeps messages produced before encryption readable.
    pub fn open(&self, payload: &[u8]) -> Result<BillingNotificationMessage> {
        let plain = match self.cipher.decrypt(payload) {
            Ok(plain) => plain,
            Err(e) => {
                debug!("Payload did not decrypt ({}), reading as plaintext", e);
                payload.to_vec()
            }
        };
        Ok(BillingNotificationMessage::from_json(&plain)?)
    }
}
