//! Shared HTTP client construction.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// reqwest is built without a bundled rustls provider; one must be installed
/// process-wide before the first client is built.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build a client with the given request timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Other(format!("Failed to build reqwest client: {}", e)))
}
