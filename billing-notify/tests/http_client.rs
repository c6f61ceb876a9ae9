//! Handler construction in a fresh process, before anything else has
//! touched TLS.

use std::time::Duration;

use billing_notify::domain::Channel;
use billing_notify::notification::{ChannelHandlers, EmailConfig};

#[test]
fn handlers_build_without_a_preinstalled_tls_provider() {
    assert!(rustls::crypto::CryptoProvider::get_default().is_none());

    let handlers = ChannelHandlers::from_config(EmailConfig {
        latency: Duration::ZERO,
        relay_url: Some("https://relay.invalid/send".to_string()),
        ..EmailConfig::default()
    })
    .unwrap();

    assert_eq!(handlers.for_channel(Channel::Email).channel(), Channel::Email);
    assert!(rustls::crypto::CryptoProvider::get_default().is_some());
}
