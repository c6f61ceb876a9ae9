//! Channel handlers.
//!
//! One handler per [`Channel`]; dispatch is a `match` over [`ChannelHandler`].
//! Handlers only deliver. They never touch the record store, so every state
//! transition stays with the dispatch orchestrator and the retry job.

mod email;
mod push;
mod sms;

pub use email::{EmailConfig, EmailHandler};
pub use push::PushHandler;
pub use sms::SmsHandler;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::{BillingNotificationMessage, Channel};
use crate::{Error, Result};

/// Why a handler could not deliver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("{channel} transport failure on attempt {attempt}: {reason}")]
    Transport {
        channel: Channel,
        attempt: u32,
        reason: String,
    },

    #[error("{channel} relay rejected the message with status {status}")]
    Rejected { channel: Channel, status: u16 },

    #[error("no {0} recipient on the message")]
    MissingRecipient(Channel),
}

/// Per-handler invocation counter.
#[derive(Debug, Clone, Default)]
pub struct HandlerStats {
    calls: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl HandlerStats {
    fn record(&self, ok: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

pub enum ChannelHandler {
    Email(EmailHandler),
    Sms(SmsHandler),
    Push(PushHandler),
}

impl ChannelHandler {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Email(_) => Channel::Email,
            Self::Sms(_) => Channel::Sms,
            Self::Push(_) => Channel::Push,
        }
    }

    pub fn stats(&self) -> &HandlerStats {
        match self {
            Self::Email(h) => &h.stats,
            Self::Sms(h) => &h.stats,
            Self::Push(h) => &h.stats,
        }
    }

    /// Deliver `message`. `delivery_attempt` is 1 for a first delivery.
    pub async fn handle(
        &self,
        message: &BillingNotificationMessage,
        trace_id: &str,
        delivery_attempt: u32,
    ) -> std::result::Result<(), DeliveryError> {
        let result = match self {
            Self::Email(h) => h.send(message, trace_id, delivery_attempt).await,
            Self::Sms(h) => h.send(message, trace_id, delivery_attempt).await,
            Self::Push(h) => h.send(message, trace_id, delivery_attempt).await,
        };
        self.stats().record(result.is_ok());
        result
    }
}

/// The full set of handlers, one per channel.
pub struct ChannelHandlers {
    email: ChannelHandler,
    sms: ChannelHandler,
    push: ChannelHandler,
}

impl ChannelHandlers {
    pub fn new(email: EmailHandler, sms: SmsHandler, push: PushHandler) -> Self {
        Self {
            email: ChannelHandler::Email(email),
            sms: ChannelHandler::Sms(sms),
            push: ChannelHandler::Push(push),
        }
    }

    pub fn from_config(email: EmailConfig) -> Result<Self> {
        Ok(Self::new(
            EmailHandler::new(email)?,
            SmsHandler::new(),
            PushHandler::new(),
        ))
    }

    pub fn for_channel(&self, channel: Channel) -> &ChannelHandler {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::Push => &self.push,
        }
    }

    /// Look a handler up by its wire name, failing on anything unknown.
    pub fn resolve_by_name(&self, name: &str) -> Result<&ChannelHandler> {
        Channel::parse(name)
            .map(|channel| self.for_channel(channel))
            .ok_or_else(|| Error::UnknownChannel(name.to_string()))
    }
}
