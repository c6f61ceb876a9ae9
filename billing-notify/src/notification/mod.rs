//! The notification dispatch pipeline.
//!
//! Outbox relay -> broker -> dispatch orchestrator -> channel handler, or a
//! delay queue whose drain job re-publishes later. The retry job re-publishes
//! failures and escalates exhausted ones to the dead-letter consumer.

pub mod channels;
pub mod codec;
pub mod consumer;
pub mod dead_letter;
pub mod delay_queue;
pub mod drain;
pub mod idempotency;
pub mod orchestrator;
pub mod outbox_relay;
pub mod resolver;
pub mod retry;

pub use channels::{ChannelHandler, ChannelHandlers, DeliveryError, EmailConfig};
pub use codec::MessageCodec;
pub use consumer::{BatchProcessor, ConsumerConfig, ConsumerLoop};
pub use dead_letter::{DeadLetterProcessor, FallbackReport};
pub use delay_queue::{DelayQueue, QueueKind, QueueStats, QueuedMessage};
pub use drain::{DrainJob, DrainReport};
pub use idempotency::{IdempotencyConfig, IdempotencyGuard, Marker};
pub use orchestrator::{BatchReport, DispatchOrchestrator, DispatchOutcome};
pub use outbox_relay::{OutboxRelay, RelayReport};
pub use resolver::{PreferenceResolver, QuietDecision, QuietSource, ResolverConfig};
pub use retry::{RetryConfig, RetryJob, RetryReport};
