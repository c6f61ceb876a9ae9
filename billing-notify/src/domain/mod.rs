//! Domain types for the billing notification pipeline.

pub mod channel;
pub mod message;
pub mod preference;
pub mod record;

pub use channel::Channel;
pub use message::{BillingNotificationMessage, dedup_key};
pub use preference::{PreferredSchedule, QuietTimePolicy, QuietWindow, UserChannelPreference};
pub use record::{DEFAULT_MAX_RETRIES, NotificationRecord, NotificationStatus};
