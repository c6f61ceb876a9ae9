//! Database models for billing-notify.
//!
//! These models map directly to the database schema; conversions into domain
//! types live next to each model.

pub mod bill;
pub mod notification;
pub mod outbox;
pub mod preference;

pub use bill::*;
pub use notification::*;
pub use outbox::*;
pub use preference::*;
