//! Repository layer for database access.
//!
//! Each repository is an `async_trait` interface with an sqlx-backed
//! implementation, so pipeline components can be handed fakes in tests.

pub mod bill;
pub mod notification;
pub mod outbox;
pub mod preference;

pub use bill::*;
pub use notification::*;
pub use outbox::*;
pub use preference::*;
