//! crackq event bus and notification hand-off.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`PlatformEvent`]: the canonical domain event envelope.
//! - [`NotificationRequest`]: typed request for the external notification
//!   dispatcher, carried on the bus as a `PlatformEvent`.
//! - [`EventPersistence`]: background service that durably writes every
//!   event to the `events` table, where the dispatcher picks them up.

pub mod bus;
pub mod persistence;

pub use bus::{EventBus, NotificationKind, NotificationRequest, PlatformEvent};
pub use persistence::EventPersistence;
