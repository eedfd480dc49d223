//! Client protocol and platform event name constants.
//!
//! The `MSG_TYPE_*` values are the `type` discriminators of JSON frames
//! exchanged over the WebSocket; the `EVENT_*` values are event names
//! published on the event bus for the notification dispatcher.

/// Server -> client: a job's status/progress snapshot.
pub const MSG_TYPE_JOB_UPDATE: &str = "job_update";

/// Server -> client: an operator-facing system message.
pub const MSG_TYPE_SYSTEM: &str = "system";

/// Client -> server: subscribe to a job or channel.
pub const MSG_TYPE_SUBSCRIBE: &str = "subscribe";

/// Client -> server: drop a job or channel subscription.
pub const MSG_TYPE_UNSUBSCRIBE: &str = "unsubscribe";

/// Client -> server: application-level liveness reply.
pub const MSG_TYPE_PONG: &str = "pong";

/// Channel receiving every job update.
pub const CHANNEL_ALL_JOBS: &str = "all_jobs";

/// Channel receiving updates for jobs owned by the connection's user.
pub const CHANNEL_USER_JOBS: &str = "user_jobs";

/// An attack recovered at least one secret.
pub const EVENT_ATTACK_CRACKED: &str = "attack.cracked";

/// An attack ended on an error path without recovering anything.
pub const EVENT_ATTACK_FAILED: &str = "attack.failed";

/// A capture was converted into engine input.
pub const EVENT_CAPTURE_PROCESSED: &str = "capture.processed";
