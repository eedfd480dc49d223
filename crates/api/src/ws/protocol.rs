//! JSON frames exchanged with browser clients.
//!
//! Server frames carry a `type` discriminator from
//! [`crackq_core::job_events`]; client frames are parsed into
//! [`ClientMessage`].

use axum::extract::ws::Message;
use chrono::Utc;
use crackq_core::job_events::{
    CHANNEL_ALL_JOBS, CHANNEL_USER_JOBS, MSG_TYPE_JOB_UPDATE, MSG_TYPE_SYSTEM,
};
use crackq_core::types::{DbId, Timestamp};
use crackq_db::models::job::ProgressMetadata;
use serde::{Deserialize, Serialize};

use super::manager::Topic;

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Snapshot of a job's status and progress.
#[derive(Debug, Clone, Serialize)]
pub struct JobUpdate {
    pub id: DbId,
    /// Used to match `user_jobs` subscriptions; not sent to clients.
    #[serde(skip)]
    pub owner_id: Option<DbId>,
    pub status: String,
    pub percentage: f64,
    pub metadata: ProgressMetadata,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Operator-facing notice.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMessage {
    pub message: String,
    pub severity: Severity,
    pub timestamp: Timestamp,
}

impl SystemMessage {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

fn frame<T: Serialize>(kind: &'static str, body: &T) -> Message {
    let text = serde_json::to_string(&Envelope { kind, body }).unwrap_or_else(|e| {
        tracing::error!(error = %e, kind, "Failed to serialize outbound frame");
        String::from("{}")
    });
    Message::Text(text.into())
}

impl JobUpdate {
    pub fn to_message(&self) -> Message {
        frame(MSG_TYPE_JOB_UPDATE, self)
    }
}

impl SystemMessage {
    pub fn to_message(&self) -> Message {
        frame(MSG_TYPE_SYSTEM, self)
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Target of a subscribe/unsubscribe request: either a job or a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(default, alias = "jobId")]
    pub job_id: Option<DbId>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl SubscriptionRequest {
    pub fn topic(&self) -> Result<Topic, String> {
        match (self.job_id, self.channel.as_deref()) {
            (Some(id), None) => Ok(Topic::Job(id)),
            (None, Some(CHANNEL_ALL_JOBS)) => Ok(Topic::AllJobs),
            (None, Some(CHANNEL_USER_JOBS)) => Ok(Topic::UserJobs),
            (None, Some(other)) => Err(format!("Unknown channel: {other}")),
            (Some(_), Some(_)) => Err("Specify either jobId or channel, not both".into()),
            (None, None) => Err("Specify jobId or channel".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscriptionRequest),
    Unsubscribe(SubscriptionRequest),
    Pong {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
