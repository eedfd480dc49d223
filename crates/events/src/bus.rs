//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` across the application.

use chrono::{DateTime, Utc};
use crackq_core::job_events::{EVENT_ATTACK_CRACKED, EVENT_ATTACK_FAILED, EVENT_CAPTURE_PROCESSED};
use crackq_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// PlatformEvent
// ---------------------------------------------------------------------------

/// A domain event that occurred on the platform.
///
/// Constructed via [`PlatformEvent::new`] and enriched with the builder
/// methods [`with_source`](PlatformEvent::with_source),
/// [`with_actor`](PlatformEvent::with_actor), and
/// [`with_payload`](PlatformEvent::with_payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    /// Dot-separated event name, e.g. `"attack.cracked"`.
    pub event_type: String,

    /// Optional source entity kind (e.g. `"job"`, `"target"`).
    pub source_entity_type: Option<String>,

    pub source_entity_id: Option<DbId>,

    /// For notifications, the recipient user.
    pub actor_user_id: Option<DbId>,

    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl PlatformEvent {
    /// Create a new event with only the required `event_type`.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source_entity_type: None,
            source_entity_id: None,
            actor_user_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, entity_type: impl Into<String>, entity_id: DbId) -> Self {
        self.source_entity_type = Some(entity_type.into());
        self.source_entity_id = Some(entity_id);
        self
    }

    pub fn with_actor(mut self, user_id: DbId) -> Self {
        self.actor_user_id = Some(user_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// NotificationRequest
// ---------------------------------------------------------------------------

/// What the notification dispatcher should tell the recipient about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// An attack recovered at least one secret.
    AttackCracked,
    /// An attack ended on an error path.
    AttackFailed,
    /// A raw capture was converted and is ready to attack.
    CaptureProcessed,
}

impl NotificationKind {
    pub fn event_type(self) -> &'static str {
        match self {
            Self::AttackCracked => EVENT_ATTACK_CRACKED,
            Self::AttackFailed => EVENT_ATTACK_FAILED,
            Self::CaptureProcessed => EVENT_CAPTURE_PROCESSED,
        }
    }

    fn source_entity(self) -> &'static str {
        match self {
            Self::AttackCracked | Self::AttackFailed => "job",
            Self::CaptureProcessed => "target",
        }
    }
}

/// Typed request handed to the external dispatcher, which owns rendering,
/// delivery and retry.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub recipient_id: DbId,
    /// Job id for attack notifications, target id for capture ones.
    pub subject_id: DbId,
    pub payload: serde_json::Value,
}

impl NotificationRequest {
    pub fn new(kind: NotificationKind, recipient_id: DbId, subject_id: DbId) -> Self {
        Self {
            kind,
            recipient_id,
            subject_id,
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn into_event(self) -> PlatformEvent {
        PlatformEvent::new(self.kind.event_type())
            .with_source(self.kind.source_entity(), self.subject_id)
            .with_actor(self.recipient_id)
            .with_payload(self.payload)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use crackq_events::bus::{EventBus, PlatformEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(PlatformEvent::new("capture.processed"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: PlatformEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Publish a notification request for the dispatcher.
    pub fn notify(&self, request: NotificationRequest) {
        tracing::debug!(
            kind = ?request.kind,
            recipient_id = request.recipient_id,
            subject_id = request.subject_id,
            "Notification requested"
        );
        self.publish(request.into_event());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
