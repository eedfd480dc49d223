//! Durable queue items and lane kinds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crackq_core::error::CoreError;
use crackq_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which execution lane a queue item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    Attack,
    CaptureProcessing,
    DictionaryBuild,
}

impl LaneKind {
    pub const ALL: [LaneKind; 3] = [
        LaneKind::Attack,
        LaneKind::CaptureProcessing,
        LaneKind::DictionaryBuild,
    ];

    /// Value stored in `job_queue.kind`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attack => "attack",
            Self::CaptureProcessing => "capture",
            Self::DictionaryBuild => "dictionary",
        }
    }
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaneKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attack" => Ok(Self::Attack),
            "capture" => Ok(Self::CaptureProcessing),
            "dictionary" => Ok(Self::DictionaryBuild),
            other => Err(CoreError::Validation(format!("Unknown lane kind: {other}"))),
        }
    }
}

/// A row from the `job_queue` table.
///
/// `subject_id` is the job id for attack items and the target id for
/// capture-processing items; dictionary items carry whatever id their
/// handler understands.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueItem {
    pub id: DbId,
    pub kind: String,
    pub subject_id: DbId,
    pub owner_id: DbId,
    pub attempts: i32,
    pub available_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    /// Lane router holding the claim.
    pub claimed_by: Option<String>,
    /// A claim not renewed by this time may be taken over.
    pub lease_expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl QueueItem {
    pub fn lane(&self) -> Result<LaneKind, CoreError> {
        self.kind.parse()
    }
}

/// DTO for enqueueing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewQueueItem {
    pub kind: LaneKind,
    pub subject_id: DbId,
    pub owner_id: DbId,
}

/// A claim on queue items by one lane router.
///
/// Claims expire `duration` after they are taken or last renewed. Only an
/// expired claim can be taken over by another holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub duration: Duration,
}

impl Lease {
    pub fn new(holder: impl Into<String>, duration: Duration) -> Self {
        Self {
            holder: holder.into(),
            duration,
        }
    }
}
