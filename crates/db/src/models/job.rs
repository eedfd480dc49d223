//! Attack job entity models and DTOs.

use crackq_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::status::StatusId;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub owner_id: DbId,
    pub target_id: DbId,
    pub wordlist_path: String,
    pub hash_mode: i32,
    pub status_id: StatusId,
    pub progress_percent: f64,
    pub progress_meta: serde_json::Value,
    pub depends_on: Vec<DbId>,
    pub scheduled_at: Option<Timestamp>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

/// Structured progress metadata stored in `jobs.progress_meta` and sent to
/// clients alongside the percentage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetadata {
    /// Coarse stage, e.g. `starting`, `running`, `finalizing`, `cancelled`.
    pub stage: String,
    /// Free-text description of the current action.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_hps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_total: Option<u64>,
}

impl ProgressMetadata {
    pub fn stage(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Terminal result stored in `jobs.result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub credential_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// DTO for creating an attack job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAttackJob {
    pub owner_id: DbId,
    pub target_id: DbId,
    pub wordlist_path: String,
    pub hash_mode: i32,
    #[serde(default)]
    pub depends_on: Vec<DbId>,
    pub scheduled_at: Option<Timestamp>,
}
