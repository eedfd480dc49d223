//! Cracked-credential result models.

use crackq_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `cracked_credentials` table. Immutable once written.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CrackedCredential {
    pub id: DbId,
    pub job_id: DbId,
    pub target_id: DbId,
    pub identifier: String,
    pub secret: String,
    pub duration_secs: Option<i64>,
    pub cracked_at: Timestamp,
}

/// Insert DTO produced by the result ingestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCredential {
    pub identifier: String,
    pub secret: String,
}
