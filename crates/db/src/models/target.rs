//! Captured-handshake target models.

use crackq_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::status::StatusId;

/// A row from the `targets` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Target {
    pub id: DbId,
    pub owner_id: DbId,
    pub name: String,
    pub status_id: StatusId,
    /// Raw capture as uploaded, relative to the capture directory.
    pub capture_path: Option<String>,
    /// Converted engine input, relative to the capture directory.
    pub artifact_path: Option<String>,
    #[serde(skip_serializing)]
    pub discovered_secret: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for registering a target.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTarget {
    pub owner_id: DbId,
    pub name: String,
    pub capture_path: Option<String>,
    pub artifact_path: Option<String>,
}
