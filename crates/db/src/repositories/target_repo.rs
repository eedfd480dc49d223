//! Repository for the `targets` table.

use crackq_core::types::DbId;
use sqlx::PgPool;

use crate::models::status::{StatusId, TargetStatus};
use crate::models::target::{NewTarget, Target};

const COLUMNS: &str = "\
    id, owner_id, name, status_id, capture_path, artifact_path, \
    discovered_secret, created_at, updated_at";

pub struct TargetRepo;

impl TargetRepo {
    pub async fn create(pool: &PgPool, input: &NewTarget) -> Result<Target, sqlx::Error> {
        let query = format!(
            "INSERT INTO targets (owner_id, name, status_id, capture_path, artifact_path) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Target>(&query)
            .bind(input.owner_id)
            .bind(&input.name)
            .bind(TargetStatus::Ready.id())
            .bind(&input.capture_path)
            .bind(&input.artifact_path)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Target>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM targets WHERE id = $1");
        sqlx::query_as::<_, Target>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn set_status(
        pool: &PgPool,
        id: DbId,
        status: StatusId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE targets SET status_id = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_discovered_secret(
        pool: &PgPool,
        id: DbId,
        secret: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE targets SET discovered_secret = $2 WHERE id = $1")
            .bind(id)
            .bind(secret)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Record the converted engine input and mark the target ready.
    pub async fn set_artifact(
        pool: &PgPool,
        id: DbId,
        artifact_path: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE targets SET artifact_path = $2, status_id = $3 WHERE id = $1")
            .bind(id)
            .bind(artifact_path)
            .bind(TargetStatus::Ready.id())
            .execute(pool)
            .await?;
        Ok(())
    }
}
