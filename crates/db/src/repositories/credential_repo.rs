//! Repository for the `cracked_credentials` table.

use crackq_core::types::DbId;
use sqlx::PgPool;

use crate::models::credential::{CrackedCredential, NewCredential};

const COLUMNS: &str =
    "id, job_id, target_id, identifier, secret, duration_secs, cracked_at";

pub struct CredentialRepo;

impl CredentialRepo {
    /// Insert one row per entry in a single transaction.
    ///
    /// A redelivered job that ingests the same output again does not
    /// duplicate rows (`uq_cracked_credentials_job_identifier`). Returns
    /// the number of rows actually inserted.
    pub async fn insert_many(
        pool: &PgPool,
        job_id: DbId,
        target_id: DbId,
        entries: &[NewCredential],
        duration_secs: Option<i64>,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut inserted = 0;
        for entry in entries {
            let result = sqlx::query(
                "INSERT INTO cracked_credentials \
                    (job_id, target_id, identifier, secret, duration_secs) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT ON CONSTRAINT uq_cracked_credentials_job_identifier DO NOTHING",
            )
            .bind(job_id)
            .bind(target_id)
            .bind(&entry.identifier)
            .bind(&entry.secret)
            .bind(duration_secs)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn list_for_job(
        pool: &PgPool,
        job_id: DbId,
    ) -> Result<Vec<CrackedCredential>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM cracked_credentials WHERE job_id = $1 ORDER BY id"
        );
        sqlx::query_as::<_, CrackedCredential>(&query)
            .bind(job_id)
            .fetch_all(pool)
            .await
    }
}
