//! Postgres-backed job store.
//!
//! Persists job records in a single `jobs` table. Claim atomicity is
//! enforced at the database level: `claim_next` selects the next ready row
//! with `FOR UPDATE SKIP LOCKED` and transitions it to active in the same
//! statement, so no two workers (in this process or any other) can claim
//! the same job.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `JobStoreError` as follows: a unique-key
//! violation (PostgreSQL code `23505`) on insert becomes `AlreadyExists`;
//! everything else (pool closed, network failures, decode errors) becomes
//! `Storage` with the failing operation named in the message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::store::{JobStore, JobStoreError};
use super::types::{BackoffStrategy, Job, JobId, JobStats, JobStatus, RetentionPolicy, RetryPolicy};

/// Postgres-backed durable job store.
///
/// Cheap to clone; all clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to the given endpoint and create the schema if needed.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the `jobs` table and its claim index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id                    UUID PRIMARY KEY,
                payload               JSONB NOT NULL,
                priority              INT NOT NULL,
                status                TEXT NOT NULL,
                attempt               INT NOT NULL,
                max_attempts          INT NOT NULL,
                backoff_strategy      TEXT NOT NULL,
                backoff_delay_ms      BIGINT NOT NULL,
                remove_on_complete_ms BIGINT NULL,
                remove_on_fail_ms     BIGINT NULL,
                last_error            TEXT NULL,
                stalled_count         INT NOT NULL,
                created_at            TIMESTAMPTZ NOT NULL,
                updated_at            TIMESTAMPTZ NOT NULL,
                scheduled_at          TIMESTAMPTZ NULL,
                finished_at           TIMESTAMPTZ NULL,
                heartbeat_at          TIMESTAMPTZ NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS jobs_claim_idx ON jobs (status, priority, created_at)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, payload, priority, status, attempt, max_attempts,
                backoff_strategy, backoff_delay_ms,
                remove_on_complete_ms, remove_on_fail_ms,
                last_error, stalled_count,
                created_at, updated_at, scheduled_at, finished_at, heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.attempt as i32)
        .bind(job.retry.max_attempts as i32)
        .bind(encode_strategy(job.retry.strategy))
        .bind(job.retry.base_delay.as_millis() as i64)
        .bind(encode_retention(job.remove_on_complete))
        .bind(encode_retention(job.remove_on_fail))
        .bind(&job.last_error)
        .bind(job.stalled_count as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(job.finished_at)
        .bind(job.heartbeat_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                payload = $2,
                priority = $3,
                status = $4,
                attempt = $5,
                last_error = $6,
                stalled_count = $7,
                updated_at = $8,
                scheduled_at = $9,
                finished_at = $10,
                heartbeat_at = $11
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.attempt as i32)
        .bind(&job.last_error)
        .bind(job.stalled_count as i32)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(job.finished_at)
        .bind(job.heartbeat_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id FROM jobs
                WHERE status = 'waiting'
                   OR (status = 'delayed' AND scheduled_at <= $1)
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs SET
                status = 'active',
                attempt = attempt + 1,
                scheduled_at = NULL,
                heartbeat_at = $1,
                updated_at = $1
            FROM next
            WHERE jobs.id = next.id
            RETURNING jobs.*
            "#,
        )
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        sqlx::query(
            "UPDATE jobs SET heartbeat_at = $2, updated_at = $2 WHERE id = $1 AND status = 'active'",
        )
        .bind(job_id.0)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(())
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status = 'active'
              AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            ORDER BY heartbeat_at ASC NULLS FIRST
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stalled", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed')
              AND finished_at IS NOT NULL
              AND (CASE WHEN status = 'completed'
                        THEN remove_on_complete_ms
                        ELSE remove_on_fail_ms END) IS NOT NULL
              AND finished_at
                  + (CASE WHEN status = 'completed'
                          THEN remove_on_complete_ms
                          ELSE remove_on_fail_ms END) * INTERVAL '1 millisecond'
                  <= $1
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_expired", e))?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE status = 'waiting'
                       OR (status = 'delayed' AND scheduled_at <= $1)
                ) AS waiting,
                COUNT(*) FILTER (
                    WHERE status = 'delayed' AND scheduled_at > $1
                ) AS delayed,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
            FROM jobs
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |name: &str| -> Result<usize, JobStoreError> {
            let value: i64 = row
                .try_get(name)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as usize)
        };

        Ok(JobStats {
            waiting: count("waiting")?,
            active: count("active")?,
            completed: count("completed")?,
            failed: count("failed")?,
            delayed: count("delayed")?,
            total: count("total")?,
        })
    }
}

fn encode_strategy(strategy: BackoffStrategy) -> &'static str {
    match strategy {
        BackoffStrategy::Fixed => "fixed",
        BackoffStrategy::Exponential => "exponential",
    }
}

fn decode_strategy(raw: &str) -> Result<BackoffStrategy, JobStoreError> {
    match raw {
        "fixed" => Ok(BackoffStrategy::Fixed),
        "exponential" => Ok(BackoffStrategy::Exponential),
        other => Err(JobStoreError::Storage(format!(
            "invalid backoff strategy: {other}"
        ))),
    }
}

// Retention is stored as a nullable window: NULL keeps the record, zero
// purges on the next pass, a positive value is the window in milliseconds.
fn encode_retention(policy: RetentionPolicy) -> Option<i64> {
    match policy {
        RetentionPolicy::Keep => None,
        RetentionPolicy::Remove => Some(0),
        RetentionPolicy::After(window) => Some(window.as_millis() as i64),
    }
}

fn decode_retention(raw: Option<i64>) -> RetentionPolicy {
    match raw {
        None => RetentionPolicy::Keep,
        Some(0) => RetentionPolicy::Remove,
        Some(ms) => RetentionPolicy::After(Duration::from_millis(ms.max(0) as u64)),
    }
}

fn decode_status(raw: &str, last_error: Option<&str>) -> Result<JobStatus, JobStoreError> {
    match raw {
        "waiting" => Ok(JobStatus::Waiting),
        "delayed" => Ok(JobStatus::Delayed),
        "active" => Ok(JobStatus::Active),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed {
            error: last_error.unwrap_or_default().to_string(),
        }),
        other => Err(JobStoreError::Storage(format!("invalid job status: {other}"))),
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode", e);

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let status_raw: String = row.try_get("status").map_err(decode)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(decode)?;
    let attempt: i32 = row.try_get("attempt").map_err(decode)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(decode)?;
    let strategy_raw: String = row.try_get("backoff_strategy").map_err(decode)?;
    let backoff_delay_ms: i64 = row.try_get("backoff_delay_ms").map_err(decode)?;
    let stalled_count: i32 = row.try_get("stalled_count").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        payload: row.try_get("payload").map_err(decode)?,
        priority: row.try_get("priority").map_err(decode)?,
        status: decode_status(&status_raw, last_error.as_deref())?,
        retry: RetryPolicy {
            max_attempts: max_attempts.max(0) as u32,
            base_delay: Duration::from_millis(backoff_delay_ms.max(0) as u64),
            strategy: decode_strategy(&strategy_raw)?,
        },
        attempt: attempt.max(0) as u32,
        remove_on_complete: decode_retention(
            row.try_get("remove_on_complete_ms").map_err(decode)?,
        ),
        remove_on_fail: decode_retention(row.try_get("remove_on_fail_ms").map_err(decode)?),
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        scheduled_at: row.try_get("scheduled_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(decode)?,
        stalled_count: stalled_count.max(0) as u32,
        last_error,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e.as_database_error().and_then(|d| d.code()),
        Some(code) if code == "23505"
    )
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{operation}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_encoding_roundtrip() {
        for policy in [
            RetentionPolicy::Keep,
            RetentionPolicy::Remove,
            RetentionPolicy::After(Duration::from_secs(3600)),
        ] {
            assert_eq!(decode_retention(encode_retention(policy)), policy);
        }
    }

    #[test]
    fn strategy_encoding_roundtrip() {
        for strategy in [BackoffStrategy::Fixed, BackoffStrategy::Exponential] {
            assert_eq!(
                decode_strategy(encode_strategy(strategy)).unwrap(),
                strategy
            );
        }
    }

    #[test]
    fn failed_status_carries_the_last_error() {
        let status = decode_status("failed", Some("boom")).unwrap();
        assert_eq!(
            status,
            JobStatus::Failed {
                error: "boom".to_string()
            }
        );
    }

    #[test]
    fn unknown_status_is_a_storage_error() {
        assert!(matches!(
            decode_status("paused", None),
            Err(JobStoreError::Storage(_))
        ));
    }
}
