use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{Job, JobState, JobStatus};

const JOB_COLUMNS: &str = "id, status, params, result, error, created_at, updated_at";

/// Raw row of `prediction_jobs`.
#[derive(Debug, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub status: String,
    pub params: serde_json::Value,
    pub result: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("row {id} is inconsistent: {reason}")]
pub struct CorruptRow {
    pub id: Uuid,
    pub reason: String,
}

impl TryFrom<JobRow> for Job {
    type Error = CorruptRow;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status).map_err(|_| CorruptRow {
            id: row.id,
            reason: format!("unknown status '{}'", row.status),
        })?;
        let state = JobState::from_columns(status, row.result, row.error).map_err(|e| CorruptRow {
            id: row.id,
            reason: e.to_string(),
        })?;

        Ok(Job {
            id: row.id,
            state,
            params: row.params,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Insert a job, or update its state if it exists and is not terminal.
/// `params` and `created_at` are never rewritten.
pub async fn upsert_job(pool: &PgPool, job: &Job) -> Result<(), sqlx::Error> {
    upsert_jobs(pool, std::slice::from_ref(job)).await
}

/// Multi-row form of [`upsert_job`]. Ids must be unique within `jobs`.
pub async fn upsert_jobs(pool: &PgPool, jobs: &[Job]) -> Result<(), sqlx::Error> {
    if jobs.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO prediction_jobs (id, status, params, result, error, created_at, updated_at) ",
    );
    builder.push_values(jobs, |mut row, job| {
        row.push_bind(job.id)
            .push_bind(job.status().to_string())
            .push_bind(job.params.clone())
            .push_bind(job.state.result())
            .push_bind(job.state.error().map(str::to_owned))
            .push_bind(job.created_at)
            .push_bind(job.updated_at);
    });
    builder.push(
        r#"
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            result = EXCLUDED.result,
            error = EXCLUDED.error,
            updated_at = EXCLUDED.updated_at
        WHERE prediction_jobs.status NOT IN ('Done', 'Failed')
        "#,
    );

    builder.build().execute(pool).await?;
    Ok(())
}

/// Get a job row by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM prediction_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// Get every existing row among `ids`.
pub async fn get_jobs(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<JobRow>, sqlx::Error> {
    sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM prediction_jobs WHERE id = ANY($1)"
    ))
    .bind(ids)
    .fetch_all(pool)
    .await
}

/// Pending jobs not updated since `older_than`, least recently updated first.
pub async fn get_stale_pending_jobs(
    pool: &PgPool,
    older_than: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<JobRow>, sqlx::Error> {
    sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM prediction_jobs
        WHERE status = 'Pending' AND updated_at < $1
        ORDER BY updated_at ASC
        LIMIT $2
        "#
    ))
    .bind(older_than)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Bump `updated_at` on the still-Pending rows among `ids`.
pub async fn touch_pending_jobs(
    pool: &PgPool,
    ids: &[Uuid],
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE prediction_jobs SET updated_at = $2 WHERE id = ANY($1) AND status = 'Pending'",
    )
    .bind(ids)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
