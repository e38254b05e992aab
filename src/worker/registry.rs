use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;
use uuid::Uuid;

/// A registered worker process, with liveness derived from its heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerProcess {
    pub id: Uuid,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    /// `last_heartbeat + 3·expected_heartbeat_interval > now()`
    pub live: bool,
}

/// Per-vectorizer progress, one row per vectorizer.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerProgress {
    pub vectorizer_id: i64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_success_process_id: Option<Uuid>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_process_id: Option<Uuid>,
    pub last_error_message: Option<String>,
    pub success_count: i64,
    pub error_count: i64,
}

/// Register this process and return its id.
pub async fn worker_start(
    client: &Client,
    version: &str,
    expected_heartbeat_interval: Duration,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    client
        .execute(
            "INSERT INTO vectorizer.vectorizer_worker_process \
             (id, version, expected_heartbeat_interval) \
             VALUES ($1, $2, make_interval(secs => $3))",
            &[&id, &version, &expected_heartbeat_interval.as_secs_f64()],
        )
        .await
        .context("Failed to register worker process")?;
    Ok(id)
}

/// Bump heartbeat and cumulative counters since the last beat.
pub async fn worker_heartbeat(
    client: &Client,
    worker_id: Uuid,
    successes_delta: i64,
    errors_delta: i64,
    error: Option<&str>,
) -> anyhow::Result<()> {
    client
        .execute(
            "UPDATE vectorizer.vectorizer_worker_process SET \
             last_heartbeat = clock_timestamp(), \
             heartbeat_count = heartbeat_count + 1, \
             success_count = success_count + $2, \
             error_count = error_count + $3, \
             last_error_at = CASE WHEN $4::text IS NULL THEN last_error_at \
                                  ELSE clock_timestamp() END, \
             last_error_message = coalesce($4, last_error_message) \
             WHERE id = $1",
            &[&worker_id, &successes_delta, &errors_delta, &error],
        )
        .await
        .context("Failed to write worker heartbeat")?;
    Ok(())
}

/// Upsert the per-vectorizer progress row. A null error routes the write to
/// the `last_success_*` fields; an error increments the error side.
pub async fn worker_progress(
    client: &Client,
    worker_id: Uuid,
    vectorizer_id: i64,
    successes: i64,
    error: Option<&str>,
) -> anyhow::Result<()> {
    client
        .execute(
            "INSERT INTO vectorizer.vectorizer_worker_progress (vectorizer_id) \
             VALUES ($1) ON CONFLICT (vectorizer_id) DO NOTHING",
            &[&vectorizer_id],
        )
        .await
        .context("Failed to ensure progress row")?;

    client
        .execute(
            "UPDATE vectorizer.vectorizer_worker_progress SET \
             success_count = success_count + $3, \
             last_success_at = CASE WHEN $4::text IS NULL AND $3 > 0 \
                                    THEN clock_timestamp() ELSE last_success_at END, \
             last_success_process_id = CASE WHEN $4::text IS NULL AND $3 > 0 \
                                            THEN $2 ELSE last_success_process_id END, \
             error_count = error_count + CASE WHEN $4::text IS NULL THEN 0 ELSE 1 END, \
             last_error_at = CASE WHEN $4::text IS NULL THEN last_error_at \
                                  ELSE clock_timestamp() END, \
             last_error_process_id = CASE WHEN $4::text IS NULL THEN last_error_process_id \
                                          ELSE $2 END, \
             last_error_message = coalesce($4, last_error_message) \
             WHERE vectorizer_id = $1",
            &[&vectorizer_id, &worker_id, &successes, &error],
        )
        .await
        .context("Failed to write worker progress")?;
    Ok(())
}

/// All registered workers, most recent heartbeat first.
pub async fn list_workers(client: &Client) -> anyhow::Result<Vec<WorkerProcess>> {
    let rows = client
        .query(
            "SELECT id, version, started_at, last_heartbeat, heartbeat_count, \
                    success_count, error_count, last_error_at, last_error_message, \
                    last_heartbeat + 3 * expected_heartbeat_interval > now() AS live \
             FROM vectorizer.vectorizer_worker_process \
             ORDER BY last_heartbeat DESC",
            &[],
        )
        .await
        .context("Failed to list worker processes")?;

    let mut workers = Vec::with_capacity(rows.len());
    for row in &rows {
        workers.push(WorkerProcess {
            id: row.try_get(0)?,
            version: row.try_get(1)?,
            started_at: row.try_get(2)?,
            last_heartbeat: row.try_get(3)?,
            heartbeat_count: row.try_get(4)?,
            success_count: row.try_get(5)?,
            error_count: row.try_get(6)?,
            last_error_at: row.try_get(7)?,
            last_error_message: row.try_get(8)?,
            live: row.try_get(9)?,
        });
    }
    Ok(workers)
}

pub async fn get_progress(
    client: &Client,
    vectorizer_id: i64,
) -> anyhow::Result<Option<WorkerProgress>> {
    let row = client
        .query_opt(
            "SELECT vectorizer_id, last_success_at, last_success_process_id, \
                    last_error_at, last_error_process_id, last_error_message, \
                    success_count, error_count \
             FROM vectorizer.vectorizer_worker_progress WHERE vectorizer_id = $1",
            &[&vectorizer_id],
        )
        .await
        .context("Failed to read worker progress")?;

    Ok(match row {
        Some(row) => Some(WorkerProgress {
            vectorizer_id: row.try_get(0)?,
            last_success_at: row.try_get(1)?,
            last_success_process_id: row.try_get(2)?,
            last_error_at: row.try_get(3)?,
            last_error_process_id: row.try_get(4)?,
            last_error_message: row.try_get(5)?,
            success_count: row.try_get(6)?,
            error_count: row.try_get(7)?,
        }),
        None => None,
    })
}
