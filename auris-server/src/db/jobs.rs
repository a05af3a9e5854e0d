//! Job record persistence
//!
//! Each job is one row in `jobs` (nested structures JSON-encoded, they are
//! never queried field-by-field) plus zero or more rows in `job_events`,
//! the append-only per-job event log keyed by `(job_id, seq)`.

use auris_common::events::ProgressEvent;
use auris_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Job, JobStatus};

fn encode<T: serde::Serialize>(what: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {what}: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| Error::Internal(format!("Failed to deserialize {what}: {e}")))
}

fn parse_timestamp(what: &str, text: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {what}: {e}")))
}

/// Insert or update a job row
pub async fn save_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    let options = encode("options", &job.options)?;
    let files = encode("files", &job.files)?;
    let paths = encode("paths", &job.paths)?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            job_id, status, label, options, files, paths,
            error, artifact_ready, last_seq, created_at, started_at, finished_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id) DO UPDATE SET
            status = excluded.status,
            files = excluded.files,
            error = excluded.error,
            artifact_ready = excluded.artifact_ready,
            last_seq = excluded.last_seq,
            started_at = excluded.started_at,
            finished_at = excluded.finished_at
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.status.as_str())
    .bind(&job.label)
    .bind(&options)
    .bind(&files)
    .bind(&paths)
    .bind(&job.error)
    .bind(job.artifact_ready as i64)
    .bind(job.last_seq as i64)
    .bind(job.created_at.to_rfc3339())
    .bind(job.started_at.map(|dt| dt.to_rfc3339()))
    .bind(job.finished_at.map(|dt| dt.to_rfc3339()))
    .execute(pool)
    .await?;

    Ok(())
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let id_str: String = row.get("job_id");
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| Error::Internal(format!("Failed to parse job_id: {e}")))?;

    let status: String = row.get("status");
    let status: JobStatus = decode("status", &format!("\"{status}\""))?;

    let options: String = row.get("options");
    let files: String = row.get("files");
    let paths: String = row.get("paths");

    let created_at: String = row.get("created_at");
    let started_at: Option<String> = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");

    Ok(Job {
        id,
        label: row.get("label"),
        status,
        options: decode("options", &options)?,
        files: decode("files", &files)?,
        paths: decode("paths", &paths)?,
        error: row.get("error"),
        artifact_ready: row.get::<i64, _>("artifact_ready") != 0,
        last_seq: row.get::<i64, _>("last_seq") as u64,
        created_at: parse_timestamp("created_at", &created_at)?,
        started_at: started_at
            .map(|s| parse_timestamp("started_at", &s))
            .transpose()?,
        finished_at: finished_at
            .map(|s| parse_timestamp("finished_at", &s))
            .transpose()?,
    })
}

/// Load one job by id
pub async fn load_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Load all jobs, most recently created first
pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<Job>> {
    let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;

    rows.iter().map(job_from_row).collect()
}

/// Append confirmed events to the per-job log
///
/// Called after the owning job row has been updated, inside the same per-job
/// critical section, so `seq` values never collide.
pub async fn append_events(pool: &SqlitePool, job_id: Uuid, events: &[ProgressEvent]) -> Result<()> {
    for event in events {
        let payload = encode("event", event)?;
        sqlx::query("INSERT INTO job_events (job_id, seq, payload) VALUES (?, ?, ?)")
            .bind(job_id.to_string())
            .bind(event.sequence() as i64)
            .bind(&payload)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Load the durable event log for a job, in sequence order, starting after
/// `after_seq` (pass 0 for the full log)
pub async fn load_events(
    pool: &SqlitePool,
    job_id: Uuid,
    after_seq: u64,
) -> Result<Vec<ProgressEvent>> {
    let rows = sqlx::query(
        "SELECT payload FROM job_events WHERE job_id = ? AND seq > ? ORDER BY seq ASC",
    )
    .bind(job_id.to_string())
    .bind(after_seq as i64)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let payload: String = row.get("payload");
            decode("event", &payload)
        })
        .collect()
}

/// Mark jobs left non-terminal by a previous process as failed.
///
/// A job that is queued or running when the process dies has no worker to
/// carry it forward; mid-file resume is out of scope, so on startup such
/// jobs are failed with an explanatory reason.
pub async fn fail_stale_jobs(pool: &SqlitePool) -> Result<usize> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed',
            error = 'Interrupted by service restart',
            finished_at = ?
        WHERE status IN ('queued', 'running')
        "#,
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::{FileTask, JobOptions, JobPaths};
    use auris_common::events::ProgressEvent;
    use std::path::PathBuf;

    fn sample_job() -> Job {
        Job::new(
            Uuid::new_v4(),
            "voices".to_string(),
            JobOptions::default(),
            vec![
                FileTask::new("a.wav".to_string(), PathBuf::from("/in/a.wav")),
                FileTask::new("b.mp3".to_string(), PathBuf::from("/in/b.mp3")),
            ],
            JobPaths {
                input_dir: PathBuf::from("/in"),
                temp_dir: PathBuf::from("/tmp/j"),
                output_dir: PathBuf::from("/out"),
                artifact_path: PathBuf::from("/out.zip"),
            },
        )
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let pool = test_pool().await;
        let mut job = sample_job();
        job.start();
        job.files[0].succeed("a.wav".to_string());
        save_job(&pool, &job).await.expect("save");

        let loaded = load_job(&pool, job.id).await.expect("load").expect("some");
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.files.len(), 2);
        assert_eq!(loaded.files[0].output_path.as_deref(), Some("a.wav"));
        assert!(loaded.started_at.is_some());
        assert!(loaded.finished_at.is_none());
    }

    #[tokio::test]
    async fn missing_job_is_none() {
        let pool = test_pool().await;
        assert!(load_job(&pool, Uuid::new_v4()).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn event_log_preserves_sequence_order() {
        let pool = test_pool().await;
        let job = sample_job();
        save_job(&pool, &job).await.expect("save");

        let events: Vec<ProgressEvent> = (1..=5)
            .map(|seq| ProgressEvent::Log {
                job_id: job.id,
                sequence: seq,
                message: format!("line {seq}"),
                timestamp: chrono::Utc::now(),
            })
            .collect();
        append_events(&pool, job.id, &events).await.expect("append");

        let all = load_events(&pool, job.id, 0).await.expect("load");
        let seqs: Vec<u64> = all.iter().map(|e| e.sequence()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        let tail = load_events(&pool, job.id, 3).await.expect("load");
        let seqs: Vec<u64> = tail.iter().map(|e| e.sequence()).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn stale_jobs_failed_on_startup() {
        let pool = test_pool().await;
        let mut running = sample_job();
        running.start();
        save_job(&pool, &running).await.expect("save");

        let mut done = sample_job();
        done.files.iter_mut().for_each(|f| f.succeed(f.filename.clone()));
        done.start();
        done.finish(JobStatus::Completed, None);
        save_job(&pool, &done).await.expect("save");

        let recovered = fail_stale_jobs(&pool).await.expect("recover");
        assert_eq!(recovered, 1);

        let reloaded = load_job(&pool, running.id).await.expect("load").expect("some");
        assert_eq!(reloaded.status, JobStatus::Failed);
        assert!(reloaded.error.as_deref().unwrap_or("").contains("restart"));

        let untouched = load_job(&pool, done.id).await.expect("load").expect("some");
        assert_eq!(untouched.status, JobStatus::Completed);
    }
}
