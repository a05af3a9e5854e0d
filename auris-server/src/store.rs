//! Job state store
//!
//! Authoritative owner of every mutable `Job` record. All mutations to one
//! job run inside that job's exclusive critical section: the mutation is
//! applied in memory, persisted (job row + event-log rows), and only then
//! are the resulting events handed back to the caller for publication. An
//! event therefore never becomes observable before the state it describes
//! is durable.
//!
//! Different jobs never contend for the same lock; reads return the most
//! recently persisted state (active jobs from memory, finished or foreign
//! jobs from the database).

use auris_common::events::{ErrorKind, ProgressEvent, Stage};
use auris_common::{Error, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::db::jobs as db_jobs;
use crate::models::{Job, JobStatus};
use crate::pipeline::runner::FileOutcome;

/// Authoritative, persisted record of every job
pub struct JobStateStore {
    pool: SqlitePool,
    /// Active jobs, each behind its own lock (job-partitioned mutation)
    active: RwLock<HashMap<Uuid, Arc<Mutex<Job>>>>,
}

impl JobStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register and persist a new job (status `queued`)
    pub async fn create(&self, job: Job) -> Result<()> {
        db_jobs::save_job(&self.pool, &job).await?;
        self.active
            .write()
            .await
            .insert(job.id, Arc::new(Mutex::new(job)));
        Ok(())
    }

    async fn handle(&self, job_id: Uuid) -> Result<Arc<Mutex<Job>>> {
        self.active
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {job_id} is not active")))
    }

    /// Run one mutation inside the job's critical section.
    ///
    /// The closure mutates the job and returns the events describing the
    /// change (with sequence numbers it allocated via `Job::next_seq`). The
    /// updated row and the event rows are persisted before this returns, so
    /// callers may publish the returned events immediately.
    async fn mutate<F>(&self, job_id: Uuid, f: F) -> Result<Vec<ProgressEvent>>
    where
        F: FnOnce(&mut Job) -> Vec<ProgressEvent>,
    {
        let handle = self.handle(job_id).await?;
        let mut job = handle.lock().await;

        let events = f(&mut job);
        db_jobs::save_job(&self.pool, &job).await?;
        db_jobs::append_events(&self.pool, job_id, &events).await?;

        Ok(events)
    }

    /// `queued → running`; emits `job_started`
    pub async fn start_job(&self, job_id: Uuid) -> Result<Vec<ProgressEvent>> {
        self.mutate(job_id, |job| {
            job.start();
            vec![ProgressEvent::JobStarted {
                job_id: job.id,
                sequence: job.next_seq(),
                total_files: job.files.len(),
                timestamp: Utc::now(),
            }]
        })
        .await
    }

    /// Mark a file dispatched; emits `file_started`
    pub async fn start_file(&self, job_id: Uuid, filename: &str) -> Result<Vec<ProgressEvent>> {
        let filename = filename.to_string();
        self.mutate(job_id, move |job| {
            let Some(file) = job.file_mut(&filename) else {
                return Vec::new();
            };
            file.start();
            vec![ProgressEvent::FileStarted {
                job_id: job.id,
                sequence: job.next_seq(),
                filename,
                timestamp: Utc::now(),
            }]
        })
        .await
    }

    /// Record stage entry; emits `file_stage`
    pub async fn enter_stage(
        &self,
        job_id: Uuid,
        filename: &str,
        stage: Stage,
    ) -> Result<Vec<ProgressEvent>> {
        let filename = filename.to_string();
        self.mutate(job_id, move |job| {
            let Some(file) = job.file_mut(&filename) else {
                return Vec::new();
            };
            file.enter_stage(stage);
            vec![ProgressEvent::FileStage {
                job_id: job.id,
                sequence: job.next_seq(),
                filename,
                stage,
                percent: stage.entry_percent(),
                timestamp: Utc::now(),
            }]
        })
        .await
    }

    /// Apply a file's terminal outcome; emits `file_completed` followed by
    /// `job_progress`
    pub async fn complete_file(
        &self,
        job_id: Uuid,
        filename: &str,
        outcome: FileOutcome,
    ) -> Result<Vec<ProgressEvent>> {
        let filename = filename.to_string();
        self.mutate(job_id, move |job| {
            let Some(file) = job.file_mut(&filename) else {
                return Vec::new();
            };

            let (success, kind, reason, output) = match outcome {
                FileOutcome::Succeeded { output } => {
                    let output = output.to_string_lossy().into_owned();
                    file.succeed(output.clone());
                    (true, None, None, Some(output))
                }
                FileOutcome::Failed { kind, message } => {
                    file.fail(kind, message.clone());
                    (false, Some(kind), Some(message), None)
                }
            };

            let mut events = vec![ProgressEvent::FileCompleted {
                job_id: job.id,
                sequence: job.next_seq(),
                filename,
                success,
                kind,
                reason,
                output,
                timestamp: Utc::now(),
            }];
            events.push(ProgressEvent::JobProgress {
                job_id: job.id,
                sequence: job.next_seq(),
                percent: job.progress_percent(),
                completed: job.completed_files(),
                total: job.files.len(),
                timestamp: Utc::now(),
            });
            events
        })
        .await
    }

    /// Fail every file that has not yet reached a terminal status.
    ///
    /// Used on cancellation (and for jobs whose collaborators could not be
    /// constructed). Emits one `file_completed` per affected file plus one
    /// trailing `job_progress`.
    pub async fn fail_remaining(
        &self,
        job_id: Uuid,
        kind: ErrorKind,
        reason: &str,
    ) -> Result<Vec<ProgressEvent>> {
        let reason = reason.to_string();
        self.mutate(job_id, move |job| {
            let pending: Vec<String> = job
                .files
                .iter()
                .filter(|f| !f.status.is_terminal())
                .map(|f| f.filename.clone())
                .collect();

            if pending.is_empty() {
                return Vec::new();
            }

            let mut events = Vec::with_capacity(pending.len() + 1);
            for filename in pending {
                if let Some(file) = job.file_mut(&filename) {
                    file.fail(kind, reason.clone());
                }
                events.push(ProgressEvent::FileCompleted {
                    job_id: job.id,
                    sequence: job.next_seq(),
                    filename,
                    success: false,
                    kind: Some(kind),
                    reason: Some(reason.clone()),
                    output: None,
                    timestamp: Utc::now(),
                });
            }
            events.push(ProgressEvent::JobProgress {
                job_id: job.id,
                sequence: job.next_seq(),
                percent: job.progress_percent(),
                completed: job.completed_files(),
                total: job.files.len(),
                timestamp: Utc::now(),
            });
            events
        })
        .await
    }

    /// Append a diagnostic `log` event to the job
    pub async fn log(&self, job_id: Uuid, message: &str) -> Result<Vec<ProgressEvent>> {
        let message = message.to_string();
        self.mutate(job_id, move |job| {
            vec![ProgressEvent::Log {
                job_id: job.id,
                sequence: job.next_seq(),
                message,
                timestamp: Utc::now(),
            }]
        })
        .await
    }

    /// Apply the terminal status (per the aggregate invariant), record the
    /// packaging result, and emit `job_complete`.
    ///
    /// Returns the events and the final status. The final state is durable
    /// before the events are returned, so `job_complete` is only ever
    /// observed after finalization.
    pub async fn finalize(
        &self,
        job_id: Uuid,
        job_error: Option<String>,
        artifact_ready: bool,
    ) -> Result<(Vec<ProgressEvent>, JobStatus)> {
        let mut final_status = JobStatus::Failed;
        let events = self
            .mutate(job_id, |job| {
                let status = job.aggregate_status().unwrap_or(JobStatus::Failed);
                job.artifact_ready = artifact_ready;
                job.finish(status, job_error.clone());
                final_status = job.status;

                let success = job.status == JobStatus::Completed && job.error.is_none();
                vec![ProgressEvent::JobComplete {
                    job_id: job.id,
                    sequence: job.next_seq(),
                    success,
                    reason: job.error.clone(),
                    summary: job.summary(),
                    timestamp: Utc::now(),
                }]
            })
            .await?;

        // Terminal jobs no longer need an in-memory handle; reads fall
        // through to the persisted row.
        self.active.write().await.remove(&job_id);

        Ok((events, final_status))
    }

    /// Most recently persisted state of a job
    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        if let Some(handle) = self.active.read().await.get(&job_id).cloned() {
            return Ok(Some(handle.lock().await.clone()));
        }
        db_jobs::load_job(&self.pool, job_id).await
    }

    /// All known jobs, most recently created first
    pub async fn list(&self) -> Result<Vec<Job>> {
        db_jobs::list_jobs(&self.pool).await
    }

    /// Durable, confirmed event log for a job (replay source)
    pub async fn events(&self, job_id: Uuid, after_seq: u64) -> Result<Vec<ProgressEvent>> {
        db_jobs::load_events(&self.pool, job_id, after_seq).await
    }
}
