//! Job manager and worker pool
//!
//! Top-level coordinator: validates and registers incoming jobs, enqueues
//! them on a bounded pool of workers, wires pipeline stage events into the
//! job store and the progress bus (in that order, so state is durable
//! before the event claiming it is published), and finalizes job status
//! per the aggregate invariant.
//!
//! Jobs are processed in FIFO submission order; files within a job run
//! strictly sequentially. Every pipeline invocation is dispatched to a
//! blocking worker context via `spawn_blocking`; the control plane never
//! performs pipeline work inline. A panic inside one file's pipeline
//! surfaces as a `JoinError`, is converted into an `internal_fault` file
//! failure, and the worker carries on with the next file.

use auris_common::config::{AurisConfig, OverwritePolicy};
use auris_common::events::{ErrorKind, ProgressEvent, Stage};
use auris_common::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::ProgressBus;
use crate::models::{FileTask, Job, JobOptions, JobPaths};
use crate::package::Packager;
use crate::pipeline::denoise::DenoiserProvider;
use crate::pipeline::runner::{FileOutcome, FileRequest, PipelineRunner, RunEvent};
use crate::pipeline::transcode::Transcoder;
use crate::store::JobStateStore;

/// One resolved input file, provided by the upload/unpack collaborator
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SubmittedFile {
    /// Relative path within the batch, unique per job
    pub filename: String,
    /// Absolute filesystem location of the input
    pub path: PathBuf,
}

/// A validated-enough submission; full validation happens in `submit`
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Optional human-readable batch label
    pub label: Option<String>,
    pub options: JobOptions,
    pub files: Vec<SubmittedFile>,
}

/// Coordinates job execution and progress delivery
pub struct JobManager {
    store: Arc<JobStateStore>,
    bus: Arc<ProgressBus>,
    transcoder: Arc<dyn Transcoder>,
    denoisers: Arc<dyn DenoiserProvider>,
    packager: Arc<dyn Packager>,
    overwrite: OverwritePolicy,
    uploads_dir: PathBuf,
    outputs_dir: PathBuf,
    worker_count: usize,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    /// Shared FIFO queue; workers take turns receiving
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    /// Cancellation tokens for jobs that have not finished
    cancel_tokens: RwLock<HashMap<Uuid, CancellationToken>>,
}

impl JobManager {
    pub fn new(
        store: Arc<JobStateStore>,
        bus: Arc<ProgressBus>,
        transcoder: Arc<dyn Transcoder>,
        denoisers: Arc<dyn DenoiserProvider>,
        packager: Arc<dyn Packager>,
        config: &AurisConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            bus,
            transcoder,
            denoisers,
            packager,
            overwrite: config.overwrite,
            uploads_dir: config.uploads_dir(),
            outputs_dir: config.outputs_dir(),
            worker_count: config.workers.max(1),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            cancel_tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Start the worker pool
    pub fn spawn_workers(self: &Arc<Self>) {
        for worker_id in 0..self.worker_count {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.worker_loop(worker_id).await;
            });
        }
        info!(workers = self.worker_count, "Job worker pool started");
    }

    pub fn store(&self) -> &Arc<JobStateStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    /// Validate, register and enqueue a new job.
    ///
    /// Malformed submissions are rejected here and no job record is created.
    pub async fn submit(&self, request: JobRequest) -> Result<Job> {
        if request.files.is_empty() {
            return Err(Error::InvalidInput(
                "submission contains no input files".to_string(),
            ));
        }

        {
            let mut seen = std::collections::HashSet::new();
            for file in &request.files {
                let rel = std::path::Path::new(&file.filename);
                if rel.is_absolute()
                    || rel
                        .components()
                        .any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    return Err(Error::InvalidInput(format!(
                        "unsafe filename in submission: {}",
                        file.filename
                    )));
                }
                if !seen.insert(file.filename.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "duplicate filename in submission: {}",
                        file.filename
                    )));
                }
                if !file.path.is_file() {
                    return Err(Error::InvalidInput(format!(
                        "input file does not exist: {}",
                        file.path.display()
                    )));
                }
            }
        }

        let id = Uuid::new_v4();
        let input_dir = self.uploads_dir.join(id.to_string());
        let temp_dir = if request.options.temp_dir.is_absolute() {
            request.options.temp_dir.join(id.to_string())
        } else {
            input_dir.join(&request.options.temp_dir)
        };
        let job_output_root = self.outputs_dir.join(id.to_string());
        let paths = JobPaths {
            input_dir,
            temp_dir,
            output_dir: job_output_root.join("enhanced"),
            artifact_path: job_output_root.join("enhanced.zip"),
        };

        let files = request
            .files
            .into_iter()
            .map(|f| FileTask::new(f.filename, f.path))
            .collect();
        let label = request.label.unwrap_or_else(|| id.to_string());
        let job = Job::new(id, label, request.options, files, paths);

        self.store.create(job.clone()).await?;
        self.cancel_tokens
            .write()
            .await
            .insert(id, CancellationToken::new());
        self.queue_tx
            .send(id)
            .map_err(|_| Error::Internal("worker pool is not running".to_string()))?;

        info!(
            job_id = %id,
            files = job.files.len(),
            model = %job.options.model,
            "Job submitted and queued"
        );
        Ok(job)
    }

    /// Request administrative cancellation of a job.
    ///
    /// The in-flight file (if any) runs to completion; files that have not
    /// been dispatched transition to `failed` with the `cancelled`
    /// classification, and nothing further is dispatched for this job.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job not found: {job_id}")))?;
        if job.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "job is already {}",
                job.status
            )));
        }

        match self.cancel_tokens.read().await.get(&job_id) {
            Some(token) => token.cancel(),
            None => {
                return Err(Error::Internal(format!(
                    "no cancellation token for job {job_id}"
                )))
            }
        }

        let events = self.store.log(job_id, "cancellation requested").await?;
        self.bus.publish_all(events);
        info!(job_id = %job_id, "Job cancellation requested");

        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job not found: {job_id}")))
    }

    /// Attach an observer to a job.
    ///
    /// Returns the durable event history (the synthetic replay source) and,
    /// for jobs that are not yet terminal, a live receiver. The live
    /// receiver is subscribed *before* the history is read, so splicing the
    /// two on sequence number (drop live events at or below the last
    /// replayed sequence) yields gap-free, duplicate-free delivery.
    pub async fn subscribe(
        &self,
        job_id: Uuid,
    ) -> Result<(Vec<ProgressEvent>, Option<broadcast::Receiver<ProgressEvent>>)> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job not found: {job_id}")))?;

        let live = if job.is_terminal() {
            None
        } else {
            Some(self.bus.subscribe(job_id))
        };
        let history = self.store.events(job_id, 0).await?;
        Ok((history, live))
    }

    /// Locate the packaged artifact, building it on demand when outputs
    /// exist but the archive has not been materialized yet.
    pub async fn ensure_artifact(&self, job_id: Uuid) -> Result<(Job, PathBuf)> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job not found: {job_id}")))?;
        let artifact = job.paths.artifact_path.clone();

        if artifact.exists() {
            return Ok((job, artifact));
        }

        let has_outputs = job.paths.output_dir.exists()
            && std::fs::read_dir(&job.paths.output_dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
        if !has_outputs {
            return Err(Error::NotFound(
                "no processed outputs available yet".to_string(),
            ));
        }

        let packager = Arc::clone(&self.packager);
        let output_dir = job.paths.output_dir.clone();
        let target = artifact.clone();
        tokio::task::spawn_blocking(move || packager.package(&output_dir, &target))
            .await
            .map_err(|e| Error::Internal(format!("packaging task failed: {e}")))?
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok((job, artifact))
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        info!(worker_id, "Job worker started");
        loop {
            let job_id = { self.queue_rx.lock().await.recv().await };
            let Some(job_id) = job_id else {
                break;
            };
            debug!(worker_id, job_id = %job_id, "Worker dequeued job");
            self.run_job(job_id).await;
        }
        info!(worker_id, "Job worker stopped");
    }

    /// Run one job to a terminal state, containing any internal failure
    async fn run_job(&self, job_id: Uuid) {
        if let Err(e) = self.execute_job(job_id).await {
            error!(job_id = %job_id, error = %e, "Job execution failed");
            // Drive the job to a terminal state so observers are released
            match self
                .store
                .fail_remaining(
                    job_id,
                    ErrorKind::InternalFault,
                    &format!("job execution failed: {e}"),
                )
                .await
            {
                Ok(events) => self.bus.publish_all(events),
                Err(e2) => error!(job_id = %job_id, error = %e2, "Unable to fail remaining files"),
            }
            if let Err(e2) = self.finish_job(job_id).await {
                error!(job_id = %job_id, error = %e2, "Unable to finalize failed job");
            }
        }
    }

    async fn execute_job(&self, job_id: Uuid) -> Result<()> {
        let token = self
            .cancel_tokens
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default();

        let events = self.store.start_job(job_id).await?;
        self.bus.publish_all(events);

        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job not found: {job_id}")))?;

        let denoiser = match self.denoisers.get(job.options.model) {
            Ok(denoiser) => Some(denoiser),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Denoiser unavailable, failing job");
                let events = self
                    .store
                    .fail_remaining(job_id, ErrorKind::Model, &format!("denoiser unavailable: {e}"))
                    .await?;
                self.bus.publish_all(events);
                None
            }
        };

        if let Some(denoiser) = denoiser {
            for file in &job.files {
                // Cancellation is observed between files: the in-flight file
                // always runs to completion
                if token.is_cancelled() {
                    let events = self
                        .store
                        .fail_remaining(
                            job_id,
                            ErrorKind::Cancelled,
                            "job cancelled before this file was dispatched",
                        )
                        .await?;
                    self.bus.publish_all(events);
                    break;
                }

                let events = self.store.start_file(job_id, &file.filename).await?;
                self.bus.publish_all(events);

                let outcome = self
                    .process_file(job_id, &job, file, denoiser.clone())
                    .await?;

                let events = self
                    .store
                    .complete_file(job_id, &file.filename, outcome)
                    .await?;
                self.bus.publish_all(events);
            }
        }

        self.finish_job(job_id).await
    }

    /// Run one file's pipeline on a blocking worker context, forwarding its
    /// stage events as they happen.
    async fn process_file(
        &self,
        job_id: Uuid,
        job: &Job,
        file: &FileTask,
        denoiser: crate::pipeline::denoise::SharedDenoiser,
    ) -> Result<FileOutcome> {
        let request = FileRequest {
            filename: file.filename.clone(),
            source: file.source.clone(),
            output_dir: job.paths.output_dir.clone(),
            temp_dir: job.paths.temp_dir.clone(),
            suffix: job.options.suffix.clone(),
            high_bitrate: !job.options.low_bitrate,
            apply_filters: !job.options.no_loudnorm,
            overwrite: self.overwrite,
        };

        let transcoder = Arc::clone(&self.transcoder);
        // Capacity covers every stage event, so the pipeline never stalls
        // on a slow control plane
        let (stage_tx, mut stage_rx) = mpsc::channel::<Stage>(Stage::ALL.len() + 1);

        let pipeline = tokio::task::spawn_blocking(move || {
            let runner = PipelineRunner::new(transcoder, denoiser);
            let mut outcome = None;
            for event in runner.run(request) {
                match event {
                    RunEvent::Stage(stage) => {
                        let _ = stage_tx.blocking_send(stage);
                    }
                    RunEvent::Finished(result) => outcome = Some(result),
                }
            }
            outcome.unwrap_or(FileOutcome::Failed {
                kind: ErrorKind::InternalFault,
                message: "pipeline yielded no terminal outcome".to_string(),
            })
        });

        // Drain stage events until the pipeline drops its sender
        while let Some(stage) = stage_rx.recv().await {
            let events = self.store.enter_stage(job_id, &file.filename, stage).await?;
            self.bus.publish_all(events);
        }

        match pipeline.await {
            Ok(outcome) => Ok(outcome),
            Err(join_error) => {
                // A pipeline defect must cost one file, never the worker
                let message = if join_error.is_panic() {
                    format!("pipeline panicked: {join_error}")
                } else {
                    format!("pipeline task aborted: {join_error}")
                };
                error!(job_id = %job_id, file = %file.filename, "{message}");
                Ok(FileOutcome::Failed {
                    kind: ErrorKind::InternalFault,
                    message,
                })
            }
        }
    }

    /// Package outputs, clean up scratch space, persist the terminal state,
    /// publish `job_complete`, and release per-job resources.
    async fn finish_job(&self, job_id: Uuid) -> Result<()> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job not found: {job_id}")))?;

        let mut job_error = None;
        let mut artifact_ready = false;
        if job.succeeded_files() > 0 {
            let packager = Arc::clone(&self.packager);
            let output_dir = job.paths.output_dir.clone();
            let artifact = job.paths.artifact_path.clone();
            let packaged =
                tokio::task::spawn_blocking(move || packager.package(&output_dir, &artifact)).await;
            match packaged {
                Ok(Ok(count)) => {
                    artifact_ready = true;
                    debug!(job_id = %job_id, files = count, "Output artifact packaged");
                }
                Ok(Err(e)) => {
                    warn!(job_id = %job_id, error = %e, "Packaging failed");
                    job_error = Some(format!("{}: {e}", ErrorKind::Packaging));
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Packaging task failed");
                    job_error = Some(format!("{}: {e}", ErrorKind::Packaging));
                }
            }
        }

        let _ = tokio::fs::remove_dir_all(&job.paths.temp_dir).await;

        let (events, status) = self.store.finalize(job_id, job_error, artifact_ready).await?;
        self.bus.publish_all(events);
        self.bus.retire(job_id);
        self.cancel_tokens.write().await.remove(&job_id);

        info!(job_id = %job_id, status = %status, "Job finished");
        Ok(())
    }
}
