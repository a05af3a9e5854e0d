//! Job and per-file state machines
//!
//! A job progresses `queued → running → {completed, completed_with_errors,
//! failed}`; a file progresses `pending → running → {succeeded, failed}`.
//! Terminal states are sinks. The job's terminal status is a pure function
//! of its files' terminal statuses: all succeeded → `completed`, all failed
//! → `failed`, mixed → `completed_with_errors`.

use auris_common::events::{ErrorKind, JobSummary, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::JobOptions;

/// Aggregate job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-file status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Succeeded | FileStatus::Failed)
    }
}

/// Classified per-file failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-file processing record within a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTask {
    /// Relative path within the job's input set, unique within the job
    pub filename: String,
    /// Absolute location of the input file, resolved by the submission
    /// collaborator
    pub source: PathBuf,
    pub status: FileStatus,
    /// Current pipeline stage while running; retained at failure for
    /// diagnostics, cleared on success
    pub stage: Option<Stage>,
    /// Per-file progress (0-100)
    pub percent: u8,
    /// Present iff `status` is `failed`
    pub error: Option<FileFailure>,
    /// Output path relative to the job's output tree, present iff succeeded
    pub output_path: Option<String>,
}

impl FileTask {
    pub fn new(filename: String, source: PathBuf) -> Self {
        Self {
            filename,
            source,
            status: FileStatus::Pending,
            stage: None,
            percent: 0,
            error: None,
            output_path: None,
        }
    }

    /// `pending → running`; no-op if already terminal
    pub fn start(&mut self) {
        if !self.status.is_terminal() {
            self.status = FileStatus::Running;
        }
    }

    /// Record entry into a pipeline stage
    pub fn enter_stage(&mut self, stage: Stage) {
        if self.status.is_terminal() {
            return;
        }
        self.status = FileStatus::Running;
        self.stage = Some(stage);
        self.percent = stage.entry_percent();
    }

    /// `running → succeeded`; terminal states are sinks
    pub fn succeed(&mut self, output_path: String) {
        if self.status.is_terminal() {
            return;
        }
        self.status = FileStatus::Succeeded;
        self.stage = None;
        self.percent = 100;
        self.error = None;
        self.output_path = Some(output_path);
    }

    /// `pending|running → failed`; the stage at time of failure is retained
    pub fn fail(&mut self, kind: ErrorKind, message: String) {
        if self.status.is_terminal() {
            return;
        }
        self.status = FileStatus::Failed;
        self.error = Some(FileFailure { kind, message });
        self.output_path = None;
    }
}

/// Filesystem layout of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPaths {
    /// Root of the resolved input set
    pub input_dir: PathBuf,
    /// Per-job scratch directory for intermediates
    pub temp_dir: PathBuf,
    /// Final output tree
    pub output_dir: PathBuf,
    /// Packaged artifact location
    pub artifact_path: PathBuf,
}

/// One submitted batch of input files processed under one options set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier, assigned at submission
    pub id: Uuid,
    /// Human-readable batch label (defaults to the job id)
    pub label: String,
    pub status: JobStatus,
    /// Immutable configuration snapshot
    pub options: JobOptions,
    /// Per-file records in discovery order
    pub files: Vec<FileTask>,
    pub paths: JobPaths,
    /// Job-level error (packaging or administrative), if any
    pub error: Option<String>,
    /// Set once the packaged artifact has been materialized
    pub artifact_ready: bool,
    /// Monotonic per-job event sequence counter; the highest sequence number
    /// that has been durably persisted
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: Uuid,
        label: String,
        options: JobOptions,
        files: Vec<FileTask>,
        paths: JobPaths,
    ) -> Self {
        Self {
            id,
            label,
            status: JobStatus::Queued,
            options,
            files,
            paths,
            error: None,
            artifact_ready: false,
            last_seq: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn file(&self, filename: &str) -> Option<&FileTask> {
        self.files.iter().find(|f| f.filename == filename)
    }

    pub fn file_mut(&mut self, filename: &str) -> Option<&mut FileTask> {
        self.files.iter_mut().find(|f| f.filename == filename)
    }

    /// Allocate the next event sequence number
    pub fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    /// `queued → running`; `started_at` is set at most once
    pub fn start(&mut self) {
        if self.status == JobStatus::Queued {
            self.status = JobStatus::Running;
            self.started_at.get_or_insert_with(Utc::now);
        }
    }

    /// Files that have reached a terminal status
    pub fn completed_files(&self) -> usize {
        self.files.iter().filter(|f| f.status.is_terminal()).count()
    }

    pub fn succeeded_files(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Succeeded)
            .count()
    }

    pub fn failed_files(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Failed)
            .count()
    }

    /// Aggregate progress as `completed_files / total_files`, in percent
    pub fn progress_percent(&self) -> f64 {
        if self.files.is_empty() {
            return 100.0;
        }
        (self.completed_files() as f64 / self.files.len() as f64) * 100.0
    }

    /// Terminal status implied by the files, or `None` while any file is
    /// still pending or running.
    ///
    /// The job status is terminal iff every file status is terminal:
    /// all succeeded → `completed`, all failed → `failed`, otherwise
    /// `completed_with_errors`.
    pub fn aggregate_status(&self) -> Option<JobStatus> {
        if !self.files.iter().all(|f| f.status.is_terminal()) {
            return None;
        }
        let succeeded = self.succeeded_files();
        let failed = self.failed_files();
        Some(if failed == 0 {
            JobStatus::Completed
        } else if succeeded == 0 {
            JobStatus::Failed
        } else {
            JobStatus::CompletedWithErrors
        })
    }

    /// Apply the terminal status; `finished_at` is set at most once
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished_at.get_or_insert_with(Utc::now);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal accounting for `job_complete` and the files listing
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            processed: self.completed_files(),
            total: self.files.len(),
            succeeded: self.succeeded_files(),
            failed: self.failed_files(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_files(n: usize) -> Job {
        let files = (0..n)
            .map(|i| FileTask::new(format!("file{i}.wav"), PathBuf::from(format!("/in/file{i}.wav"))))
            .collect();
        Job::new(
            Uuid::new_v4(),
            "test".to_string(),
            JobOptions::default(),
            files,
            JobPaths {
                input_dir: PathBuf::from("/in"),
                temp_dir: PathBuf::from("/tmp/job"),
                output_dir: PathBuf::from("/out"),
                artifact_path: PathBuf::from("/out.zip"),
            },
        )
    }

    #[test]
    fn file_terminal_states_are_sinks() {
        let mut task = FileTask::new("a.wav".to_string(), PathBuf::from("/in/a.wav"));
        task.start();
        task.enter_stage(Stage::Convert);
        task.fail(ErrorKind::Conversion, "boom".to_string());
        assert_eq!(task.status, FileStatus::Failed);
        assert_eq!(task.stage, Some(Stage::Convert), "failure stage retained");

        // No transition leaves a terminal state
        task.succeed("a.wav".to_string());
        assert_eq!(task.status, FileStatus::Failed);
        task.enter_stage(Stage::Encode);
        assert_eq!(task.stage, Some(Stage::Convert));
    }

    #[test]
    fn aggregate_status_requires_all_terminal() {
        // Exhaust every success/failure combination for 3 files, completed in
        // every order: the job status must stay None until the last terminal
        // transition, then match the invariant.
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for outcome_bits in 0..8u8 {
            for order in orders {
                let mut job = job_with_files(3);
                job.start();

                for (step, &idx) in order.iter().enumerate() {
                    assert_eq!(
                        job.aggregate_status(),
                        None,
                        "status must not be terminal before all files finish"
                    );
                    let ok = outcome_bits & (1 << idx) != 0;
                    let file = &mut job.files[idx];
                    if ok {
                        file.succeed(file.filename.clone());
                    } else {
                        file.fail(ErrorKind::Encode, "stub".to_string());
                    }
                    if step < 2 {
                        assert_eq!(job.aggregate_status(), None);
                    }
                }

                let succeeded = (0..3).filter(|i| outcome_bits & (1 << i) != 0).count();
                let expected = match succeeded {
                    3 => JobStatus::Completed,
                    0 => JobStatus::Failed,
                    _ => JobStatus::CompletedWithErrors,
                };
                assert_eq!(job.aggregate_status(), Some(expected));
            }
        }
    }

    #[test]
    fn timestamps_set_at_most_once() {
        let mut job = job_with_files(1);
        job.start();
        let started = job.started_at.expect("started_at set");
        job.start();
        assert_eq!(job.started_at, Some(started));

        job.files[0].succeed("file0.wav".to_string());
        job.finish(JobStatus::Completed, None);
        let finished = job.finished_at.expect("finished_at set");
        job.finish(JobStatus::Failed, Some("ignored".to_string()));
        assert_eq!(job.status, JobStatus::Completed, "terminal status is a sink");
        assert_eq!(job.finished_at, Some(finished));
    }

    #[test]
    fn progress_tracks_terminal_files() {
        let mut job = job_with_files(4);
        assert_eq!(job.progress_percent(), 0.0);
        job.files[0].succeed("file0.wav".to_string());
        job.files[1].fail(ErrorKind::Model, "stub".to_string());
        assert_eq!(job.progress_percent(), 50.0);
        assert_eq!(job.completed_files(), 2);
    }

    #[test]
    fn sequence_counter_is_monotonic() {
        let mut job = job_with_files(1);
        let a = job.next_seq();
        let b = job.next_seq();
        let c = job.next_seq();
        assert!(a < b && b < c);
        assert_eq!(job.last_seq, c);
    }
}
