//! Progress event model for enhancement jobs
//!
//! Defines the wire contract delivered to observers (WebSocket clients and
//! the batch CLI reporter). Events are broadcast via `tokio::sync::broadcast`
//! and serialized as tagged JSON.
//!
//! Every event carries the owning `job_id` and a strictly increasing per-job
//! `sequence` number. Sequence numbers are assigned by the job store at the
//! moment the underlying state change is persisted, so an event is only ever
//! observable after the state it describes is durable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One step of the fixed five-step per-file pipeline.
///
/// Stages execute strictly in this order; a stage failure aborts the
/// remaining stages for that file only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Canonicalize the input to 48 kHz mono WAV
    Convert,
    /// Run the denoising model at its fixed internal rate
    Denoise,
    /// Resample the denoised signal back to the original rate
    Upsample,
    /// Apply the cleanup filter chain
    Filter,
    /// Encode to the final delivery format
    Encode,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 5] = [
        Stage::Convert,
        Stage::Denoise,
        Stage::Upsample,
        Stage::Filter,
        Stage::Encode,
    ];

    /// 0-based position within the pipeline
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).expect("stage in ALL")
    }

    /// Per-file progress percentage at entry to this stage
    pub fn entry_percent(self) -> u8 {
        (self.index() * 100 / Self::ALL.len()) as u8
    }

    /// Stage name as it appears on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Convert => "convert",
            Stage::Denoise => "denoise",
            Stage::Upsample => "upsample",
            Stage::Filter => "filter",
            Stage::Encode => "encode",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error classification recorded on failed files and jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad submission, rejected before a job is created
    #[serde(rename = "validation_error")]
    Validation,
    /// Input canonicalization failed (convert stage)
    #[serde(rename = "conversion_error")]
    Conversion,
    /// Denoising model invocation failed (denoise or upsample stage)
    #[serde(rename = "model_error")]
    Model,
    /// Filter-chain execution failed (filter stage)
    #[serde(rename = "filter_error")]
    Filter,
    /// Final encoding failed (encode stage)
    #[serde(rename = "encode_error")]
    Encode,
    /// Artifact packaging failed (job level, per-file results stand)
    #[serde(rename = "packaging_error")]
    Packaging,
    /// File was never dispatched because the job was cancelled
    #[serde(rename = "cancelled")]
    Cancelled,
    /// Unexpected defect caught at the per-file boundary
    #[serde(rename = "internal_fault")]
    InternalFault,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Conversion => "conversion_error",
            ErrorKind::Model => "model_error",
            ErrorKind::Filter => "filter_error",
            ErrorKind::Encode => "encode_error",
            ErrorKind::Packaging => "packaging_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalFault => "internal_fault",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal per-job accounting included with `job_complete`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Files that reached a terminal status
    pub processed: usize,
    /// Files in the job
    pub total: usize,
    /// Files that succeeded
    pub succeeded: usize,
    /// Files that failed
    pub failed: usize,
    /// Job-level error (packaging or administrative), if any
    pub error: Option<String>,
}

/// Progress events emitted while a job runs
///
/// Per job, `job_started` precedes any `file_*` event and `job_complete` is
/// published only after every file is terminal and the final state is
/// durable. Per file, `file_started` → 5 × `file_stage` → `file_completed`,
/// in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Job left the queue and began processing
    JobStarted {
        job_id: Uuid,
        sequence: u64,
        total_files: usize,
        timestamp: DateTime<Utc>,
    },

    /// A file's pipeline was dispatched
    FileStarted {
        job_id: Uuid,
        sequence: u64,
        filename: String,
        timestamp: DateTime<Utc>,
    },

    /// A file's pipeline entered a stage
    FileStage {
        job_id: Uuid,
        sequence: u64,
        filename: String,
        stage: Stage,
        /// Per-file progress at stage entry (0-100)
        percent: u8,
        timestamp: DateTime<Utc>,
    },

    /// A file reached a terminal status
    FileCompleted {
        job_id: Uuid,
        sequence: u64,
        filename: String,
        success: bool,
        /// Error classification, present iff `success` is false
        kind: Option<ErrorKind>,
        /// Human-readable failure reason, present iff `success` is false
        reason: Option<String>,
        /// Output path relative to the job's output tree, present on success
        output: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Aggregate job progress after a file terminal transition
    JobProgress {
        job_id: Uuid,
        sequence: u64,
        percent: f64,
        completed: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// Job reached a terminal status
    JobComplete {
        job_id: Uuid,
        sequence: u64,
        success: bool,
        /// Job-level failure reason (packaging or administrative), if any
        reason: Option<String>,
        summary: JobSummary,
        timestamp: DateTime<Utc>,
    },

    /// Free-form diagnostic line associated with the job
    Log {
        job_id: Uuid,
        sequence: u64,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// Job this event belongs to
    pub fn job_id(&self) -> Uuid {
        match self {
            ProgressEvent::JobStarted { job_id, .. }
            | ProgressEvent::FileStarted { job_id, .. }
            | ProgressEvent::FileStage { job_id, .. }
            | ProgressEvent::FileCompleted { job_id, .. }
            | ProgressEvent::JobProgress { job_id, .. }
            | ProgressEvent::JobComplete { job_id, .. }
            | ProgressEvent::Log { job_id, .. } => *job_id,
        }
    }

    /// Per-job sequence number (strictly increasing, gap-free)
    pub fn sequence(&self) -> u64 {
        match self {
            ProgressEvent::JobStarted { sequence, .. }
            | ProgressEvent::FileStarted { sequence, .. }
            | ProgressEvent::FileStage { sequence, .. }
            | ProgressEvent::FileCompleted { sequence, .. }
            | ProgressEvent::JobProgress { sequence, .. }
            | ProgressEvent::JobComplete { sequence, .. }
            | ProgressEvent::Log { sequence, .. } => *sequence,
        }
    }

    /// Event type as it appears on the wire, for filtering and logging
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressEvent::JobStarted { .. } => "job_started",
            ProgressEvent::FileStarted { .. } => "file_started",
            ProgressEvent::FileStage { .. } => "file_stage",
            ProgressEvent::FileCompleted { .. } => "file_completed",
            ProgressEvent::JobProgress { .. } => "job_progress",
            ProgressEvent::JobComplete { .. } => "job_complete",
            ProgressEvent::Log { .. } => "log",
        }
    }

    /// True for `job_complete`
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::JobComplete { .. })
    }
}
