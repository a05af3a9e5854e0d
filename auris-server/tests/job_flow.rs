//! End-to-end job orchestration tests
//!
//! Drive the manager/store/bus core with stub collaborators: full success,
//! partial failure, single-worker fairness, cancellation, reconnect replay
//! and restart recovery.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use auris_common::config::AurisConfig;
use auris_common::events::{ErrorKind, ProgressEvent, Stage};
use auris_server::bus::ProgressBus;
use auris_server::manager::{JobManager, JobRequest, SubmittedFile};
use auris_server::models::{FileStatus, JobOptions, JobStatus, ModelVariant};
use auris_server::package::ZipPackager;
use auris_server::pipeline::denoise::{DenoiserProvider, ModelError, SharedDenoiser};
use auris_server::pipeline::test_utils::{identity_denoiser, write_test_input, StubTranscoder};
use auris_server::pipeline::transcode::{AudioProbe, EncodeParams, TranscodeError, Transcoder};
use auris_server::store::JobStateStore;
use tokio::sync::broadcast;
use uuid::Uuid;

const RECV_TIMEOUT: Duration = Duration::from_secs(20);

struct StubDenoisers;

impl DenoiserProvider for StubDenoisers {
    fn get(&self, _model: ModelVariant) -> Result<SharedDenoiser, ModelError> {
        Ok(identity_denoiser())
    }
}

/// Stub transcoder whose convert blocks for paths containing `gate_marker`
/// until the test releases it
struct GatedTranscoder {
    inner: StubTranscoder,
    gate_marker: String,
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl GatedTranscoder {
    fn new(marker: &str) -> (Self, Arc<(Mutex<bool>, Condvar)>) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        (
            Self {
                inner: StubTranscoder::default(),
                gate_marker: marker.to_string(),
                gate: gate.clone(),
            },
            gate,
        )
    }

    fn wait_for_release(&self) {
        let (lock, condvar) = &*self.gate;
        let mut released = lock.lock().expect("gate lock");
        while !*released {
            released = condvar.wait(released).expect("gate wait");
        }
    }
}

fn release(gate: &Arc<(Mutex<bool>, Condvar)>) {
    let (lock, condvar) = &**gate;
    *lock.lock().expect("gate lock") = true;
    condvar.notify_all();
}

impl Transcoder for GatedTranscoder {
    fn probe(&self, input: &Path) -> Result<AudioProbe, TranscodeError> {
        self.inner.probe(input)
    }

    fn convert_to_wav(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        if input.to_string_lossy().contains(self.gate_marker.as_str()) {
            self.wait_for_release();
        }
        self.inner.convert_to_wav(input, output)
    }

    fn run_filters(&self, input: &Path, filters: &[&str], output: &Path) -> Result<(), TranscodeError> {
        self.inner.run_filters(input, filters, output)
    }

    fn encode(&self, input: &Path, params: &EncodeParams, output: &Path) -> Result<(), TranscodeError> {
        self.inner.encode(input, params, output)
    }
}

async fn build_manager(
    dir: &Path,
    workers: usize,
    transcoder: Arc<dyn Transcoder>,
) -> Arc<JobManager> {
    let config = AurisConfig {
        data_dir: dir.to_path_buf(),
        workers,
        ..AurisConfig::default()
    };
    let pool = auris_server::db::init_database_pool(&config.database_path())
        .await
        .expect("pool");
    let store = Arc::new(JobStateStore::new(pool));
    let bus = Arc::new(ProgressBus::new(1024, config.replay_tail));
    let manager = JobManager::new(
        store,
        bus,
        transcoder,
        Arc::new(StubDenoisers),
        Arc::new(ZipPackager),
        &config,
    );
    manager.spawn_workers();
    manager
}

fn request_with(dir: &Path, names: &[&str]) -> JobRequest {
    let files = names
        .iter()
        .map(|name| {
            let path = dir.join("incoming").join(name);
            write_test_input(&path);
            SubmittedFile {
                filename: name.to_string(),
                path,
            }
        })
        .collect();
    JobRequest {
        label: Some("flow-test".to_string()),
        options: JobOptions::default(),
        files,
    }
}

/// Drain an observer (replay + live) until `job_complete`, de-duplicating
/// on sequence number the way a transport handler would
async fn drain_to_completion(
    history: Vec<ProgressEvent>,
    live: Option<broadcast::Receiver<ProgressEvent>>,
) -> Vec<ProgressEvent> {
    let mut events = history;
    let mut last_seq = events.last().map(|e| e.sequence()).unwrap_or(0);
    let mut terminal = events.iter().any(|e| e.is_terminal());

    if let Some(mut rx) = live {
        while !terminal {
            let event = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
                .await
                .expect("observer timed out");
            match event {
                Ok(event) => {
                    if event.sequence() <= last_seq {
                        continue;
                    }
                    last_seq = event.sequence();
                    terminal = event.is_terminal();
                    events.push(event);
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    panic!("test observer lagged by {n}");
                }
            }
        }
    }
    events
}

async fn observe_to_completion(manager: &Arc<JobManager>, job_id: Uuid) -> Vec<ProgressEvent> {
    let (history, live) = manager.subscribe(job_id).await.expect("subscribe");
    drain_to_completion(history, live).await
}

fn assert_gap_free_from_one(events: &[ProgressEvent]) {
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence()).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected, "sequences must be contiguous from 1");
}

fn archive_names(artifact: &Path) -> Vec<String> {
    let file = std::fs::File::open(artifact).expect("open artifact");
    let mut zip = zip::ZipArchive::new(file).expect("zip");
    let mut names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).expect("entry").name().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn end_to_end_success_emits_the_full_event_sequence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = build_manager(dir.path(), 1, Arc::new(StubTranscoder::default())).await;

    let names = ["one.mp3", "two.mp3", "three.mp3"];
    let job = manager
        .submit(request_with(dir.path(), &names))
        .await
        .expect("submit");
    assert_eq!(job.status, JobStatus::Queued);

    let events = observe_to_completion(&manager, job.id).await;
    assert_gap_free_from_one(&events);

    // job_started first, then per file: file_started, 5 stages,
    // file_completed, job_progress; job_complete last
    let mut iter = events.iter();
    assert!(matches!(iter.next(), Some(ProgressEvent::JobStarted { total_files: 3, .. })));

    for name in names {
        match iter.next() {
            Some(ProgressEvent::FileStarted { filename, .. }) => assert_eq!(filename, name),
            other => panic!("expected file_started for {name}, got {other:?}"),
        }
        for expected_stage in Stage::ALL {
            match iter.next() {
                Some(ProgressEvent::FileStage { filename, stage, .. }) => {
                    assert_eq!(filename, name);
                    assert_eq!(*stage, expected_stage);
                }
                other => panic!("expected {expected_stage} for {name}, got {other:?}"),
            }
        }
        match iter.next() {
            Some(ProgressEvent::FileCompleted { filename, success: true, output: Some(output), .. }) => {
                assert_eq!(filename, name);
                assert_eq!(output, name, "output named identically to the input");
            }
            other => panic!("expected successful file_completed for {name}, got {other:?}"),
        }
        assert!(matches!(iter.next(), Some(ProgressEvent::JobProgress { .. })));
    }

    match iter.next() {
        Some(ProgressEvent::JobComplete { success: true, summary, .. }) => {
            assert_eq!(summary.succeeded, 3);
            assert_eq!(summary.failed, 0);
        }
        other => panic!("expected job_complete, got {other:?}"),
    }
    assert!(iter.next().is_none());

    // job_progress reaches 100
    let final_progress = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::JobProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .last()
        .expect("progress events");
    assert!((final_progress - 100.0).abs() < f64::EPSILON);

    // packaged artifact contains exactly the three outputs
    let stored = manager.store().get(job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.artifact_ready);
    let mut expected: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    expected.sort();
    assert_eq!(archive_names(&stored.paths.artifact_path), expected);
}

#[tokio::test]
async fn failing_file_never_blocks_or_fails_siblings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = build_manager(
        dir.path(),
        1,
        Arc::new(StubTranscoder::failing_filter("two")),
    )
    .await;

    let job = manager
        .submit(request_with(dir.path(), &["one.mp3", "two.mp3", "three.mp3"]))
        .await
        .expect("submit");

    let events = observe_to_completion(&manager, job.id).await;
    assert_gap_free_from_one(&events);

    let stored = manager.store().get(job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::CompletedWithErrors);
    assert_eq!(stored.file("one.mp3").expect("one").status, FileStatus::Succeeded);
    assert_eq!(stored.file("three.mp3").expect("three").status, FileStatus::Succeeded);

    let failed = stored.file("two.mp3").expect("two");
    assert_eq!(failed.status, FileStatus::Failed);
    let failure = failed.error.as_ref().expect("error recorded");
    assert_eq!(failure.kind, ErrorKind::Filter);
    assert_eq!(failed.stage, Some(Stage::Filter), "failure stage retained");

    match events.last().expect("events") {
        ProgressEvent::JobComplete { success, summary, .. } => {
            assert!(!success);
            assert_eq!(summary.succeeded, 2);
            assert_eq!(summary.failed, 1);
        }
        other => panic!("expected job_complete, got {other:?}"),
    }

    // Partial failure still yields an artifact with every succeeded file
    assert_eq!(
        archive_names(&stored.paths.artifact_path),
        vec!["one.mp3".to_string(), "three.mp3".to_string()]
    );
}

#[tokio::test]
async fn single_worker_finishes_job_a_before_starting_job_b() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = build_manager(dir.path(), 1, Arc::new(StubTranscoder::default())).await;

    let job_a = manager
        .submit(request_with(dir.path(), &["a1.mp3", "a2.mp3"]))
        .await
        .expect("submit a");
    let job_b = manager
        .submit(request_with(dir.path(), &["b1.mp3"]))
        .await
        .expect("submit b");

    let events_a = observe_to_completion(&manager, job_a.id).await;
    let events_b = observe_to_completion(&manager, job_b.id).await;
    assert!(events_a.iter().any(|e| e.is_terminal()));
    assert!(events_b.iter().any(|e| e.is_terminal()));

    let done_a = manager.store().get(job_a.id).await.expect("get").expect("a");
    let done_b = manager.store().get(job_b.id).await.expect("get").expect("b");
    let a_finished = done_a.finished_at.expect("a finished");
    let b_started = done_b.started_at.expect("b started");
    assert!(
        a_finished <= b_started,
        "job A must fully complete before job B starts (A finished {a_finished}, B started {b_started})"
    );
}

#[tokio::test]
async fn cancellation_lets_the_running_file_finish_and_cancels_the_rest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (transcoder, gate) = GatedTranscoder::new("one");
    let manager = build_manager(dir.path(), 1, Arc::new(transcoder)).await;

    let job = manager
        .submit(request_with(dir.path(), &["one.mp3", "two.mp3", "three.mp3"]))
        .await
        .expect("submit");

    let (history, live) = manager.subscribe(job.id).await.expect("subscribe");
    let mut rx = live.expect("live stream for queued job");
    let mut events = history;

    // Wait until file one's pipeline has been dispatched (its convert stage
    // is announced, while the stage itself blocks on the gate)
    loop {
        let event = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for convert")
            .expect("recv");
        events.push(event.clone());
        if matches!(
            &event,
            ProgressEvent::FileStage { filename, stage: Stage::Convert, .. } if filename == "one.mp3"
        ) {
            break;
        }
    }

    manager.cancel(job.id).await.expect("cancel");
    release(&gate);

    let events = drain_to_completion(events, Some(rx)).await;

    let stored = manager.store().get(job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::CompletedWithErrors);

    // The in-flight file ran to completion
    assert_eq!(stored.file("one.mp3").expect("one").status, FileStatus::Succeeded);

    // Queued files were failed as cancelled without ever being dispatched
    for name in ["two.mp3", "three.mp3"] {
        let file = stored.file(name).expect(name);
        assert_eq!(file.status, FileStatus::Failed);
        assert_eq!(file.error.as_ref().expect("error").kind, ErrorKind::Cancelled);
        assert!(
            !events.iter().any(|e| matches!(
                e,
                ProgressEvent::FileStarted { filename, .. } if filename == name
            )),
            "{name} must never be dispatched"
        );
    }
}

#[tokio::test]
async fn reconnecting_observer_replays_without_gaps_or_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (transcoder, gate) = GatedTranscoder::new("two");
    let manager = build_manager(dir.path(), 1, Arc::new(transcoder)).await;

    let job = manager
        .submit(request_with(dir.path(), &["one.mp3", "two.mp3"]))
        .await
        .expect("submit");

    // First observer watches until file two is mid-convert
    let (history, live) = manager.subscribe(job.id).await.expect("subscribe");
    let mut rx = live.expect("live stream");
    let mut seen = history;
    loop {
        let event = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .expect("recv");
        seen.push(event.clone());
        if matches!(
            &event,
            ProgressEvent::FileStage { filename, stage: Stage::Convert, .. } if filename == "two.mp3"
        ) {
            break;
        }
    }
    assert!(!seen.is_empty());
    drop(rx); // first observer disconnects mid-job

    // Reconnect: replay must cover everything so far, then live events
    // continue seamlessly
    let (history, live) = manager.subscribe(job.id).await.expect("resubscribe");
    assert!(
        history.last().expect("history").sequence() >= seen.last().expect("seen").sequence(),
        "replay covers everything a previous observer saw"
    );
    release(&gate);
    let events = drain_to_completion(history, live).await;

    assert_gap_free_from_one(&events);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::JobComplete { success: true, .. })
    ));
}

#[tokio::test]
async fn persisted_state_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let job_id;
    {
        let manager = build_manager(dir.path(), 1, Arc::new(StubTranscoder::default())).await;
        let job = manager
            .submit(request_with(dir.path(), &["one.mp3", "two.mp3"]))
            .await
            .expect("submit");
        job_id = job.id;
        let events = observe_to_completion(&manager, job_id).await;
        assert!(events.iter().any(|e| e.is_terminal()));
    }

    // "Restart": a fresh store over the same database, no in-memory state
    let pool = auris_server::db::init_database_pool(
        &dir.path().join("auris.db"),
    )
    .await
    .expect("pool");
    let recovered = auris_server::db::jobs::fail_stale_jobs(&pool).await.expect("recover");
    assert_eq!(recovered, 0, "terminal jobs are untouched by recovery");

    let store = JobStateStore::new(pool);
    let job = store.get(job_id).await.expect("get").expect("job survives restart");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.files.len(), 2);
    assert!(job.files.iter().all(|f| f.status == FileStatus::Succeeded));

    // The durable event log still replays in full
    let events = store.events(job_id, 0).await.expect("events");
    assert_gap_free_from_one(&events);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::JobComplete { success: true, .. })
    ));
}

#[tokio::test]
async fn pipeline_panic_is_contained_to_one_file() {
    struct PanickingTranscoder {
        inner: StubTranscoder,
    }

    impl Transcoder for PanickingTranscoder {
        fn probe(&self, input: &Path) -> Result<AudioProbe, TranscodeError> {
            self.inner.probe(input)
        }

        fn convert_to_wav(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
            if input.to_string_lossy().contains("two") {
                panic!("synthetic defect in the convert collaborator");
            }
            self.inner.convert_to_wav(input, output)
        }

        fn run_filters(&self, input: &Path, filters: &[&str], output: &Path) -> Result<(), TranscodeError> {
            self.inner.run_filters(input, filters, output)
        }

        fn encode(&self, input: &Path, params: &EncodeParams, output: &Path) -> Result<(), TranscodeError> {
            self.inner.encode(input, params, output)
        }
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let manager = build_manager(
        dir.path(),
        1,
        Arc::new(PanickingTranscoder {
            inner: StubTranscoder::default(),
        }),
    )
    .await;

    let job = manager
        .submit(request_with(dir.path(), &["one.mp3", "two.mp3", "three.mp3"]))
        .await
        .expect("submit");

    let events = observe_to_completion(&manager, job.id).await;
    assert_gap_free_from_one(&events);

    let stored = manager.store().get(job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::CompletedWithErrors);
    assert_eq!(stored.file("one.mp3").expect("one").status, FileStatus::Succeeded);
    assert_eq!(stored.file("three.mp3").expect("three").status, FileStatus::Succeeded);
    assert_eq!(
        stored
            .file("two.mp3")
            .expect("two")
            .error
            .as_ref()
            .expect("error")
            .kind,
        ErrorKind::InternalFault
    );
}
