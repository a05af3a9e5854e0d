//! Per-file pipeline runner
//!
//! Executes the fixed stage sequence against one input file and yields a
//! lazy sequence of events: a stage-entry event before each stage begins,
//! then exactly one terminal outcome. The consumer drives execution by
//! iterating, which keeps the runner decoupled from any delivery transport.
//!
//! The final output is never written in place: the encode stage renders to
//! a staging file and the result is atomically placed into the output tree
//! only on full success, so observers of the output directory never see a
//! partially-written file.

use auris_common::config::OverwritePolicy;
use auris_common::events::{ErrorKind, Stage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::denoise::SharedDenoiser;
use super::resample::resample_mono;
use super::transcode::{EncodeParams, Transcoder, CLEANUP_FILTERS};
use super::wav;

/// Everything the runner needs to process one file
#[derive(Debug, Clone)]
pub struct FileRequest {
    /// Relative path within the job's input set
    pub filename: String,
    /// Absolute location of the input file
    pub source: PathBuf,
    /// Root of the job's output tree
    pub output_dir: PathBuf,
    /// Scratch directory for intermediates
    pub temp_dir: PathBuf,
    /// Suffix appended to the output stem
    pub suffix: String,
    /// High bitrate encoding tier
    pub high_bitrate: bool,
    /// Apply the cleanup filter chain
    pub apply_filters: bool,
    /// Behavior when the output already exists
    pub overwrite: OverwritePolicy,
}

/// Terminal outcome of one file's pipeline
#[derive(Debug, Clone)]
pub enum FileOutcome {
    /// Output placed at `output` (relative to the job's output tree)
    Succeeded { output: PathBuf },
    /// Classified failure; the stage at fault is recorded on the task
    Failed { kind: ErrorKind, message: String },
}

/// One item of the runner's lazy event sequence
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The named stage is about to begin
    Stage(Stage),
    /// The pipeline finished; no further events follow
    Finished(FileOutcome),
}

/// Executes per-file pipelines against a pair of collaborators
pub struct PipelineRunner {
    transcoder: Arc<dyn Transcoder>,
    denoiser: SharedDenoiser,
}

impl PipelineRunner {
    pub fn new(transcoder: Arc<dyn Transcoder>, denoiser: SharedDenoiser) -> Self {
        Self {
            transcoder,
            denoiser,
        }
    }

    /// Begin processing one file.
    ///
    /// Nothing happens until the returned sequence is iterated; each call to
    /// `next` either announces the upcoming stage or executes one stage and
    /// announces the next. All execution is blocking.
    pub fn run(&self, request: FileRequest) -> PipelineRun<'_> {
        PipelineRun::new(self, request)
    }
}

type StageResult = Result<(), (ErrorKind, String)>;

enum RunState {
    Start,
    Execute(usize),
    Done,
}

/// Lazy, single-pass event sequence for one file (see [`PipelineRunner::run`])
pub struct PipelineRun<'a> {
    runner: &'a PipelineRunner,
    request: FileRequest,
    state: RunState,
    // Populated by setup and the stages, in order
    rel_output: PathBuf,
    final_output: PathBuf,
    staging_output: PathBuf,
    canonical_wav: PathBuf,
    denoised_wav: PathBuf,
    filtered_wav: PathBuf,
    original_rate: u32,
    denoised: Option<Vec<f32>>,
    model_rate: u32,
    encode_input: PathBuf,
}

impl<'a> PipelineRun<'a> {
    fn new(runner: &'a PipelineRunner, request: FileRequest) -> Self {
        Self {
            runner,
            request,
            state: RunState::Start,
            rel_output: PathBuf::new(),
            final_output: PathBuf::new(),
            staging_output: PathBuf::new(),
            canonical_wav: PathBuf::new(),
            denoised_wav: PathBuf::new(),
            filtered_wav: PathBuf::new(),
            original_rate: 48_000,
            denoised: None,
            model_rate: 0,
            encode_input: PathBuf::new(),
        }
    }

    /// Resolve paths and apply the skip policy. Returns the existing output
    /// when the file can be skipped outright.
    fn setup(&mut self) -> Result<Option<PathBuf>, (ErrorKind, String)> {
        let rel = Path::new(&self.request.filename);
        let stem = rel
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
            .to_string();
        let extension = rel
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("wav")
            .to_ascii_lowercase();

        let output_name = format!("{stem}{}.{extension}", self.request.suffix);
        self.rel_output = match rel.parent() {
            Some(parent) if parent != Path::new("") => parent.join(&output_name),
            _ => PathBuf::from(&output_name),
        };
        self.final_output = self.request.output_dir.join(&self.rel_output);

        if self.final_output.exists() && self.request.overwrite == OverwritePolicy::Skip {
            debug!(file = %self.request.filename, "Output already present, skipping");
            return Ok(Some(self.rel_output.clone()));
        }

        // Flatten subdirectories into the scratch names so sibling files
        // never collide in the shared temp dir
        let tag: String = self
            .request
            .filename
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.canonical_wav = self.request.temp_dir.join(format!("{tag}_input.wav"));
        self.denoised_wav = self.request.temp_dir.join(format!("{tag}_denoised.wav"));
        self.filtered_wav = self.request.temp_dir.join(format!("{tag}_filtered.wav"));
        self.staging_output = self
            .request
            .temp_dir
            .join(format!("{tag}_staged.{extension}"));

        let mkdirs = std::fs::create_dir_all(&self.request.temp_dir).and_then(|_| {
            match self.final_output.parent() {
                Some(parent) => std::fs::create_dir_all(parent),
                None => Ok(()),
            }
        });
        mkdirs.map_err(|e| {
            (
                ErrorKind::InternalFault,
                format!("failed to prepare working directories: {e}"),
            )
        })?;

        Ok(None)
    }

    fn execute(&mut self, stage: Stage) -> StageResult {
        match stage {
            Stage::Convert => self.stage_convert(),
            Stage::Denoise => self.stage_denoise(),
            Stage::Upsample => self.stage_upsample(),
            Stage::Filter => self.stage_filter(),
            Stage::Encode => self.stage_encode(),
        }
    }

    fn stage_convert(&mut self) -> StageResult {
        // Probing is advisory: on failure the conservative default rate is
        // kept and conversion decides whether the input is usable at all
        match self.runner.transcoder.probe(&self.request.source) {
            Ok(probe) => self.original_rate = probe.sample_rate,
            Err(e) => {
                warn!(file = %self.request.filename, error = %e, "Probe failed, assuming 48 kHz");
            }
        }

        let is_wav = self
            .request
            .source
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("wav"));

        if is_wav {
            std::fs::copy(&self.request.source, &self.canonical_wav)
                .map(|_| ())
                .map_err(|e| (ErrorKind::Conversion, format!("failed to stage WAV input: {e}")))
        } else {
            self.runner
                .transcoder
                .convert_to_wav(&self.request.source, &self.canonical_wav)
                .map_err(|e| (ErrorKind::Conversion, e.to_string()))
        }
    }

    fn stage_denoise(&mut self) -> StageResult {
        let (samples, rate) = wav::read_wav_mono(&self.canonical_wav)
            .map_err(|e| (ErrorKind::Model, format!("failed to read canonical WAV: {e}")))?;

        let mut model = self
            .runner
            .denoiser
            .lock()
            .map_err(|_| (ErrorKind::Model, "denoiser instance poisoned".to_string()))?;

        self.model_rate = model.sample_rate();
        let at_model_rate = resample_mono(&samples, rate, self.model_rate)
            .map_err(|e| (ErrorKind::Model, e.to_string()))?;
        let denoised = model
            .denoise(&at_model_rate)
            .map_err(|e| (ErrorKind::Model, e.to_string()))?;

        self.denoised = Some(denoised);
        Ok(())
    }

    fn stage_upsample(&mut self) -> StageResult {
        let denoised = self.denoised.take().unwrap_or_default();
        let restored = resample_mono(&denoised, self.model_rate, self.original_rate)
            .map_err(|e| (ErrorKind::Model, e.to_string()))?;

        wav::write_wav_mono(&self.denoised_wav, &restored, self.original_rate)
            .map_err(|e| (ErrorKind::Model, format!("failed to write denoised WAV: {e}")))
    }

    fn stage_filter(&mut self) -> StageResult {
        if !self.request.apply_filters {
            self.encode_input = self.denoised_wav.clone();
            return Ok(());
        }

        self.runner
            .transcoder
            .run_filters(&self.denoised_wav, CLEANUP_FILTERS, &self.filtered_wav)
            .map_err(|e| (ErrorKind::Filter, e.to_string()))?;
        self.encode_input = self.filtered_wav.clone();
        Ok(())
    }

    fn stage_encode(&mut self) -> StageResult {
        let params = EncodeParams {
            sample_rate: self.original_rate,
            high_bitrate: self.request.high_bitrate,
        };
        self.runner
            .transcoder
            .encode(&self.encode_input, &params, &self.staging_output)
            .map_err(|e| (ErrorKind::Encode, e.to_string()))?;

        place_atomically(&self.staging_output, &self.final_output)
            .map_err(|e| (ErrorKind::Encode, format!("failed to place output: {e}")))
    }

    /// Best-effort removal of this file's intermediates
    fn cleanup(&self) {
        for path in [
            &self.canonical_wav,
            &self.denoised_wav,
            &self.filtered_wav,
            &self.staging_output,
        ] {
            if path.as_os_str().is_empty() {
                continue;
            }
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Iterator for PipelineRun<'_> {
    type Item = RunEvent;

    fn next(&mut self) -> Option<RunEvent> {
        match self.state {
            RunState::Start => match self.setup() {
                Ok(Some(existing)) => {
                    self.state = RunState::Done;
                    Some(RunEvent::Finished(FileOutcome::Succeeded { output: existing }))
                }
                Ok(None) => {
                    self.state = RunState::Execute(0);
                    Some(RunEvent::Stage(Stage::ALL[0]))
                }
                Err((kind, message)) => {
                    self.state = RunState::Done;
                    Some(RunEvent::Finished(FileOutcome::Failed { kind, message }))
                }
            },
            RunState::Execute(index) => {
                let stage = Stage::ALL[index];
                match self.execute(stage) {
                    Err((kind, message)) => {
                        self.cleanup();
                        self.state = RunState::Done;
                        debug!(file = %self.request.filename, stage = %stage, "Stage failed: {message}");
                        Some(RunEvent::Finished(FileOutcome::Failed { kind, message }))
                    }
                    Ok(()) => {
                        if index + 1 < Stage::ALL.len() {
                            self.state = RunState::Execute(index + 1);
                            Some(RunEvent::Stage(Stage::ALL[index + 1]))
                        } else {
                            self.cleanup();
                            self.state = RunState::Done;
                            Some(RunEvent::Finished(FileOutcome::Succeeded {
                                output: self.rel_output.clone(),
                            }))
                        }
                    }
                }
            }
            RunState::Done => None,
        }
    }
}

/// Move `staging` to `target` without ever exposing a partial file at
/// `target`.
///
/// A plain rename when both live on the same filesystem; otherwise the
/// staging file is copied next to the target first and renamed into place
/// from there.
fn place_atomically(staging: &Path, target: &Path) -> std::io::Result<()> {
    match std::fs::rename(staging, target) {
        Ok(()) => Ok(()),
        Err(_) => {
            let name = target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("output");
            let sibling = target.with_file_name(format!(".{name}.part"));
            std::fs::copy(staging, &sibling)?;
            let _ = std::fs::remove_file(staging);
            std::fs::rename(&sibling, target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_utils::{identity_denoiser, write_test_input, StubTranscoder};

    fn request(dir: &Path, filename: &str) -> FileRequest {
        FileRequest {
            filename: filename.to_string(),
            source: dir.join("in").join(filename),
            output_dir: dir.join("out"),
            temp_dir: dir.join("tmp"),
            suffix: String::new(),
            high_bitrate: true,
            apply_filters: true,
            overwrite: OverwritePolicy::Overwrite,
        }
    }

    fn runner_with(transcoder: StubTranscoder) -> PipelineRunner {
        PipelineRunner::new(Arc::new(transcoder), identity_denoiser())
    }

    #[test]
    fn successful_run_announces_every_stage_then_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path(), "voice.mp3");
        write_test_input(&req.source);

        let runner = runner_with(StubTranscoder::default());
        let events: Vec<RunEvent> = runner.run(req.clone()).collect();

        assert_eq!(events.len(), 6);
        for (event, expected) in events.iter().zip(Stage::ALL.iter()) {
            match event {
                RunEvent::Stage(stage) => assert_eq!(stage, expected),
                other => panic!("expected stage event, got {other:?}"),
            }
        }
        match &events[5] {
            RunEvent::Finished(FileOutcome::Succeeded { output }) => {
                assert_eq!(output, &PathBuf::from("voice.mp3"));
                assert!(req.output_dir.join(output).exists());
            }
            other => panic!("expected success, got {other:?}"),
        }
        // Intermediates are cleaned up
        assert_eq!(std::fs::read_dir(&req.temp_dir).expect("temp").count(), 0);
    }

    #[test]
    fn filter_failure_stops_before_encode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path(), "voice.mp3");
        write_test_input(&req.source);

        let runner = runner_with(StubTranscoder::failing_filter("voice"));
        let events: Vec<RunEvent> = runner.run(req.clone()).collect();

        // convert, denoise, upsample, filter announced; encode never is
        assert_eq!(events.len(), 5);
        match &events[4] {
            RunEvent::Finished(FileOutcome::Failed { kind, message }) => {
                assert_eq!(*kind, ErrorKind::Filter);
                assert!(message.contains("synthetic"), "stderr surfaced: {message}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!req.output_dir.join("voice.mp3").exists(), "no partial output");
    }

    #[test]
    fn conversion_failure_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path(), "voice.mp3");
        write_test_input(&req.source);

        let runner = runner_with(StubTranscoder::failing_convert("voice"));
        let events: Vec<RunEvent> = runner.run(req).collect();

        assert_eq!(events.len(), 2, "convert announced, then failure");
        match &events[1] {
            RunEvent::Finished(FileOutcome::Failed { kind, .. }) => {
                assert_eq!(*kind, ErrorKind::Conversion);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn suffix_and_subdirectories_shape_the_output_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut req = request(dir.path(), "inner/take.flac");
        req.suffix = "_enhanced".to_string();
        write_test_input(&req.source);

        let runner = runner_with(StubTranscoder::default());
        let events: Vec<RunEvent> = runner.run(req.clone()).collect();

        match events.last().expect("events") {
            RunEvent::Finished(FileOutcome::Succeeded { output }) => {
                assert_eq!(output, &PathBuf::from("inner/take_enhanced.flac"));
                assert!(req.output_dir.join(output).exists());
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn skip_policy_short_circuits_on_existing_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut req = request(dir.path(), "voice.mp3");
        req.overwrite = OverwritePolicy::Skip;
        write_test_input(&req.source);

        std::fs::create_dir_all(&req.output_dir).expect("mkdir");
        std::fs::write(req.output_dir.join("voice.mp3"), b"already there").expect("write");

        let runner = runner_with(StubTranscoder::default());
        let events: Vec<RunEvent> = runner.run(req.clone()).collect();

        assert_eq!(events.len(), 1, "no stages run");
        match &events[0] {
            RunEvent::Finished(FileOutcome::Succeeded { output }) => {
                assert_eq!(output, &PathBuf::from("voice.mp3"));
            }
            other => panic!("expected skip success, got {other:?}"),
        }
        let contents = std::fs::read(req.output_dir.join("voice.mp3")).expect("read");
        assert_eq!(contents, b"already there", "existing output untouched");
    }

    #[test]
    fn rerunning_with_overwrite_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path(), "voice.mp3");
        write_test_input(&req.source);

        let runner = runner_with(StubTranscoder::default());
        for _ in 0..2 {
            let events: Vec<RunEvent> = runner.run(req.clone()).collect();
            match events.last().expect("events") {
                RunEvent::Finished(FileOutcome::Succeeded { output }) => {
                    assert_eq!(output, &PathBuf::from("voice.mp3"));
                }
                other => panic!("expected success, got {other:?}"),
            }
        }
        assert!(req.output_dir.join("voice.mp3").exists());
    }

    #[test]
    fn filters_are_skipped_when_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut req = request(dir.path(), "voice.mp3");
        req.apply_filters = false;
        write_test_input(&req.source);

        // A transcoder that would fail the filter stage proves it never runs
        let runner = runner_with(StubTranscoder::failing_filter("voice"));
        let events: Vec<RunEvent> = runner.run(req).collect();

        assert_eq!(events.len(), 6);
        assert!(matches!(
            events.last(),
            Some(RunEvent::Finished(FileOutcome::Succeeded { .. }))
        ));
    }
}
