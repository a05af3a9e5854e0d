//! Test doubles for the pipeline's external collaborators
//!
//! Used by the unit tests in this crate and by the integration tests; the
//! stubs produce real (tiny) WAV intermediates so the full pipeline runs
//! without ffmpeg or a denoising model installed.

use std::path::Path;
use std::sync::{Arc, Mutex};

use super::denoise::{IdentityDenoiser, SharedDenoiser};
use super::transcode::{AudioProbe, EncodeParams, TranscodeError, Transcoder};
use super::wav;

/// Sample rate of every stub intermediate; matches the models' internal
/// rate so the denoise stage's resampling becomes a pass-through
pub const STUB_RATE: u32 = 16_000;

/// In-process stand-in for the ffmpeg collaborator.
///
/// Each `fail_*_for` marker makes the corresponding operation fail for any
/// path containing the marker, which is how the tests target one file of a
/// multi-file job.
#[derive(Debug, Default, Clone)]
pub struct StubTranscoder {
    pub fail_convert_for: Option<String>,
    pub fail_filter_for: Option<String>,
    pub fail_encode_for: Option<String>,
}

impl StubTranscoder {
    pub fn failing_convert(marker: &str) -> Self {
        Self {
            fail_convert_for: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_filter(marker: &str) -> Self {
        Self {
            fail_filter_for: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_encode(marker: &str) -> Self {
        Self {
            fail_encode_for: Some(marker.to_string()),
            ..Self::default()
        }
    }

    fn check(marker: &Option<String>, path: &Path, what: &str) -> Result<(), TranscodeError> {
        if let Some(marker) = marker {
            if path.to_string_lossy().contains(marker.as_str()) {
                return Err(TranscodeError::Failed {
                    tool: "stub".to_string(),
                    status: 1,
                    stderr: format!("synthetic {what} failure"),
                });
            }
        }
        Ok(())
    }
}

impl Transcoder for StubTranscoder {
    fn probe(&self, _input: &Path) -> Result<AudioProbe, TranscodeError> {
        Ok(AudioProbe {
            sample_rate: STUB_RATE,
            channels: 1,
            codec: Some("stub".to_string()),
        })
    }

    fn convert_to_wav(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        Self::check(&self.fail_convert_for, input, "convert")?;
        write_stub_wav(output);
        Ok(())
    }

    fn run_filters(
        &self,
        input: &Path,
        _filters: &[&str],
        output: &Path,
    ) -> Result<(), TranscodeError> {
        Self::check(&self.fail_filter_for, input, "filter")?;
        std::fs::copy(input, output).map_err(|source| TranscodeError::Spawn {
            tool: "stub".to_string(),
            source,
        })?;
        Ok(())
    }

    fn encode(
        &self,
        input: &Path,
        _params: &EncodeParams,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        Self::check(&self.fail_encode_for, input, "encode")?;
        std::fs::copy(input, output).map_err(|source| TranscodeError::Spawn {
            tool: "stub".to_string(),
            source,
        })?;
        Ok(())
    }
}

/// Shared pass-through denoiser at the stub rate
pub fn identity_denoiser() -> SharedDenoiser {
    Arc::new(Mutex::new(IdentityDenoiser::new(STUB_RATE)))
}

/// Write a short, real WAV file at `path`, creating parent directories.
///
/// Valid whatever extension the path carries, so `.wav` inputs survive the
/// runner's copy fast-path and everything else goes through the stub
/// converter.
pub fn write_test_input(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create input dir");
    }
    write_stub_wav(path);
}

fn write_stub_wav(path: &Path) {
    let samples: Vec<f32> = (0..1600)
        .map(|i| (i as f32 * std::f32::consts::TAU * 440.0 / STUB_RATE as f32).sin() * 0.25)
        .collect();
    wav::write_wav_mono(path, &samples, STUB_RATE).expect("write stub wav");
}
