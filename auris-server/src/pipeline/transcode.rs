//! Transcode/filter collaborator boundary
//!
//! Contract: given an input file path, an ordered filter-chain specification
//! and target encoding parameters, produce an output file and a process exit
//! status. A non-zero exit status is always a stage failure. The production
//! implementation shells out to ffmpeg/ffprobe with blocking
//! `std::process::Command` calls, so it must only be invoked from a worker
//! context.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Cleanup filter chain applied between denoising and encoding, in order:
/// click/pop removal, de-reverb, noise gating, speech dynamics
/// normalization, final loudness normalization.
pub const CLEANUP_FILTERS: &[&str] = &["adeclick", "anlmdn", "agate", "speechnorm", "loudnorm"];

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {status}: {stderr}")]
    Failed {
        tool: String,
        status: i32,
        stderr: String,
    },
}

/// Probed properties of an input file
#[derive(Debug, Clone)]
pub struct AudioProbe {
    pub sample_rate: u32,
    pub channels: u16,
    pub codec: Option<String>,
}

impl Default for AudioProbe {
    fn default() -> Self {
        // Conservative fallback when probing fails: assume high-rate mono
        Self {
            sample_rate: 48_000,
            channels: 1,
            codec: None,
        }
    }
}

/// Target encoding parameters for the final output
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Output sample rate (the input's original rate is preserved)
    pub sample_rate: u32,
    /// High bitrate tier (256k AAC / 320k MP3) vs low (128k / 192k)
    pub high_bitrate: bool,
}

/// External transcode/filter collaborator
pub trait Transcoder: Send + Sync {
    /// Probe the input's stream properties
    fn probe(&self, input: &Path) -> Result<AudioProbe, TranscodeError>;

    /// Canonicalize any supported input to 48 kHz mono WAV
    fn convert_to_wav(&self, input: &Path, output: &Path) -> Result<(), TranscodeError>;

    /// Apply an ordered filter chain, WAV in, WAV out
    fn run_filters(
        &self,
        input: &Path,
        filters: &[&str],
        output: &Path,
    ) -> Result<(), TranscodeError>;

    /// Encode a WAV intermediate to the final format implied by `output`'s
    /// extension
    fn encode(
        &self,
        input: &Path,
        params: &EncodeParams,
        output: &Path,
    ) -> Result<(), TranscodeError>;
}

/// ffmpeg/ffprobe-backed production transcoder
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn run(&self, tool: &str, args: &[String]) -> Result<String, TranscodeError> {
        let output = Command::new(tool)
            .args(args)
            .output()
            .map_err(|source| TranscodeError::Spawn {
                tool: tool.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(TranscodeError::Failed {
                tool: tool.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Transcoder for FfmpegTranscoder {
    fn probe(&self, input: &Path) -> Result<AudioProbe, TranscodeError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "stream=sample_rate,codec_name,channels".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1".to_string(),
            input.display().to_string(),
        ];
        let stdout = self.run(&self.ffprobe, &args)?;
        Ok(parse_probe_output(&stdout))
    }

    fn convert_to_wav(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-ar".to_string(),
            "48000".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            output.display().to_string(),
            "-y".to_string(),
        ];
        self.run(&self.ffmpeg, &args).map(|_| ())
    }

    fn run_filters(
        &self,
        input: &Path,
        filters: &[&str],
        output: &Path,
    ) -> Result<(), TranscodeError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-af".to_string(),
            filters.join(","),
            output.display().to_string(),
            "-y".to_string(),
        ];
        self.run(&self.ffmpeg, &args).map(|_| ())
    }

    fn encode(
        &self,
        input: &Path,
        params: &EncodeParams,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        let extension = output
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let mut args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
        ];
        args.extend(codec_args(&extension, params));
        args.push(output.display().to_string());
        args.push("-y".to_string());

        self.run(&self.ffmpeg, &args).map(|_| ())
    }
}

/// Codec argument table by output extension.
///
/// Unknown extensions fall back to AAC, mirroring the delivery formats the
/// service accepts on input.
fn codec_args(extension: &str, params: &EncodeParams) -> Vec<String> {
    let rate = params.sample_rate.to_string();
    match extension {
        "m4a" | "aac" | "mp4" => {
            let bitrate = if params.high_bitrate { "256k" } else { "128k" };
            vec![
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                bitrate.into(),
                "-ar".into(),
                rate,
                "-q:a".into(),
                "2".into(),
            ]
        }
        "mp3" => {
            let bitrate = if params.high_bitrate { "320k" } else { "192k" };
            vec![
                "-c:a".into(),
                "libmp3lame".into(),
                "-b:a".into(),
                bitrate.into(),
                "-ar".into(),
                rate,
                "-q:a".into(),
                "0".into(),
            ]
        }
        "flac" => vec![
            "-c:a".into(),
            "flac".into(),
            "-ar".into(),
            rate,
            "-compression_level".into(),
            "8".into(),
        ],
        "wav" => vec!["-c:a".into(), "pcm_s16le".into(), "-ar".into(), rate],
        _ => {
            let bitrate = if params.high_bitrate { "256k" } else { "128k" };
            vec![
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                bitrate.into(),
                "-ar".into(),
                rate,
            ]
        }
    }
}

/// Parse ffprobe `key=value` line output
fn parse_probe_output(stdout: &str) -> AudioProbe {
    let mut probe = AudioProbe::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "sample_rate" => {
                if let Ok(rate) = value.trim().parse() {
                    probe.sample_rate = rate;
                }
            }
            "channels" => {
                if let Ok(channels) = value.trim().parse() {
                    probe.channels = channels;
                }
            }
            "codec_name" => probe.codec = Some(value.trim().to_string()),
            _ => {}
        }
    }
    probe
}
