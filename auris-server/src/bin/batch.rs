//! auris-batch - local batch enhancement without the HTTP layer
//!
//! Runs the same per-file pipeline as the service over a local directory,
//! printing per-file progress and a final summary. Useful for one-off runs
//! and for exercising a denoiser/ffmpeg installation.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use auris_common::config::OverwritePolicy;
use auris_server::discovery::{find_audio_files, SUPPORTED_EXTENSIONS};
use auris_server::models::ModelVariant;
use auris_server::pipeline::denoise::{ConfiguredDenoisers, DenoiserProvider};
use auris_server::pipeline::runner::{FileOutcome, FileRequest, PipelineRunner, RunEvent};
use auris_server::pipeline::transcode::FfmpegTranscoder;

/// Enhance every audio file in a directory
#[derive(Debug, Parser)]
#[command(name = "auris-batch", version)]
struct Args {
    /// Input directory containing audio files
    #[arg(long, default_value = "original-audios")]
    input: PathBuf,

    /// Output directory for enhanced audio
    #[arg(long, default_value = "enhanced-audios")]
    output: PathBuf,

    /// Denoising model variant (dns48, dns64, master64)
    #[arg(long, default_value = "dns64")]
    model: ModelVariant,

    /// Temporary directory for intermediate files
    #[arg(long, default_value = "tmp")]
    temp_dir: PathBuf,

    /// Use the lower bitrate tier (128k AAC / 192k MP3)
    #[arg(long)]
    low_bitrate: bool,

    /// Suffix to add to output filenames (default: none, keeps original name)
    #[arg(long, default_value = "")]
    suffix: String,

    /// Process subdirectories recursively
    #[arg(long)]
    recursive: bool,

    /// Skip the cleanup filter chain (adeclick … loudnorm)
    #[arg(long)]
    no_loudnorm: bool,

    /// Skip files whose output already exists instead of overwriting
    #[arg(long)]
    skip_existing: bool,

    /// External denoiser command template ({model}, {input}, {output})
    #[arg(long, env = "AURIS_DENOISER_COMMAND")]
    denoiser_command: Option<String>,

    /// ffmpeg executable
    #[arg(long, default_value = "ffmpeg", env = "AURIS_FFMPEG")]
    ffmpeg: String,

    /// ffprobe executable
    #[arg(long, default_value = "ffprobe", env = "AURIS_FFPROBE")]
    ffprobe: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    if !args.input.is_dir() {
        bail!("input directory does not exist: {}", args.input.display());
    }

    let files = find_audio_files(&args.input, args.recursive);
    if files.is_empty() {
        bail!(
            "no supported audio files found in {} (supported: {})",
            args.input.display(),
            SUPPORTED_EXTENSIONS.join(", ")
        );
    }
    println!("Found {} audio file(s) in {}", files.len(), args.input.display());

    let transcoder = Arc::new(FfmpegTranscoder::new(args.ffmpeg.clone(), args.ffprobe.clone()));
    let denoisers = ConfiguredDenoisers::new(args.denoiser_command.clone(), args.temp_dir.clone());
    let denoiser = denoisers
        .get(args.model)
        .context("failed to initialize denoiser")?;
    let runner = PipelineRunner::new(transcoder, denoiser);

    let overwrite = if args.skip_existing {
        OverwritePolicy::Skip
    } else {
        OverwritePolicy::Overwrite
    };

    let started = Instant::now();
    let mut succeeded: Vec<String> = Vec::new();
    let mut failed: Vec<(String, String)> = Vec::new();

    for (index, source) in files.iter().enumerate() {
        let filename = source
            .strip_prefix(&args.input)
            .unwrap_or(source)
            .to_string_lossy()
            .into_owned();
        println!("\n[{}/{}] {filename}", index + 1, files.len());

        let request = FileRequest {
            filename: filename.clone(),
            source: source.clone(),
            output_dir: args.output.clone(),
            temp_dir: args.temp_dir.clone(),
            suffix: args.suffix.clone(),
            high_bitrate: !args.low_bitrate,
            apply_filters: !args.no_loudnorm,
            overwrite,
        };

        for event in runner.run(request) {
            match event {
                RunEvent::Stage(stage) => println!("    {stage}..."),
                RunEvent::Finished(FileOutcome::Succeeded { output }) => {
                    println!("    done -> {}", args.output.join(&output).display());
                    succeeded.push(filename.clone());
                }
                RunEvent::Finished(FileOutcome::Failed { kind, message }) => {
                    println!("    failed ({kind}): {message}");
                    failed.push((filename.clone(), message));
                }
            }
        }
    }

    // Best-effort scratch cleanup
    let _ = std::fs::remove_dir_all(&args.temp_dir);

    println!("\nProcessed {} file(s) in {:.1}s", files.len(), started.elapsed().as_secs_f64());
    println!("  succeeded: {}", succeeded.len());
    println!("  failed:    {}", failed.len());
    for (name, reason) in &failed {
        println!("    {name} - {reason}");
    }

    if succeeded.is_empty() && !failed.is_empty() {
        bail!("all files failed");
    }
    Ok(())
}
