//! Denoising model collaborator boundary
//!
//! Contract: the model accepts mono PCM at its fixed internal sample rate
//! and returns denoised PCM at the same rate. Resampling to and from that
//! rate is the pipeline's job (`resample`), not the model's.
//!
//! A loaded model instance is held warm across files to avoid reload cost
//! and shared behind a mutex, so at most one worker invokes a given
//! instance at a time. Trading memory for parallelism (one instance per
//! worker) is a configuration choice, not a correctness requirement.

use crate::models::ModelVariant;
use crate::pipeline::wav;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Denoiser I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Denoiser WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Denoiser command exited with status {status}: {stderr}")]
    Command { status: i32, stderr: String },

    #[error("Denoiser command template is invalid: {0}")]
    Template(String),

    #[error("Denoiser produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// External denoising model
pub trait DenoiseModel: Send {
    /// Fixed internal processing rate of this model instance
    fn sample_rate(&self) -> u32;

    /// Denoise mono PCM at `sample_rate()`, returning PCM at the same rate
    fn denoise(&mut self, samples: &[f32]) -> Result<Vec<f32>, ModelError>;
}

/// A loaded model instance, guarded for exclusive invocation
pub type SharedDenoiser = Arc<Mutex<dyn DenoiseModel>>;

/// Pass-through model used when no external denoiser is configured.
///
/// Keeps the pipeline exercisable end to end (and is the test double);
/// output equals input.
pub struct IdentityDenoiser {
    sample_rate: u32,
}

impl IdentityDenoiser {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl DenoiseModel for IdentityDenoiser {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn denoise(&mut self, samples: &[f32]) -> Result<Vec<f32>, ModelError> {
        Ok(samples.to_vec())
    }
}

/// Denoiser backed by an external command.
///
/// The command template is split on whitespace; the tokens `{model}`,
/// `{input}` and `{output}` are substituted per invocation. Input and
/// output travel as mono WAV files at the model's internal rate.
pub struct CommandDenoiser {
    argv: Vec<String>,
    model: ModelVariant,
    work_dir: PathBuf,
    invocation: u64,
}

impl CommandDenoiser {
    pub fn new(
        template: &str,
        model: ModelVariant,
        work_dir: PathBuf,
    ) -> Result<Self, ModelError> {
        let argv: Vec<String> = template.split_whitespace().map(String::from).collect();
        if argv.is_empty() {
            return Err(ModelError::Template("empty command".to_string()));
        }
        if !argv.iter().any(|a| a.contains("{input}")) || !argv.iter().any(|a| a.contains("{output}")) {
            return Err(ModelError::Template(
                "command must reference {input} and {output}".to_string(),
            ));
        }
        Ok(Self {
            argv,
            model,
            work_dir,
            invocation: 0,
        })
    }
}

impl DenoiseModel for CommandDenoiser {
    fn sample_rate(&self) -> u32 {
        self.model.sample_rate()
    }

    fn denoise(&mut self, samples: &[f32]) -> Result<Vec<f32>, ModelError> {
        std::fs::create_dir_all(&self.work_dir)?;
        let n = self.invocation;
        self.invocation += 1;
        let input = self.work_dir.join(format!("denoise_{}_{n}_in.wav", self.model));
        let output = self.work_dir.join(format!("denoise_{}_{n}_out.wav", self.model));

        wav::write_wav_mono(&input, samples, self.sample_rate())?;

        let rendered: Vec<String> = self.argv[1..]
            .iter()
            .map(|arg| {
                arg.replace("{model}", self.model.as_str())
                    .replace("{input}", &input.display().to_string())
                    .replace("{output}", &output.display().to_string())
            })
            .collect();

        let result = Command::new(&self.argv[0]).args(&rendered).output();

        // Remove the input scratch file regardless of outcome
        let _ = std::fs::remove_file(&input);

        let cmd_output = result?;
        if !cmd_output.status.success() {
            let _ = std::fs::remove_file(&output);
            return Err(ModelError::Command {
                status: cmd_output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&cmd_output.stderr).trim().to_string(),
            });
        }

        if !output.exists() {
            return Err(ModelError::MissingOutput(output));
        }

        let (denoised, _) = wav::read_wav_mono(&output)?;
        let _ = std::fs::remove_file(&output);
        Ok(denoised)
    }
}

/// Hands out warm model instances by variant
pub trait DenoiserProvider: Send + Sync {
    fn get(&self, model: ModelVariant) -> Result<SharedDenoiser, ModelError>;
}

/// Provider driven by the service configuration.
///
/// With a command template configured, each variant gets one
/// `CommandDenoiser` instance, created on first use and kept warm.
/// Without one, a pass-through instance is substituted (logged once per
/// variant) so the rest of the pipeline still runs.
pub struct ConfiguredDenoisers {
    template: Option<String>,
    work_dir: PathBuf,
    warm: Mutex<HashMap<ModelVariant, SharedDenoiser>>,
}

impl ConfiguredDenoisers {
    pub fn new(template: Option<String>, work_dir: PathBuf) -> Self {
        Self {
            template,
            work_dir,
            warm: Mutex::new(HashMap::new()),
        }
    }
}

impl DenoiserProvider for ConfiguredDenoisers {
    fn get(&self, model: ModelVariant) -> Result<SharedDenoiser, ModelError> {
        let mut warm = self.warm.lock().expect("denoiser registry lock");
        if let Some(instance) = warm.get(&model) {
            return Ok(instance.clone());
        }

        let instance: SharedDenoiser = match &self.template {
            Some(template) => Arc::new(Mutex::new(CommandDenoiser::new(
                template,
                model,
                self.work_dir.clone(),
            )?)),
            None => {
                warn!(model = %model, "No denoiser command configured, audio passes through unmodified");
                Arc::new(Mutex::new(IdentityDenoiser::new(model.sample_rate())))
            }
        };
        warm.insert(model, instance.clone());
        Ok(instance)
    }
}
