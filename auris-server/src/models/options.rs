//! Job option records
//!
//! The options snapshot is immutable for the lifetime of a job; it is taken
//! at submission and persisted verbatim with the job record.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Denoising model variant
///
/// All variants share the same fixed internal sample rate; they differ in
/// capacity and training data. The variant is passed through to the denoiser
/// collaborator untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    Dns48,
    #[default]
    Dns64,
    Master64,
}

impl ModelVariant {
    /// Fixed internal processing rate of the denoising models
    pub fn sample_rate(self) -> u32 {
        16_000
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelVariant::Dns48 => "dns48",
            ModelVariant::Dns64 => "dns64",
            ModelVariant::Master64 => "master64",
        }
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dns48" => Ok(ModelVariant::Dns48),
            "dns64" => Ok(ModelVariant::Dns64),
            "master64" => Ok(ModelVariant::Master64),
            other => Err(format!("unsupported model '{other}'")),
        }
    }
}

/// Immutable per-job configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Denoising model variant
    pub model: ModelVariant,
    /// Use the lower bitrate tier when encoding (128k AAC / 192k MP3)
    pub low_bitrate: bool,
    /// Suffix appended to output file stems ("" keeps the original name)
    pub suffix: String,
    /// Whether file discovery descended into subdirectories
    pub recursive: bool,
    /// Scratch directory for intermediate WAV files
    pub temp_dir: PathBuf,
    /// Skip the cleanup filter chain (adeclick … loudnorm)
    pub no_loudnorm: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            model: ModelVariant::default(),
            low_bitrate: false,
            suffix: String::new(),
            recursive: false,
            temp_dir: PathBuf::from("tmp"),
            no_loudnorm: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_variants_round_trip() {
        for variant in [ModelVariant::Dns48, ModelVariant::Dns64, ModelVariant::Master64] {
            let parsed: ModelVariant = variant.as_str().parse().expect("parse");
            assert_eq!(parsed, variant);
        }
        assert!("dns96".parse::<ModelVariant>().is_err());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: JobOptions = serde_json::from_str(r#"{"model": "master64"}"#).expect("parse");
        assert_eq!(options.model, ModelVariant::Master64);
        assert!(!options.low_bitrate);
        assert_eq!(options.suffix, "");
        assert_eq!(options.temp_dir, PathBuf::from("tmp"));
    }
}
