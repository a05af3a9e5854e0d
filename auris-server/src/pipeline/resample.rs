//! Sample-rate conversion for the denoising boundary
//!
//! The denoising models run at a fixed internal rate; converting to and from
//! that rate is the pipeline's responsibility, not the model's. Uses rubato's
//! `FastFixedIn` (good quality/performance tradeoff for offline batch work).

use rubato::{FastFixedIn, Resampler as RubatoResampler};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("Failed to create resampler: {0}")]
    Construction(String),

    #[error("Resampling failed: {0}")]
    Process(String),
}

/// Resample a mono buffer from `from_rate` to `to_rate`.
///
/// Returns a copy untouched when the rates already match.
pub fn resample_mono(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, ResampleError> {
    if from_rate == to_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let mut resampler = FastFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        1.0, // fixed ratio, no runtime changes
        rubato::PolynomialDegree::Septic,
        input.len(),
        1,
    )
    .map_err(|e| ResampleError::Construction(e.to_string()))?;

    let planar = vec![input.to_vec()];
    let mut output = resampler
        .process(&planar, None)
        .map_err(|e| ResampleError::Process(e.to_string()))?;

    Ok(output.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_identity() {
        let input: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.01).sin()).collect();
        let output = resample_mono(&input, 16_000, 16_000).expect("resample");
        assert_eq!(output, input);
    }

    #[test]
    fn empty_input_is_empty_output() {
        let output = resample_mono(&[], 48_000, 16_000).expect("resample");
        assert!(output.is_empty());
    }

    #[test]
    fn output_length_tracks_rate_ratio() {
        let input: Vec<f32> = (0..48_000).map(|i| (i as f32 * 0.001).sin()).collect();

        let down = resample_mono(&input, 48_000, 16_000).expect("downsample");
        let expected = input.len() / 3;
        let tolerance = expected / 10;
        assert!(
            down.len().abs_diff(expected) <= tolerance,
            "got {} samples, expected ~{expected}",
            down.len()
        );

        let up = resample_mono(&down, 16_000, 48_000).expect("upsample");
        let tolerance = input.len() / 10;
        assert!(up.len().abs_diff(input.len()) <= tolerance);
    }
}
