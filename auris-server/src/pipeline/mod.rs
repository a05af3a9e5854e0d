//! Per-file enhancement pipeline
//!
//! The runner executes the fixed five-stage sequence (convert → denoise →
//! upsample → filter → encode) against one input file. The heavy lifting is
//! delegated to external collaborators behind the [`transcode::Transcoder`]
//! and [`denoise::DenoiseModel`] traits; everything in this module is
//! blocking and must only run on a worker context, never on the control
//! plane.

pub mod denoise;
pub mod resample;
pub mod runner;
pub mod test_utils;
pub mod transcode;
pub mod wav;
