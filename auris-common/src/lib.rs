//! # Auris Common Library
//!
//! Shared code for the auris enhancement service:
//! - Common error types
//! - Progress event model (the per-job wire contract)
//! - Configuration loading (TOML + environment overrides)

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
