//! Configuration module for the VMAF transcoder
//!
//! Handles loading configuration from TOML files, environment variable overrides,
//! and validation of the encode/quality/worker settings.

pub mod config;

pub use config::*;
