//! # CacheKit Common
//!
//! Build-time configuration and logging setup shared by the CacheKit crates.
//!
//! ## Features
//!
//! - **Configuration**: [`BuildVersion`], [`Manifest`], and [`WorkerConfig`],
//!   the plain-data inputs stamped in by the build pipeline
//! - **Logging**: `tracing` subscriber setup with env-filter support

pub mod config;
pub mod logging;

pub use config::{BuildVersion, ConfigError, Manifest, WorkerConfig};
pub use logging::{init_logging, LogConfig, LogFormat};
