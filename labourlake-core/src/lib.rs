//! # labourlake-core
//!
//! Foundation shared by the labourlake crates: layered configuration,
//! atomic JSON persistence and logging setup.

pub mod config;
pub mod logging;
pub mod persistence;

pub use config::{LakeConfig, LoggingConfig, PipelineConfig, load_config};
pub use logging::{LoggingError, init_logging};
