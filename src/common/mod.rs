//! Shared infrastructure: errors, configuration, logging

pub mod config;
pub mod error;
pub mod logging;

pub use config::EngineConfig;
pub use error::{Error, Result};
