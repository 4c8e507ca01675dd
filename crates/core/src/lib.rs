//! Core functionality for the fieldlink edge gateway.
//!
//! This crate provides the error taxonomy, configuration model, logging
//! initialization and time helpers shared by the arbiter, reactor and
//! queue crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use config::{
    ArbiterConfig, Config, ConfigError, MessageConfig, ReactorConfig, StorageConfig, UploadConfig,
};
pub use error::{Error, Result};
