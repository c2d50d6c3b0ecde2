//! Configuration loading and parsing.
//!
//! This module provides the YAML configuration of a crond replica.

mod error;
mod yaml;

pub use error::ConfigError;
pub use yaml::{
    ApiSection, CompensatorConfig, ConfigLoader, CoordinationConfig, CrondConfig, GcConfig,
    StorageConfig,
};
