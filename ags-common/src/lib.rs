//! Shared configuration and types for the AGS sandbox CLI

pub mod config;
pub mod types;

pub use config::{AppConfig, ConfigError, E2bConfig, LogConfig, SandboxConfig};
pub use types::{BackendKind, OutputFormat};
