//! Zero Common - Shared configuration, logging, and utilities for zero-pair.
//!
//! This crate provides:
//! - Configuration types, loading, and environment overrides
//! - Configuration validation
//! - Logging setup and request span helpers
//! - String helpers for safe log output

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    Config, LlmConfig, LlmProviderKind, NetworkConfig, ObservabilityConfig, ServerConfig,
    SessionsConfig, ShellConfig,
};
pub use validation::{Validate, ValidationError, ValidationResult};
