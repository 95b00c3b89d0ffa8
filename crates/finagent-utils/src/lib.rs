//! Shared utilities for finagent
//!
//! This crate provides common functionality used across the finagent workspace,
//! including logging setup and application settings.

pub mod config;
pub mod logging;

pub use config::{Settings, SettingsError};
pub use logging::{init_tracing, init_tracing_with};
