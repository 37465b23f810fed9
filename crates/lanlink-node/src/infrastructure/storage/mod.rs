//! Storage infrastructure: the TOML configuration file.
//!
//! The `config` sub-module reads the daemon's settings from the
//! platform-appropriate directory, falls back to defaults when no file exists,
//! and turns the result into a [`ProviderConfig`](crate::provider::ProviderConfig)
//! and the local identity.

pub mod config;
