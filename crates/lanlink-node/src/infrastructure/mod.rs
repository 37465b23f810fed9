//! Infrastructure layer for the lanlink node.
//!
//! Contains the OS-facing adapters: TCP and UDP sockets and the TOML
//! configuration file.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `lanlink_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
