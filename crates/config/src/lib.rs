//! config: configuration for acme-proxy
//!
//! This crate provides configuration parsing, defaults and validation for
//! the acme-proxy server.

pub mod config;

pub use config::*;
