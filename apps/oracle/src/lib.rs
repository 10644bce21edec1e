//! # Oracle
//!
//! Library half of the Oracle binary: HTTP API, CLI and configuration,
//! exposed so integration tests can build routers and configs directly.

pub mod api;
pub mod cli;
pub mod config;
