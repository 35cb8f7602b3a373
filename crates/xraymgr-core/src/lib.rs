//! xraymgr core library
//!
//! Shared functionality for the xraymgr control plane:
//! - Layered configuration (defaults, TOML file, environment)
//! - SQLite pool helpers and the `define_database!` macro
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
