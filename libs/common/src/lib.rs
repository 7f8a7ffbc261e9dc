//! `VoltageEMS` basic library
//!
//! Shared service plumbing:
//! - logging setup with runtime level changes
//! - layered configuration loading
//! - shutdown signal handling

pub mod config;
pub mod logging;
pub mod shutdown;

mod error;

pub use error::{Error, Result};
pub use logging::{get_log_level, set_log_level, LogConfig};
