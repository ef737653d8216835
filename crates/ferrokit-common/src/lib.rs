//! # Ferrokit Common
//!
//! Shared logging setup for the Ferrokit engine crates.

pub mod logging;

pub use logging::{init_for_tests, init_logging, LogConfig, LogFormat};
