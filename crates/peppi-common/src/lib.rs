//! # Peppi Common
//!
//! Shared plumbing for the PeppiAcademy worker crates.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - ISO-8601 timestamps in the format browsers produce for `Date.toISOString()`

pub mod logging;
pub mod time;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use time::{epoch_millis, iso8601_now};
