//! # Infra-Common: shared plumbing for the voxmedia crates
//!
//! Small, dependency-light building blocks used by both the RTP transport
//! and the audio pipeline:
//!
//! - [`logging`]: `tracing-subscriber` bootstrap with env-filter and optional JSON
//! - [`range`]: inclusive numeric ranges used throughout the configuration
//! - [`errors`]: the error type for the helpers in this crate

pub mod errors;
pub mod logging;
pub mod range;

pub use errors::{Error, Result};
pub use logging::{parse_log_level, setup_logging, LoggingConfig};
pub use range::Range;
