//! # stein-common
//!
//! Shared plumbing for the stein crates:
//! - the common error taxonomy
//! - logging initialisation driven by the `STEIN_LOGLEVEL` environment knob

#![warn(missing_docs)]

pub mod error;
pub mod log;

pub use error::{SteinError, SteinResult};
