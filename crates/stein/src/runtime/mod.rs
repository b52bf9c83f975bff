//! Container lifecycle.

mod container;

pub use container::{Container, SHELL_PATH};
