//! Shared types, error definitions, and utilities used across all berth crates.

pub mod error;
pub mod ids;
pub mod time;
pub mod types;

pub use error::{Error, ErrorKind, Result};
