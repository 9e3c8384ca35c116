//! Utility functions and types.
//!
//! This module provides logging helpers shared by every layer of the
//! client stack.

pub mod logging;

pub use logging::{log_query, LogLevel};
