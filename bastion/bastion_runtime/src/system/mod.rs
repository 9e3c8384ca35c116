//! System support for enhanced clients
//!
//! This module provides configuration loading and logging initialisation.

pub mod config;
pub mod logging;

// Re-export key types for convenience
pub use config::{EnhancementConfig, EnhancementKind, LoggingConfig};
pub use logging::init_logging;
