//! Bastion Runtime - Entry point of the Bastion access-control engine
//!
//! This crate composes the enhancement layers over a raw data-access client:
//! access policies on top, model hierarchies below them, storage at the
//! bottom. It also loads the enhancement configuration and initialises
//! logging.

pub mod enhance;
pub mod system;

pub use enhance::{enhance, EnhancedClient};
pub use system::{init_logging, EnhancementConfig, EnhancementKind, LoggingConfig};
