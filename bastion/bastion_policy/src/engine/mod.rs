//! The policy orchestrator.
//!
//! - **client**: [`PolicyClient`], the policy-enforcing client and `check` API
//! - **handler**: [`PolicyHandler`], the per-model CRUD implementation
//! - **nested**: policy callbacks for nested writes
//! - **checks**: post-write checks and create tagging

pub mod checks;
pub mod client;
pub mod handler;
pub mod nested;

pub use checks::{CreateTags, PostWriteCheck};
pub use client::{PolicyClient, PolicyOptions};
pub use handler::PolicyHandler;
pub use nested::PolicyCallbacks;
