//! # Bastion Delegate
//!
//! `bastion_delegate` maps table-per-type model hierarchies onto storage
//! that only knows flat models. Each level of a hierarchy lives in its own
//! table linked to its base by a synthetic one-to-one relation sharing the
//! id. A [`DelegateClient`] hides that layout: reads return one flat entity
//! of its concrete type, and writes are split across the levels.
//!
//! ## Crate Structure
//!
//! - **hierarchy**: Per-level rewriting of filters, orderings, selections and payloads
//! - **arena**: Assembly of fetched level rows into flat entities
//! - **callbacks**: Nested-write callbacks applying the rewrites
//! - **handler**: Per-model handles decomposing cross-level operations
//! - **client**: The client and its options

pub mod arena;
pub mod callbacks;
pub mod client;
pub mod handler;
pub mod hierarchy;

pub use arena::{assemble_hierarchy, HierarchyArena};
pub use callbacks::DelegateCallbacks;
pub use client::{DelegateClient, DelegateOptions};
pub use handler::DelegateHandler;
