//! # Bastion Memory
//!
//! An in-memory storage collaborator implementing the `DbClient` and
//! `CrudOperations` contracts over a `ModelMeta` schema. It stores each
//! model in its own table (hierarchy levels included), evaluates the filter
//! language, performs nested writes with referential actions and supports
//! snapshot transactions.
//!
//! It is the backend the enhancement layers are tested against, and a
//! convenient store for embedding Bastion in applications that need no
//! persistence.

mod aggregate;
mod client;
mod filter;
mod read;
mod state;
mod write;

pub use client::{MemoryDatabase, MemoryModel};
pub use state::Row;
