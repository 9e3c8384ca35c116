//! # Bastion Core
//!
//! `bastion_core` provides the building blocks shared by every layer of the
//! Bastion access-control engine. Bastion sits between an application and a
//! generic CRUD data-access client and transparently enforces row-level
//! access policies and polymorphic (table-per-type) model hierarchies.
//!
//! ## Core Principles
//!
//! 1. **Decorator Chain**: Every enhancement implements the same
//!    `CrudOperations`/`DbClient` interfaces and wraps the layer below it, so
//!    calling code is unchanged whether it holds a raw or an enhanced client.
//!
//! 2. **Immutable Metadata**: `ModelMeta` is resolved once, including all
//!    derived facts, and shared read-only by every call.
//!
//! 3. **Rebuild, Don't Mutate**: Nested payloads are walked by a visitor that
//!    rebuilds a new tree from callback decisions instead of editing the
//!    caller's arguments in place.
//!
//! ## Crate Structure
//!
//! - **error**: Error types and their classification
//! - **types**: Operation vocabularies, transaction options, batch results
//! - **meta**: Schema metadata and the derived-metadata pass
//! - **context**: The per-call principal
//! - **traits**: The CRUD contract and the client/transaction interface
//! - **visitor**: Nested-write traversal
//! - **query**: Filter combinators and id/unique-key helpers
//! - **utils**: Logging helpers

pub mod context;
pub mod error;
pub mod meta;
pub mod query;
pub mod traits;
pub mod types;
pub mod utils;
pub mod visitor;

// Re-export key types and traits for convenience
pub use context::QueryContext;
pub use error::{Error, ErrorKind, Result};
pub use meta::{FieldInfo, ModelInfo, ModelMeta};
pub use traits::{run_in_transaction, CrudOperations, DbClient, TransactionCallback};
pub use types::{BatchPayload, CrudAction, NestedWriteAction, PolicyOperation, TransactionOptions};
pub use visitor::{NestedWriteCallbacks, NestedWriteVisitor, NestingPathItem, VisitAction, VisitorContext};
