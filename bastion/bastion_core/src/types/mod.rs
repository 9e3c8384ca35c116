//! Core data types shared by every layer of the client stack.
//!
//! This module defines the operation vocabularies (CRUD actions, policy
//! operations, nested-write actions) and the small result and option
//! structures exchanged with the storage collaborator.

pub mod action;
pub mod options;

pub use action::{CrudAction, NestedWriteAction, PolicyOperation};
pub use options::{BatchPayload, IsolationLevel, TransactionOptions};
