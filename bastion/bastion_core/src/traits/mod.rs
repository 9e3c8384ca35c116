//! Capability interfaces of the client stack.
//!
//! Every layer (storage collaborator, delegate proxy, policy orchestrator)
//! implements the same two traits and wraps the layer below it:
//!
//! - `CrudOperations`: the per-model CRUD contract
//! - `DbClient`: a factory of per-model handles plus the transaction primitive

pub mod client;
pub mod crud;

pub use client::{run_in_transaction, DbClient, TransactionCallback};
pub use crud::CrudOperations;
