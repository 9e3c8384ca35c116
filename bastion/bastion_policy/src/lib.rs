//! # Bastion Policy
//!
//! `bastion_policy` enforces row-level access policies on top of any
//! [`DbClient`](bastion_core::DbClient). Every model handle of a
//! [`PolicyClient`] injects read guards into queries, checks writes before
//! and after they run, and rolls back writes that fail a check.
//!
//! ## Crate Structure
//!
//! - **model**: Policy definitions, checker constraints and validation
//! - **query**: Guard injection, reversed queries and read post-processing
//! - **engine**: The policy client and per-model handlers
//! - **solver**: Satisfiability checking behind `PolicyClient::check`

pub mod engine;
pub mod model;
pub mod query;
pub mod solver;

pub use engine::{PolicyClient, PolicyHandler, PolicyOptions};
pub use model::{
    CheckerConstraint, ConstraintValue, Guard, GuardContext, ModelPolicy, PermissionChecker, PolicyDef,
    ValidationMode, ValueKind,
};
pub use query::PolicyUtil;
