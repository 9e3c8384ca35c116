//! Policy model.
//!
//! This module defines what the policy layer enforces:
//!
//! - **policy**: per-model guards, permission checkers and input checkers
//! - **constraint**: constraint trees for static permission checks
//! - **validation**: JSON Schema validation of write payloads

pub mod constraint;
pub mod policy;
pub mod validation;

pub use constraint::{CheckerConstraint, ConstraintValue, ValueKind};
pub use policy::{Guard, GuardContext, ModelPolicy, PermissionChecker, PolicyDef};
pub use validation::{validate, ValidationMode};
