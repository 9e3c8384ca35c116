//! Satisfiability checking for permission checkers.
//!
//! A [`CheckerConstraint`](crate::model::CheckerConstraint) is translated
//! into a boolean circuit over 32-bit vectors, converted to CNF and decided
//! by a [`SatBackend`].

pub mod circuit;
pub mod sat;
pub mod translate;

pub use circuit::Formula;
pub use sat::{Cnf, Dpll, SatBackend};
pub use translate::{check_sat, ConstraintSolver};
