//! Translation of checker constraints into boolean circuits.

use super::circuit::{constant_bits, equal_bits, less_than, variable_bits, Formula, WIDTH};
use super::sat::{Cnf, Dpll, SatBackend};
use crate::model::{CheckerConstraint, ConstraintValue, ValueKind};
use bastion_core::error::{QueryError, Result};
use std::collections::HashMap;
use tracing::trace;

fn invalid(detail: impl Into<String>) -> bastion_core::Error {
    QueryError::InvalidCheck(detail.into()).into()
}

/// A translated operand of a comparison.
enum Operand {
    /// A boolean constant or formula
    Boolean(Formula, Option<bool>),
    /// A number or interned string as a bit vector, with its constant if known
    Bits(ValueKind, Vec<Formula>, Option<ConstraintValue>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Decides satisfiability of checker constraints.
///
/// Strings are interned into integer indices, numbers and strings are
/// encoded as 32-bit vectors and the resulting circuit is handed to a
/// [`SatBackend`].
pub struct ConstraintSolver<B: SatBackend = Dpll> {
    backend: B,
    strings: HashMap<String, i32>,
    variables: HashMap<String, (ValueKind, u32)>,
    next_var: u32,
}

impl Default for ConstraintSolver<Dpll> {
    fn default() -> Self {
        Self::with_backend(Dpll)
    }
}

impl ConstraintSolver<Dpll> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: SatBackend> ConstraintSolver<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            strings: HashMap::new(),
            variables: HashMap::new(),
            next_var: 1,
        }
    }

    /// Whether some assignment of the constraint's variables satisfies it.
    pub fn check_sat(&mut self, constraint: &CheckerConstraint) -> Result<bool> {
        let formula = self.formula(constraint)?;
        match formula {
            Formula::Const(value) => {
                trace!(value, "constraint folded to a constant");
                Ok(value)
            }
            formula => {
                let cnf = Cnf::from_formula(&formula, self.next_var - 1);
                trace!(vars = cnf.num_vars, clauses = cnf.clauses.len(), "solving constraint");
                Ok(self.backend.solve(&cnf))
            }
        }
    }

    fn intern(&mut self, value: &str) -> i32 {
        let next = self.strings.len() as i32;
        *self.strings.entry(value.to_string()).or_insert(next)
    }

    fn allocate(&mut self, width: u32) -> u32 {
        let first = self.next_var;
        self.next_var += width;
        first
    }

    fn variable(&mut self, name: &str, kind: ValueKind) -> Result<u32> {
        if let Some((existing, first)) = self.variables.get(name) {
            if *existing != kind {
                return Err(invalid(format!(
                    "variable \"{}\" is used with conflicting types",
                    name
                )));
            }
            return Ok(*first);
        }
        let width = if kind == ValueKind::Boolean { 1 } else { WIDTH as u32 };
        let first = self.allocate(width);
        self.variables.insert(name.to_string(), (kind, first));
        Ok(first)
    }

    fn formula(&mut self, constraint: &CheckerConstraint) -> Result<Formula> {
        match constraint {
            CheckerConstraint::Value {
                value: ConstraintValue::Boolean(b),
            } => Ok(Formula::Const(*b)),
            CheckerConstraint::Value { value } => Err(invalid(format!(
                "constant {:?} is not a boolean condition",
                value
            ))),
            CheckerConstraint::Variable {
                name,
                value_kind: ValueKind::Boolean,
            } => Ok(Formula::Var(self.variable(name, ValueKind::Boolean)?)),
            CheckerConstraint::Variable { name, .. } => Err(invalid(format!(
                "variable \"{}\" is not a boolean condition",
                name
            ))),
            CheckerConstraint::And { children } => {
                let mut out = Vec::with_capacity(children.len());
                for child in children {
                    let f = self.formula(child)?;
                    if f == Formula::Const(false) {
                        return Ok(f);
                    }
                    out.push(f);
                }
                Ok(Formula::and(out))
            }
            CheckerConstraint::Or { children } => {
                let mut out = Vec::with_capacity(children.len());
                for child in children {
                    let f = self.formula(child)?;
                    if f == Formula::Const(true) {
                        return Ok(f);
                    }
                    out.push(f);
                }
                Ok(Formula::or(out))
            }
            CheckerConstraint::Not { child } => Ok(Formula::not(self.formula(child)?)),
            CheckerConstraint::Eq { left, right } => self.compare(Comparison::Eq, left, right),
            CheckerConstraint::Ne { left, right } => self.compare(Comparison::Ne, left, right),
            CheckerConstraint::Gt { left, right } => self.compare(Comparison::Gt, left, right),
            CheckerConstraint::Gte { left, right } => self.compare(Comparison::Gte, left, right),
            CheckerConstraint::Lt { left, right } => self.compare(Comparison::Lt, left, right),
            CheckerConstraint::Lte { left, right } => self.compare(Comparison::Lte, left, right),
        }
    }

    fn operand(&mut self, constraint: &CheckerConstraint) -> Result<Operand> {
        match constraint {
            CheckerConstraint::Value { value } => match value {
                ConstraintValue::Boolean(b) => Ok(Operand::Boolean(Formula::Const(*b), Some(*b))),
                ConstraintValue::Number(n) => {
                    let n32 = i32::try_from(*n)
                        .map_err(|_| invalid(format!("number {} does not fit in 32 bits", n)))?;
                    Ok(Operand::Bits(
                        ValueKind::Number,
                        constant_bits(n32),
                        Some(value.clone()),
                    ))
                }
                ConstraintValue::String(s) => {
                    let index = self.intern(s);
                    Ok(Operand::Bits(
                        ValueKind::String,
                        constant_bits(index),
                        Some(value.clone()),
                    ))
                }
            },
            CheckerConstraint::Variable { name, value_kind } => {
                let first = self.variable(name, *value_kind)?;
                Ok(match value_kind {
                    ValueKind::Boolean => Operand::Boolean(Formula::Var(first), None),
                    kind => Operand::Bits(*kind, variable_bits(first), None),
                })
            }
            other => {
                let f = self.formula(other)?;
                let constant = match f {
                    Formula::Const(b) => Some(b),
                    _ => None,
                };
                Ok(Operand::Boolean(f, constant))
            }
        }
    }

    fn compare(
        &mut self,
        op: Comparison,
        left: &CheckerConstraint,
        right: &CheckerConstraint,
    ) -> Result<Formula> {
        let left = self.operand(left)?;
        let right = self.operand(right)?;
        match (left, right) {
            (Operand::Boolean(a, ca), Operand::Boolean(b, cb)) => {
                if let (Some(x), Some(y)) = (ca, cb) {
                    return match op {
                        Comparison::Eq => Ok(Formula::Const(x == y)),
                        Comparison::Ne => Ok(Formula::Const(x != y)),
                        _ => Err(invalid("booleans cannot be ordered")),
                    };
                }
                match op {
                    Comparison::Eq => Ok(Formula::equiv(a, b)),
                    Comparison::Ne => Ok(Formula::not(Formula::equiv(a, b))),
                    _ => Err(invalid("booleans cannot be ordered")),
                }
            }
            (Operand::Bits(ka, a, ca), Operand::Bits(kb, b, cb)) => {
                if ka != kb {
                    return Err(invalid(format!("cannot compare {:?} with {:?}", ka, kb)));
                }
                if ka == ValueKind::String && !matches!(op, Comparison::Eq | Comparison::Ne) {
                    return Err(invalid("strings cannot be ordered"));
                }
                if let (Some(x), Some(y)) = (ca, cb) {
                    return Ok(Formula::Const(compare_constants(op, &x, &y)));
                }
                Ok(match op {
                    Comparison::Eq => equal_bits(&a, &b),
                    Comparison::Ne => Formula::not(equal_bits(&a, &b)),
                    Comparison::Lt => less_than(&a, &b),
                    Comparison::Gt => less_than(&b, &a),
                    Comparison::Lte => Formula::not(less_than(&b, &a)),
                    Comparison::Gte => Formula::not(less_than(&a, &b)),
                })
            }
            _ => Err(invalid("cannot compare a boolean with a non-boolean value")),
        }
    }
}

fn compare_constants(op: Comparison, left: &ConstraintValue, right: &ConstraintValue) -> bool {
    match (left, right) {
        (ConstraintValue::Number(a), ConstraintValue::Number(b)) => match op {
            Comparison::Eq => a == b,
            Comparison::Ne => a != b,
            Comparison::Gt => a > b,
            Comparison::Gte => a >= b,
            Comparison::Lt => a < b,
            Comparison::Lte => a <= b,
        },
        _ => match op {
            Comparison::Ne => left != right,
            _ => left == right,
        },
    }
}

/// Decide a constraint with the default backend.
pub fn check_sat(constraint: &CheckerConstraint) -> Result<bool> {
    ConstraintSolver::new().check_sat(constraint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::Error;

    fn var(name: &str) -> CheckerConstraint {
        CheckerConstraint::variable(name, ValueKind::Number)
    }

    fn flag(name: &str) -> CheckerConstraint {
        CheckerConstraint::variable(name, ValueKind::Boolean)
    }

    #[test]
    fn test_constant_folding_equivalences() {
        let x = CheckerConstraint::eq(var("a"), CheckerConstraint::number(1));
        let unsat = CheckerConstraint::and(vec![
            CheckerConstraint::eq(var("a"), CheckerConstraint::number(1)),
            CheckerConstraint::eq(var("a"), CheckerConstraint::number(2)),
        ]);
        for base in [x, unsat] {
            let expected = check_sat(&base).unwrap();
            let wrapped = [
                CheckerConstraint::and(vec![CheckerConstraint::boolean(true), base.clone()]),
                CheckerConstraint::or(vec![CheckerConstraint::boolean(false), base.clone()]),
                CheckerConstraint::not(CheckerConstraint::not(base.clone())),
            ];
            for w in wrapped {
                assert_eq!(check_sat(&w).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_pinned_variable() {
        let guard = CheckerConstraint::eq(var("authorId"), CheckerConstraint::number(5));
        assert!(check_sat(&guard).unwrap());
        let pinned = CheckerConstraint::and(vec![
            guard.clone(),
            CheckerConstraint::eq(var("authorId"), CheckerConstraint::number(6)),
        ]);
        assert!(!check_sat(&pinned).unwrap());
        let pinned = CheckerConstraint::and(vec![
            guard,
            CheckerConstraint::eq(var("authorId"), CheckerConstraint::number(5)),
        ]);
        assert!(check_sat(&pinned).unwrap());
    }

    #[test]
    fn test_orderings_and_strings() {
        let range = CheckerConstraint::and(vec![
            CheckerConstraint::gt(var("n"), CheckerConstraint::number(-3)),
            CheckerConstraint::lt(var("n"), CheckerConstraint::number(-1)),
        ]);
        assert!(check_sat(&range).unwrap());
        let empty = CheckerConstraint::and(vec![
            CheckerConstraint::gte(var("n"), CheckerConstraint::number(10)),
            CheckerConstraint::lte(var("n"), CheckerConstraint::number(9)),
        ]);
        assert!(!check_sat(&empty).unwrap());

        let role = CheckerConstraint::variable("role", ValueKind::String);
        let both = CheckerConstraint::and(vec![
            CheckerConstraint::eq(role.clone(), CheckerConstraint::string("admin")),
            CheckerConstraint::eq(role.clone(), CheckerConstraint::string("editor")),
        ]);
        assert!(!check_sat(&both).unwrap());
        let either = CheckerConstraint::or(vec![
            CheckerConstraint::eq(role.clone(), CheckerConstraint::string("admin")),
            CheckerConstraint::ne(role, CheckerConstraint::string("admin")),
        ]);
        assert!(check_sat(&either).unwrap());
    }

    #[test]
    fn test_booleans_and_constants() {
        let c = CheckerConstraint::and(vec![
            CheckerConstraint::eq(flag("published"), CheckerConstraint::boolean(true)),
            CheckerConstraint::not(flag("published")),
        ]);
        assert!(!check_sat(&c).unwrap());
        let c = CheckerConstraint::eq(CheckerConstraint::number(3), CheckerConstraint::number(3));
        assert!(check_sat(&c).unwrap());
        let c = CheckerConstraint::lt(CheckerConstraint::number(4), CheckerConstraint::number(3));
        assert!(!check_sat(&c).unwrap());
    }

    #[test]
    fn test_invalid_constraints() {
        let c = CheckerConstraint::gt(
            CheckerConstraint::variable("s", ValueKind::String),
            CheckerConstraint::string("a"),
        );
        assert!(matches!(check_sat(&c), Err(Error::Query(QueryError::InvalidCheck(_)))));
        let c = CheckerConstraint::eq(var("n"), CheckerConstraint::number(1 << 40));
        assert!(check_sat(&c).is_err());
        let c = CheckerConstraint::eq(var("n"), CheckerConstraint::boolean(true));
        assert!(check_sat(&c).is_err());
    }
}
