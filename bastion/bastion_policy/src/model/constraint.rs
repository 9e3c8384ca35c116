//! Constraint trees consumed by the permission checker.

use serde::{Deserialize, Serialize};

/// Type of a constraint variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Number,
    String,
}

/// A constant operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintValue {
    Boolean(bool),
    Number(i64),
    String(String),
}

impl ConstraintValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ConstraintValue::Boolean(_) => ValueKind::Boolean,
            ConstraintValue::Number(_) => ValueKind::Number,
            ConstraintValue::String(_) => ValueKind::String,
        }
    }
}

/// A boolean constraint over typed variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CheckerConstraint {
    Value { value: ConstraintValue },
    Variable { name: String, #[serde(rename = "type")] value_kind: ValueKind },
    Eq { left: Box<CheckerConstraint>, right: Box<CheckerConstraint> },
    Ne { left: Box<CheckerConstraint>, right: Box<CheckerConstraint> },
    Gt { left: Box<CheckerConstraint>, right: Box<CheckerConstraint> },
    Gte { left: Box<CheckerConstraint>, right: Box<CheckerConstraint> },
    Lt { left: Box<CheckerConstraint>, right: Box<CheckerConstraint> },
    Lte { left: Box<CheckerConstraint>, right: Box<CheckerConstraint> },
    And { children: Vec<CheckerConstraint> },
    Or { children: Vec<CheckerConstraint> },
    Not { child: Box<CheckerConstraint> },
}

impl CheckerConstraint {
    pub fn boolean(value: bool) -> Self {
        CheckerConstraint::Value {
            value: ConstraintValue::Boolean(value),
        }
    }

    pub fn number(value: i64) -> Self {
        CheckerConstraint::Value {
            value: ConstraintValue::Number(value),
        }
    }

    pub fn string(value: &str) -> Self {
        CheckerConstraint::Value {
            value: ConstraintValue::String(value.to_string()),
        }
    }

    pub fn variable(name: &str, value_kind: ValueKind) -> Self {
        CheckerConstraint::Variable {
            name: name.to_string(),
            value_kind,
        }
    }

    pub fn eq(left: Self, right: Self) -> Self {
        CheckerConstraint::Eq {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn ne(left: Self, right: Self) -> Self {
        CheckerConstraint::Ne {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn gt(left: Self, right: Self) -> Self {
        CheckerConstraint::Gt {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn gte(left: Self, right: Self) -> Self {
        CheckerConstraint::Gte {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn lt(left: Self, right: Self) -> Self {
        CheckerConstraint::Lt {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn lte(left: Self, right: Self) -> Self {
        CheckerConstraint::Lte {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(children: Vec<Self>) -> Self {
        CheckerConstraint::And { children }
    }

    pub fn or(children: Vec<Self>) -> Self {
        CheckerConstraint::Or { children }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Self) -> Self {
        CheckerConstraint::Not {
            child: Box::new(child),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serde_shape() {
        let c = CheckerConstraint::eq(
            CheckerConstraint::variable("authorId", ValueKind::Number),
            CheckerConstraint::number(3),
        );
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "eq",
                "left": {"kind": "variable", "name": "authorId", "type": "number"},
                "right": {"kind": "value", "value": 3}
            })
        );
        let back: CheckerConstraint = serde_json::from_value(value).unwrap();
        assert_eq!(back, c);
    }
}
