//! Boolean circuits and fixed-width bit-vector encodings.

/// Width of the bit vectors numbers and interned strings are encoded in.
pub const WIDTH: usize = 32;

/// A boolean formula over numbered variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formula {
    Const(bool),
    Var(u32),
    Not(Box<Formula>),
    And(Vec<Formula>),
    Or(Vec<Formula>),
}

impl Formula {
    /// Conjunction, folding constants and flattening nested conjunctions.
    pub fn and(children: Vec<Formula>) -> Formula {
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Formula::Const(true) => {}
                Formula::Const(false) => return Formula::Const(false),
                Formula::And(nested) => out.extend(nested),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Formula::Const(true),
            1 => out.pop().unwrap_or(Formula::Const(true)),
            _ => Formula::And(out),
        }
    }

    /// Disjunction, folding constants and flattening nested disjunctions.
    pub fn or(children: Vec<Formula>) -> Formula {
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Formula::Const(false) => {}
                Formula::Const(true) => return Formula::Const(true),
                Formula::Or(nested) => out.extend(nested),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Formula::Const(false),
            1 => out.pop().unwrap_or(Formula::Const(false)),
            _ => Formula::Or(out),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(formula: Formula) -> Formula {
        match formula {
            Formula::Const(b) => Formula::Const(!b),
            Formula::Not(inner) => *inner,
            other => Formula::Not(Box::new(other)),
        }
    }

    /// Logical equivalence.
    pub fn equiv(a: Formula, b: Formula) -> Formula {
        match (a, b) {
            (Formula::Const(true), x) | (x, Formula::Const(true)) => x,
            (Formula::Const(false), x) | (x, Formula::Const(false)) => Formula::not(x),
            (a, b) => Formula::or(vec![
                Formula::and(vec![a.clone(), b.clone()]),
                Formula::and(vec![Formula::not(a), Formula::not(b)]),
            ]),
        }
    }
}

/// Bits of a constant, least significant first.
///
/// Values are biased by 2^31 so that unsigned comparison of the encodings
/// orders them like signed integers.
pub fn constant_bits(value: i32) -> Vec<Formula> {
    let biased = (value as i64 + (1i64 << 31)) as u64;
    (0..WIDTH)
        .map(|i| Formula::Const((biased >> i) & 1 == 1))
        .collect()
}

/// Fresh variable bits starting at `first`, least significant first.
pub fn variable_bits(first: u32) -> Vec<Formula> {
    (0..WIDTH as u32).map(|i| Formula::Var(first + i)).collect()
}

/// Bitwise equality of two vectors.
pub fn equal_bits(a: &[Formula], b: &[Formula]) -> Formula {
    Formula::and(
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| Formula::equiv(x.clone(), y.clone()))
            .collect(),
    )
}

/// Unsigned `a < b`.
pub fn less_than(a: &[Formula], b: &[Formula]) -> Formula {
    // Compare from the most significant bit down
    fn from(a: &[Formula], b: &[Formula], index: usize) -> Formula {
        let below = if index == 0 {
            Formula::Const(false)
        } else {
            from(a, b, index - 1)
        };
        let (x, y) = (a[index].clone(), b[index].clone());
        Formula::or(vec![
            Formula::and(vec![Formula::not(x.clone()), y.clone()]),
            Formula::and(vec![Formula::equiv(x, y), below]),
        ])
    }
    let width = a.len().min(b.len());
    if width == 0 {
        return Formula::Const(false);
    }
    from(a, b, width - 1)
}

/// Evaluate a formula under an assignment of its variables.
pub fn evaluate(formula: &Formula, assignment: &dyn Fn(u32) -> bool) -> bool {
    match formula {
        Formula::Const(b) => *b,
        Formula::Var(v) => assignment(*v),
        Formula::Not(inner) => !evaluate(inner, assignment),
        Formula::And(children) => children.iter().all(|c| evaluate(c, assignment)),
        Formula::Or(children) => children.iter().any(|c| evaluate(c, assignment)),
    }
}
