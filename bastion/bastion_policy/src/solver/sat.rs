//! CNF conversion and the satisfiability backend.

use super::circuit::Formula;

/// A formula in conjunctive normal form. Literals are non-zero variable
/// numbers, negative when negated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cnf {
    pub num_vars: u32,
    pub clauses: Vec<Vec<i32>>,
}

impl Cnf {
    /// Tseitin encoding of `formula`, whose variables are `1..=num_vars`.
    pub fn from_formula(formula: &Formula, num_vars: u32) -> Cnf {
        let mut cnf = Cnf {
            num_vars,
            clauses: Vec::new(),
        };
        let root = cnf.encode(formula);
        cnf.clauses.push(vec![root]);
        cnf
    }

    fn fresh(&mut self) -> i32 {
        self.num_vars += 1;
        self.num_vars as i32
    }

    fn encode(&mut self, formula: &Formula) -> i32 {
        match formula {
            Formula::Const(value) => {
                let v = self.fresh();
                self.clauses.push(vec![if *value { v } else { -v }]);
                v
            }
            Formula::Var(v) => *v as i32,
            Formula::Not(inner) => -self.encode(inner),
            Formula::And(children) => {
                let literals: Vec<i32> = children.iter().map(|c| self.encode(c)).collect();
                let gate = self.fresh();
                let mut long = vec![gate];
                for literal in literals {
                    self.clauses.push(vec![-gate, literal]);
                    long.push(-literal);
                }
                self.clauses.push(long);
                gate
            }
            Formula::Or(children) => {
                let literals: Vec<i32> = children.iter().map(|c| self.encode(c)).collect();
                let gate = self.fresh();
                let mut long = vec![-gate];
                for literal in literals {
                    self.clauses.push(vec![gate, -literal]);
                    long.push(literal);
                }
                self.clauses.push(long);
                gate
            }
        }
    }
}

/// A boolean satisfiability solver.
pub trait SatBackend: Send + Sync {
    /// Whether some assignment satisfies every clause.
    fn solve(&self, cnf: &Cnf) -> bool;
}

/// DPLL with unit propagation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dpll;

type Assignment = Vec<Option<bool>>;

fn literal_value(assignment: &Assignment, literal: i32) -> Option<bool> {
    let value = assignment[literal.unsigned_abs() as usize]?;
    Some(if literal > 0 { value } else { !value })
}

fn assign(assignment: &mut Assignment, literal: i32, trail: &mut Vec<usize>) {
    let var = literal.unsigned_abs() as usize;
    assignment[var] = Some(literal > 0);
    trail.push(var);
}

impl Dpll {
    fn search(clauses: &[Vec<i32>], assignment: &mut Assignment) -> bool {
        let mut trail = Vec::new();

        // Unit propagation
        loop {
            let mut changed = false;
            for clause in clauses {
                let mut satisfied = false;
                let mut open = None;
                let mut open_count = 0;
                for &literal in clause {
                    match literal_value(assignment, literal) {
                        Some(true) => {
                            satisfied = true;
                            break;
                        }
                        Some(false) => {}
                        None => {
                            open_count += 1;
                            open = Some(literal);
                        }
                    }
                }
                if satisfied {
                    continue;
                }
                match (open_count, open) {
                    (0, _) => {
                        Self::undo(assignment, &trail);
                        return false;
                    }
                    (1, Some(literal)) => {
                        assign(assignment, literal, &mut trail);
                        changed = true;
                    }
                    _ => {}
                }
            }
            if !changed {
                break;
            }
        }

        let branch = clauses.iter().find_map(|clause| {
            if clause
                .iter()
                .any(|&l| literal_value(assignment, l) == Some(true))
            {
                return None;
            }
            clause
                .iter()
                .copied()
                .find(|&l| literal_value(assignment, l).is_none())
        });
        let Some(literal) = branch else {
            return true;
        };

        for choice in [literal, -literal] {
            let mut decision = Vec::new();
            assign(assignment, choice, &mut decision);
            if Self::search(clauses, assignment) {
                return true;
            }
            Self::undo(assignment, &decision);
        }
        Self::undo(assignment, &trail);
        false
    }

    fn undo(assignment: &mut Assignment, trail: &[usize]) {
        for var in trail {
            assignment[*var] = None;
        }
    }
}

impl SatBackend for Dpll {
    fn solve(&self, cnf: &Cnf) -> bool {
        let mut assignment = vec![None; cnf.num_vars as usize + 1];
        Self::search(&cnf.clauses, &mut assignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solve(formula: Formula, num_vars: u32) -> bool {
        Dpll.solve(&Cnf::from_formula(&formula, num_vars))
    }

    #[test]
    fn test_simple_formulas() {
        let x = Formula::Var(1);
        let y = Formula::Var(2);
        assert!(solve(x.clone(), 2));
        assert!(!solve(Formula::And(vec![x.clone(), Formula::Not(Box::new(x.clone()))]), 2));
        assert!(solve(
            Formula::And(vec![
                Formula::Or(vec![x.clone(), y.clone()]),
                Formula::Not(Box::new(x.clone())),
            ]),
            2
        ));
        assert!(!solve(
            Formula::And(vec![
                Formula::Or(vec![x.clone(), y.clone()]),
                Formula::Not(Box::new(x)),
                Formula::Not(Box::new(y)),
            ]),
            2
        ));
        assert!(!solve(Formula::Const(false), 0));
        assert!(solve(Formula::Const(true), 0));
    }
}
