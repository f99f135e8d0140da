//! Guard predicates evaluated against host facts.
//!
//! A small AST instead of a string expression language: equality and
//! existence tests over the fact map plus boolean combinators. Evaluation
//! is deterministic; a missing fact simply fails the test.

use crate::facts::Facts;

/// Condition attached to a resource via `when`.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// The fact exists and equals the value.
    FactEquals { fact: String, value: String },
    /// The fact is present at all.
    FactExists { fact: String },
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn fact_equals(fact: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::FactEquals {
            fact: fact.into(),
            value: value.into(),
        }
    }

    pub fn evaluate(&self, facts: &Facts) -> bool {
        match self {
            Predicate::FactEquals { fact, value } => facts.get(fact) == Some(value.as_str()),
            Predicate::FactExists { fact } => facts.get(fact).is_some(),
            Predicate::Not(inner) => !inner.evaluate(facts),
            Predicate::All(preds) => preds.iter().all(|p| p.evaluate(facts)),
            Predicate::Any(preds) => preds.iter().any(|p| p.evaluate(facts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debian_facts() -> Facts {
        Facts::for_os("linux", "debian")
    }

    #[test]
    fn test_fact_equals() {
        let facts = debian_facts();
        assert!(Predicate::fact_equals("os_family", "debian").evaluate(&facts));
        assert!(!Predicate::fact_equals("os_family", "rhel").evaluate(&facts));
        assert!(!Predicate::fact_equals("nonexistent", "x").evaluate(&facts));
    }

    #[test]
    fn test_fact_exists() {
        let facts = debian_facts();
        assert!(Predicate::FactExists { fact: "os".into() }.evaluate(&facts));
        assert!(!Predicate::FactExists { fact: "ghost".into() }.evaluate(&facts));
    }

    #[test]
    fn test_combinators() {
        let facts = debian_facts();
        let linux = Predicate::fact_equals("os", "linux");
        let rhel = Predicate::fact_equals("os_family", "rhel");

        assert!(Predicate::Not(Box::new(rhel.clone())).evaluate(&facts));
        assert!(Predicate::Any(vec![rhel.clone(), linux.clone()]).evaluate(&facts));
        assert!(!Predicate::All(vec![rhel, linux.clone()]).evaluate(&facts));
        assert!(Predicate::All(vec![linux]).evaluate(&facts));
    }

    #[test]
    fn test_empty_combinators() {
        let facts = debian_facts();
        // all([]) is vacuously true, any([]) is false.
        assert!(Predicate::All(Vec::new()).evaluate(&facts));
        assert!(!Predicate::Any(Vec::new()).evaluate(&facts));
    }
}
