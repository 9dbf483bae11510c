use crate::error::{GraphError, Result};
use crate::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredicateKind {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Inside,
    Outside,
    Between,
    Within,
    Without,
    /// `has(key)` — any value accepted, key must exist.
    Any,
    /// `hasNot(key)` — key must be absent.
    None,
}

impl PredicateKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "eq" => PredicateKind::Eq,
            "neq" => PredicateKind::Neq,
            "lt" => PredicateKind::Lt,
            "lte" => PredicateKind::Lte,
            "gt" => PredicateKind::Gt,
            "gte" => PredicateKind::Gte,
            "inside" => PredicateKind::Inside,
            "outside" => PredicateKind::Outside,
            "between" => PredicateKind::Between,
            "within" => PredicateKind::Within,
            "without" => PredicateKind::Without,
            _ => return None,
        })
    }
}

/// A predicate with its bound parameters, evaluated against property or
/// payload values.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub kind: PredicateKind,
    pub params: Vec<Value>,
}

impl Predicate {
    pub fn new(kind: PredicateKind, params: Vec<Value>) -> Self {
        Predicate { kind, params }
    }

    pub fn any() -> Self {
        Predicate {
            kind: PredicateKind::Any,
            params: Vec::new(),
        }
    }

    /// Scalar predicates take one param; inside/outside/between take two;
    /// within/without take any number.
    pub fn check_arity(&self) -> Result<()> {
        let ok = match self.kind {
            PredicateKind::Eq
            | PredicateKind::Neq
            | PredicateKind::Lt
            | PredicateKind::Lte
            | PredicateKind::Gt
            | PredicateKind::Gte => self.params.len() == 1,
            PredicateKind::Inside | PredicateKind::Outside | PredicateKind::Between => {
                self.params.len() == 2
            }
            PredicateKind::Within | PredicateKind::Without => !self.params.is_empty(),
            PredicateKind::Any | PredicateKind::None => true,
        };
        if ok {
            Ok(())
        } else {
            Err(GraphError::Parse(format!(
                "wrong number of parameters for {:?}",
                self.kind
            )))
        }
    }

    pub fn eval(&self, value: &Value) -> bool {
        use PredicateKind::*;
        match self.kind {
            Any => true,
            None => false,
            Eq => value == &self.params[0],
            Neq => value != &self.params[0],
            Lt => value < &self.params[0],
            Lte => value <= &self.params[0],
            Gt => value > &self.params[0],
            Gte => value >= &self.params[0],
            // inside: lo < v < hi, outside: v < lo || v > hi,
            // between: lo <= v < hi
            Inside => value > &self.params[0] && value < &self.params[1],
            Outside => value < &self.params[0] || value > &self.params[1],
            Between => value >= &self.params[0] && value < &self.params[1],
            Within => self.params.contains(value),
            Without => !self.params.contains(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_predicates() {
        let v = Value::Int(5);
        assert!(Predicate::new(PredicateKind::Eq, vec![Value::Int(5)]).eval(&v));
        assert!(Predicate::new(PredicateKind::Gt, vec![Value::Int(4)]).eval(&v));
        assert!(!Predicate::new(PredicateKind::Lt, vec![Value::Int(5)]).eval(&v));
    }

    #[test]
    fn range_predicates() {
        let v = Value::Int(5);
        let range = |kind| Predicate::new(kind, vec![Value::Int(5), Value::Int(10)]);
        assert!(!range(PredicateKind::Inside).eval(&v));
        assert!(range(PredicateKind::Between).eval(&v));
        assert!(!range(PredicateKind::Outside).eval(&v));
    }

    #[test]
    fn collection_predicates() {
        let v = Value::Str("a".into());
        let params = vec![Value::Str("a".into()), Value::Str("b".into())];
        assert!(Predicate::new(PredicateKind::Within, params.clone()).eval(&v));
        assert!(!Predicate::new(PredicateKind::Without, params).eval(&v));
    }
}
