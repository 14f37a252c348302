use std::collections::BTreeMap;

use flake::{compare_obj, Sid, Value};

/// One position of a triple pattern: a variable, a fixed IRI, or a fixed
/// literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Var(String),
    Iri(String),
    Value(serde_json::Value),
}

impl Term {
    pub fn var(name: impl Into<String>) -> Self {
        Term::Var(name.into())
    }

    pub fn iri(iri: impl Into<String>) -> Self {
        Term::Iri(iri.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriplePattern {
    pub s: Term,
    pub p: Term,
    pub o: Term,
}

/// A where-clause pattern.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// A plain triple pattern.
    Tuple(TriplePattern),
    /// Class membership, expanded over the subclass closure and
    /// de-duplicated by subject.
    Class(TriplePattern),
    /// Named-graph alias selector over a sub-clause.
    Graph { alias: String, clauses: Vec<Pattern> },
    /// Alternative sub-clauses, concatenated.
    Union(Vec<Vec<Pattern>>),
    /// A sub-clause whose failure leaves the input solution intact.
    Optional(Vec<Pattern>),
    /// Compute a variable from an expression.
    Bind { var: String, expr: crate::Expr },
    /// Keep only solutions satisfying a boolean expression.
    Filter(crate::Expr),
}

/// What a variable is bound to: a subject/reference id, or a literal with
/// its datatype.
#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    Sid(Sid),
    Val(Value, Sid),
}

impl Match {
    pub fn as_sid(&self) -> Option<&Sid> {
        match self {
            Match::Sid(sid) => Some(sid),
            Match::Val(..) => None,
        }
    }

    /// Equality across bindings: ids by identity, literals by type-aware
    /// value comparison.
    pub fn same(&self, other: &Match) -> bool {
        match (self, other) {
            (Match::Sid(l), Match::Sid(r)) => l == r,
            (Match::Val(lv, ld), Match::Val(rv, rd)) => {
                compare_obj(lv, ld, rv, rd) == std::cmp::Ordering::Equal
            }
            _ => false,
        }
    }
}

/// A solution maps variable names to their matches. Ordered keys keep
/// result assembly deterministic.
pub type Solution = BTreeMap<String, Match>;

/// A compiled query: optional seed solutions plus the where clause.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub values: Vec<Solution>,
    pub patterns: Vec<Pattern>,
}
