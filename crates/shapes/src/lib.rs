//! The SHACL engine: shape compilation from vocabulary flakes, focus-node
//! resolution against a transaction's modified subjects, and constraint
//! evaluation along property paths. Violations are collected rather than
//! short-circuited so a failing transaction reports every problem at once.

use serde::Serialize;

mod compile;
mod validate;

pub use compile::{compile_shape, Constraint, NodeKind, NodeShape, PathSegment, PropertyShape, ShapeCache};
pub use validate::{validate_transaction, ValueNode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("SHACL PropertyShape exception - {}", .0.summary())]
    Violation(ValidationReport),
    #[error(transparent)]
    Db(#[from] db::Error),
    #[error("shape {shape} has a malformed {what}")]
    MalformedShape { shape: String, what: String },
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::Violation(_) | Error::MalformedShape { .. } => 400,
            Error::Db(inner) => inner.status(),
        }
    }
}

/// Everything a failing transaction reports back.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn conforms(&self) -> bool {
        self.results.is_empty()
    }

    fn summary(&self) -> String {
        self.results
            .iter()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// One constraint failure for one focus node.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    /// Focus node the shape targeted.
    pub subject: String,
    /// The property path under evaluation, printed.
    pub path: String,
    /// Constraint component that failed.
    pub constraint: String,
    /// The shape that produced this result.
    pub shape: String,
    /// Offending value, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// What the constraint expected, printed.
    pub expect: String,
    pub message: String,
}
