//! The graph-pattern matcher: where-clause patterns evaluated as a fold
//! of solution streams over the index trees. Within one pattern, solutions
//! arrive in the chosen index's comparator order; the first error closes
//! the stream.

mod execute;
mod expr;
mod pattern;
mod select;

pub use execute::{search, SolutionStream};
pub use expr::{eval, Expr, Op};
pub use pattern::{Match, Pattern, Query, Solution, Term, TriplePattern};
pub use select::{select, Selection};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] db::Error),
    #[error("unbound variable '{0}' in expression")]
    UnboundVariable(String),
    #[error("expression type error: {0}")]
    ExprType(String),
    #[error("unknown graph alias '{0}'")]
    UnknownGraph(String),
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::Db(inner) => inner.status(),
            Error::UnboundVariable(_) | Error::ExprType(_) | Error::UnknownGraph(_) => 400,
        }
    }
}
