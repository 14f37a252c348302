//! The commit pipeline: staging transactions into flakes, producing
//! content-addressed commit points linked to the branch head, replaying
//! foreign commit chains, and folding novelty into fresh index roots.

mod assemble;
mod commit;
mod merge;
mod stage;
mod txn;

pub use assemble::{assemble_data, flakes_to_nodes, Assembled};
pub use commit::{
    commit_meta_flakes, read_commit, read_data, write_commit, CommitDoc, CommitRef, DataDoc,
    DataRef, IndexDoc,
};
pub use merge::{merge_commit, reify, trace_commits};
pub use stage::{CommitOpts, Ledger};
pub use txn::{Txn, TripleTemplate};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    #[error("invalid retraction: {0}")]
    InvalidRetraction(String),
    #[error("transaction produced no flakes")]
    EmptyCommit,
    #[error("malformed transaction: {0}")]
    MalformedTxn(String),
    #[error("commit document at '{address}' is malformed")]
    MalformedCommit {
        address: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Codec(#[from] flake::Error),
    #[error(transparent)]
    Shacl(#[from] shapes::Error),
    #[error(transparent)]
    Policy(#[from] policy::Error),
    #[error(transparent)]
    Query(#[from] query::Error),
    #[error(transparent)]
    Db(#[from] db::Error),
    #[error(transparent)]
    Index(#[from] index::Error),
    #[error(transparent)]
    Storage(#[from] store::Error),
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::InvalidCommit(_)
            | Error::InvalidRetraction(_)
            | Error::EmptyCommit
            | Error::MalformedTxn(_) => 400,
            Error::MalformedCommit { .. } => 400,
            Error::Codec(inner) => inner.status(),
            Error::Shacl(inner) => inner.status(),
            Error::Policy(inner) => inner.status(),
            Error::Query(inner) => inner.status(),
            Error::Db(inner) => inner.status(),
            Error::Index(inner) => inner.status(),
            Error::Storage(inner) => inner.status(),
        }
    }
}
