//! Persistent sorted indexes over flakes: content-addressed B-tree nodes,
//! the in-memory novelty overlay, bounded range streaming, and the refresh
//! pipeline that folds novelty into new index roots.

mod config;
mod fuel;
mod node;
mod novelty;
mod range;
mod refresh;
mod watch;

pub use config::Config;
pub use fuel::Fuel;
pub use node::{resolve, resolve_cached, Branch, ChildRef, IndexRoot, Leaf, Node, NodeCache, NodeId};
pub use novelty::Novelty;
pub use range::{collect_range, index_range, FlakeFilter, RangeBounds, RangeOpts};
pub use refresh::{refresh_all, refresh_index, GarbageDoc, RefreshOutcome};
pub use watch::{StatusLock, WatchEvent, Watchers};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("query exhausted its fuel allowance of {limit}")]
    FuelExhausted { limit: i64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Storage(#[from] store::Error),
    #[error("malformed index node at '{address}'")]
    CorruptNode {
        address: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("indexing failed: {0}")]
    Indexing(String),
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::FuelExhausted { .. } | Error::InvalidConfig(_) => 400,
            Error::Storage(_) | Error::CorruptNode { .. } | Error::Indexing(_) => 500,
        }
    }
}
