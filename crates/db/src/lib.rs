//! The immutable database snapshot: one value per transaction, carrying
//! the four index roots, the novelty overlay, hydrated schema, namespace
//! table, and an optional policy filter. Snapshots are cheap to clone and
//! never mutated; every stage, merge, or refresh produces a successor.

use std::sync::Arc;

use flake::{Flake, IndexKind, Namespaces};
use index::{IndexRoot, NodeCache, Novelty};
use store::{Address, Store};

pub mod reads;
mod schema;

pub use reads::{history, subject_flakes, subject_graph, HistoryBlock};
pub use schema::{is_vocab_flake, Schema};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Index(#[from] index::Error),
    #[error(transparent)]
    Codec(#[from] flake::Error),
    #[error(transparent)]
    Storage(#[from] store::Error),
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::Index(inner) => inner.status(),
            Error::Codec(inner) => inner.status(),
            Error::Storage(inner) => inner.status(),
        }
    }
}

/// Per-identity visibility, evaluated flake by flake during reads. The
/// policy engine supplies the implementation; reads that carry no policy
/// see everything.
#[async_trait::async_trait]
pub trait VisibilityFilter: std::fmt::Debug + Send + Sync {
    async fn allow(&self, db: &Db, flake: &Flake) -> bool;
}

/// The head commit this snapshot descends from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Head {
    pub t: i64,
    pub id: Option<String>,
    pub address: Option<Address>,
    /// Transaction through which the persistent indexes are current.
    pub indexed_t: i64,
}

/// Running totals surfaced in commit data documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub flakes: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct IndexRoots {
    pub spot: IndexRoot,
    pub post: IndexRoot,
    pub opst: IndexRoot,
    pub tspo: IndexRoot,
}

impl IndexRoots {
    pub fn genesis() -> Self {
        Self {
            spot: IndexRoot::genesis(IndexKind::Spot),
            post: IndexRoot::genesis(IndexKind::Post),
            opst: IndexRoot::genesis(IndexKind::Opst),
            tspo: IndexRoot::genesis(IndexKind::Tspo),
        }
    }

    pub fn root(&self, kind: IndexKind) -> &IndexRoot {
        match kind {
            IndexKind::Spot => &self.spot,
            IndexKind::Post => &self.post,
            IndexKind::Opst => &self.opst,
            IndexKind::Tspo => &self.tspo,
        }
    }

    pub fn replace(&self, roots: Vec<IndexRoot>) -> Self {
        let mut next = self.clone();
        for root in roots {
            match root.kind {
                IndexKind::Spot => next.spot = root,
                IndexKind::Post => next.post = root,
                IndexKind::Opst => next.opst = root,
                IndexKind::Tspo => next.tspo = root,
            }
        }
        next
    }

    pub fn all(&self) -> Vec<IndexRoot> {
        vec![
            self.spot.clone(),
            self.post.clone(),
            self.opst.clone(),
            self.tspo.clone(),
        ]
    }
}

/// One immutable snapshot of a ledger branch.
#[derive(Debug, Clone)]
pub struct Db {
    pub ledger: String,
    pub t: i64,
    pub store: Arc<dyn Store>,
    pub head: Head,
    pub indexes: IndexRoots,
    pub novelty: Arc<Novelty>,
    pub schema: Arc<Schema>,
    pub namespaces: Arc<Namespaces>,
    pub policy: Option<Arc<dyn VisibilityFilter>>,
    pub stats: Stats,
    /// Resolved-node memo shared across snapshots; content addressing
    /// makes the entries permanently valid.
    pub node_cache: Arc<NodeCache>,
}

impl Db {
    /// A brand-new, empty branch.
    pub fn genesis(ledger: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            ledger: ledger.into(),
            t: 0,
            store,
            head: Head::default(),
            indexes: IndexRoots::genesis(),
            novelty: Arc::new(Novelty::new()),
            schema: Arc::new(Schema::default()),
            namespaces: Arc::new(Namespaces::bootstrap()),
            policy: None,
            stats: Stats::default(),
            node_cache: Arc::new(NodeCache::new()),
        }
    }

    /// Fold a transaction's flakes into a successor snapshot: advance `t`,
    /// overlay novelty, update stats, and rehydrate the schema when
    /// vocabulary statements are present.
    pub fn with_flakes(&self, t: i64, adds: &[Flake], removes: &[Flake]) -> Self {
        let mut next = self.clone();
        next.t = t;
        next.novelty = Arc::new(self.novelty.update(adds.iter(), removes.iter()));

        next.stats.flakes = (next.stats.flakes + adds.len() as u64) - removes.len() as u64;
        let added: u64 = adds.iter().map(Flake::size).sum();
        let removed: u64 = removes.iter().map(Flake::size).sum();
        next.stats.size = next.stats.size + added - removed;

        if adds.iter().any(is_vocab_flake) || removes.iter().any(is_vocab_flake) {
            tracing::debug!(t, "vocabulary changed; rehydrating schema");
            next.schema = Arc::new(self.schema.hydrate(t, adds, removes));
        }
        next
    }

    /// Snapshot with the novelty flushed through `t` and fresh index roots,
    /// as produced by a refresh.
    pub fn with_index_roots(&self, indexed_t: i64, roots: Vec<IndexRoot>) -> Self {
        let mut next = self.clone();
        next.indexes = self.indexes.replace(roots);
        next.novelty = Arc::new(self.novelty.emptied(Some(indexed_t)));
        next.head.indexed_t = indexed_t;
        next
    }

    pub fn with_namespaces(&self, namespaces: Namespaces) -> Self {
        let mut next = self.clone();
        next.namespaces = Arc::new(namespaces);
        next
    }

    pub fn with_policy(&self, policy: Arc<dyn VisibilityFilter>) -> Self {
        let mut next = self.clone();
        next.policy = Some(policy);
        next
    }

    /// A time-travel view: the same snapshot capped at an earlier
    /// transaction. Reads through it behave as the database did then.
    pub fn as_of(&self, t: i64) -> Self {
        let mut past = self.clone();
        past.t = t.min(self.t);
        past
    }

    /// Resolve an IRI that must already be known to this snapshot.
    pub fn iri_to_sid(&self, iri: &str) -> Result<flake::Sid, Error> {
        Ok(self.namespaces.try_encode_iri(iri)?)
    }

    pub fn sid_to_iri(&self, sid: &flake::Sid) -> Result<String, Error> {
        Ok(self.namespaces.decode_sid(sid)?)
    }
}
