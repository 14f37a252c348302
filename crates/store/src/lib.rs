//! The storage contract: content-addressed reads and writes of commit,
//! transaction, and index artifacts, plus name-service head publication.
//! Backends are interchangeable behind the async [`Store`] trait; the
//! reference backends are in-memory and local-file.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed storage address '{0}'")]
    MalformedAddress(String),
    #[error("address '{0}' was not found")]
    NotFound(String),
    #[error("storage backend '{actual}' cannot serve address method '{requested}'")]
    WrongMethod { requested: String, actual: String },
    #[error("storage i/o failure at '{context}'")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn status(&self) -> u16 {
        500
    }
}

/// The artifact kinds a backend files separately. Index artifacts are
/// written through `index_file_write` and carry their kind in the address
/// path; commits and transactions have dedicated entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Commit,
    Txn,
    Leaf,
    Branch,
    Root,
    Garbage,
}

impl ArtifactKind {
    pub fn segment(&self) -> &'static str {
        match self {
            ArtifactKind::Commit => "commit",
            ArtifactKind::Txn => "txn",
            ArtifactKind::Leaf => "leaf",
            ArtifactKind::Branch => "branch",
            ArtifactKind::Root => "root",
            ArtifactKind::Garbage => "garbage",
        }
    }
}

/// A storage address: `fluree:<method>://<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub method: String,
    pub path: String,
}

impl Address {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fluree:{}://{}", self.method, self.path)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let rest = s
            .strip_prefix("fluree:")
            .ok_or_else(|| Error::MalformedAddress(s.to_string()))?;
        let (method, path) = rest
            .split_once("://")
            .ok_or_else(|| Error::MalformedAddress(s.to_string()))?;
        if method.is_empty() || path.is_empty() {
            return Err(Error::MalformedAddress(s.to_string()));
        }
        Ok(Address::new(method, path))
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Outcome of a content-addressed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub hash: String,
    pub address: Address,
    pub size: u64,
}

/// SHA-256 of the content, hex-rendered: the content id for every artifact.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// The connection contract between the core and a storage backend. Writes
/// are idempotent: the address is a pure function of ledger, kind, and
/// content hash, so racing writers of identical content converge.
#[async_trait::async_trait]
pub trait Store: fmt::Debug + Send + Sync + 'static {
    /// The address method this backend serves, e.g. `memory` or `file`.
    fn method(&self) -> &'static str;

    /// Read any artifact by address. `None` when absent.
    async fn read(&self, address: &Address) -> Result<Option<Bytes>, Error>;

    /// Write a commit document.
    async fn write(&self, ledger: &str, content: &[u8]) -> Result<WriteResult, Error>;

    /// Read an index artifact; absence is an error, since index nodes are
    /// only ever referenced after a successful write.
    async fn index_file_read(&self, address: &Address) -> Result<Bytes, Error> {
        match self.read(address).await? {
            Some(bytes) => Ok(bytes),
            None => Err(Error::NotFound(address.to_string())),
        }
    }

    /// Write an index artifact of the given kind.
    async fn index_file_write(
        &self,
        ledger: &str,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<WriteResult, Error>;

    /// Read an inbound transaction payload.
    async fn txn_read(&self, address: &Address) -> Result<Bytes, Error> {
        match self.read(address).await? {
            Some(bytes) => Ok(bytes),
            None => Err(Error::NotFound(address.to_string())),
        }
    }

    /// Write an inbound transaction payload.
    async fn txn_write(&self, ledger: &str, content: &[u8]) -> Result<WriteResult, Error>;

    /// Publish the branch head.
    async fn push(&self, head_path: &str, address: &Address) -> Result<(), Error>;

    /// Resolve the published branch head, if any.
    async fn lookup(&self, head_path: &str) -> Result<Option<Address>, Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        for fixture in [
            "fluree:memory://demo/main/commit/abc123",
            "fluree:file://var/data/demo/leaf/deadbeef",
        ] {
            let address: Address = fixture.parse().unwrap();
            assert_eq!(address.to_string(), fixture);
        }
    }

    #[test]
    fn test_malformed_addresses() {
        for fixture in ["memory://x", "fluree:memory:/x", "fluree:://path", "fluree:memory://"] {
            assert!(
                fixture.parse::<Address>().is_err(),
                "{fixture} should not parse"
            );
        }
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b""), content_hash(b""));
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
        assert_eq!(content_hash(b"x").len(), 64);
    }
}
