use bytes::Bytes;
use fxhash::FxHashMap;
use std::sync::Mutex;

use crate::{content_hash, Address, ArtifactKind, Error, Store, WriteResult};

/// An in-memory backend. Content lives in a flat map keyed by address
/// path; heads live beside it. Used by tests and by ephemeral ledgers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    content: Mutex<FxHashMap<String, Bytes>>,
    heads: Mutex<FxHashMap<String, Address>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&self, ledger: &str, kind: ArtifactKind, content: &[u8]) -> WriteResult {
        let hash = content_hash(content);
        let path = format!("{ledger}/{}/{hash}", kind.segment());
        let address = Address::new(self.method(), path.clone());

        self.content
            .lock()
            .expect("memory store poisoned")
            .insert(path, Bytes::copy_from_slice(content));

        WriteResult {
            hash,
            address,
            size: content.len() as u64,
        }
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    fn method(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, address: &Address) -> Result<Option<Bytes>, Error> {
        if address.method != self.method() {
            return Err(Error::WrongMethod {
                requested: address.method.clone(),
                actual: self.method().to_string(),
            });
        }
        let content = self.content.lock().expect("memory store poisoned");
        Ok(content.get(&address.path).cloned())
    }

    async fn write(&self, ledger: &str, content: &[u8]) -> Result<WriteResult, Error> {
        Ok(self.put(ledger, ArtifactKind::Commit, content))
    }

    async fn index_file_write(
        &self,
        ledger: &str,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<WriteResult, Error> {
        Ok(self.put(ledger, kind, content))
    }

    async fn txn_write(&self, ledger: &str, content: &[u8]) -> Result<WriteResult, Error> {
        Ok(self.put(ledger, ArtifactKind::Txn, content))
    }

    async fn push(&self, head_path: &str, address: &Address) -> Result<(), Error> {
        self.heads
            .lock()
            .expect("memory store poisoned")
            .insert(head_path.to_string(), address.clone());
        Ok(())
    }

    async fn lookup(&self, head_path: &str) -> Result<Option<Address>, Error> {
        let heads = self.heads.lock().expect("memory store poisoned");
        Ok(heads.get(head_path).cloned())
    }
}
