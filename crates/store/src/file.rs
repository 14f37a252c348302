use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::{content_hash, Address, ArtifactKind, Error, Store, WriteResult};

/// A local-filesystem backend rooted at a directory. Artifacts land at
/// `<root>/<ledger>/<kind>/<hash>`; heads are small files holding the
/// current head address.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn put(
        &self,
        ledger: &str,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<WriteResult, Error> {
        let hash = content_hash(content);
        let rel = format!("{ledger}/{}/{hash}", kind.segment());
        let target = self.resolve(&rel);

        ensure_parent(&target).await?;
        // Content-addressed: an existing file already holds these bytes.
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            tracing::trace!(%rel, "skipping write of existing artifact");
        } else {
            tokio::fs::write(&target, content)
                .await
                .map_err(|source| Error::Io {
                    context: rel.clone(),
                    source,
                })?;
        }

        Ok(WriteResult {
            hash,
            address: Address::new(self.method(), rel),
            size: content.len() as u64,
        })
    }
}

async fn ensure_parent(target: &Path) -> Result<(), Error> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| Error::Io {
                context: parent.display().to_string(),
                source,
            })?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Store for FileStore {
    fn method(&self) -> &'static str {
        "file"
    }

    async fn read(&self, address: &Address) -> Result<Option<Bytes>, Error> {
        if address.method != self.method() {
            return Err(Error::WrongMethod {
                requested: address.method.clone(),
                actual: self.method().to_string(),
            });
        }
        match tokio::fs::read(self.resolve(&address.path)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Io {
                context: address.path.clone(),
                source,
            }),
        }
    }

    async fn write(&self, ledger: &str, content: &[u8]) -> Result<WriteResult, Error> {
        self.put(ledger, ArtifactKind::Commit, content).await
    }

    async fn index_file_write(
        &self,
        ledger: &str,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<WriteResult, Error> {
        self.put(ledger, kind, content).await
    }

    async fn txn_write(&self, ledger: &str, content: &[u8]) -> Result<WriteResult, Error> {
        self.put(ledger, ArtifactKind::Txn, content).await
    }

    async fn push(&self, head_path: &str, address: &Address) -> Result<(), Error> {
        let target = self.resolve(head_path);
        ensure_parent(&target).await?;
        tokio::fs::write(&target, address.to_string().as_bytes())
            .await
            .map_err(|source| Error::Io {
                context: head_path.to_string(),
                source,
            })
    }

    async fn lookup(&self, head_path: &str) -> Result<Option<Address>, Error> {
        match tokio::fs::read_to_string(self.resolve(head_path)).await {
            Ok(raw) => Ok(Some(raw.trim().parse()?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Io {
                context: head_path.to_string(),
                source,
            }),
        }
    }
}
