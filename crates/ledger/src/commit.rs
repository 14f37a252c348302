use serde::{Deserialize, Serialize};

use flake::{codes, dt, Flake, Sid, Value};
use store::{Address, Store};

use crate::Error;

pub const COMMIT_VERSION: u32 = 1;

/// A pointer to another commit artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub id: String,
    pub address: Address,
}

/// A pointer to a commit's data document, with its summary numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    pub id: String,
    pub address: Address,
    pub t: i64,
    pub flakes: u64,
    pub size: u64,
}

/// Index roots current as of a commit. Each address resolves to a
/// persisted `IndexRoot` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDoc {
    pub t: i64,
    pub spot: Address,
    pub post: Address,
    pub opst: Address,
    pub tspo: Address,
}

/// The commit document, serialized as plain-key JSON. Context compaction
/// into the interchange JSON-LD form is a surface concern, not ours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitDoc {
    pub v: u32,
    pub alias: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<CommitRef>,
    pub data: DataRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexDoc>,
}

/// The data document a commit points at: the transaction's assertions and
/// retractions in expanded node form, plus the full novel-namespace list
/// in code order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataDoc {
    pub t: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assert: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retract: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

/// Write a commit document, returning its reference.
pub async fn write_commit(
    store: &dyn Store,
    ledger: &str,
    doc: &CommitDoc,
) -> Result<CommitRef, Error> {
    let bytes = serde_json::to_vec(doc).expect("commit documents always serialize");
    let result = store.write(ledger, &bytes).await?;
    Ok(CommitRef {
        id: result.hash,
        address: result.address,
    })
}

pub async fn read_commit(store: &dyn Store, address: &Address) -> Result<CommitDoc, Error> {
    Ok(read_commit_entry(store, address).await?.0)
}

/// Read a commit document along with its content-derived reference. The
/// id is recomputed from the bytes, so a tampered artifact no longer
/// answers to the id its children point at.
pub async fn read_commit_entry(
    store: &dyn Store,
    address: &Address,
) -> Result<(CommitDoc, CommitRef), Error> {
    let bytes = store
        .read(address)
        .await?
        .ok_or_else(|| Error::InvalidCommit(format!("missing commit at '{address}'")))?;
    let doc = serde_json::from_slice(&bytes).map_err(|source| Error::MalformedCommit {
        address: address.to_string(),
        source,
    })?;
    let reference = CommitRef {
        id: store::content_hash(&bytes),
        address: address.clone(),
    };
    Ok((doc, reference))
}

pub async fn read_data(store: &dyn Store, address: &Address) -> Result<DataDoc, Error> {
    let bytes = store
        .read(address)
        .await?
        .ok_or_else(|| Error::InvalidCommit(format!("missing data document at '{address}'")))?;
    serde_json::from_slice(&bytes).map_err(|source| Error::MalformedCommit {
        address: address.to_string(),
        source,
    })
}

/// The commit's own subject id inside the database.
pub fn commit_sid(id: &str) -> Sid {
    Sid::new(codes::LEDGER, format!("commit/{id}"))
}

/// Metadata flakes describing a commit, merged alongside its data flakes:
/// the commit address, the previous links, issuer, message, time, v, and
/// the data summary numbers.
pub fn commit_meta_flakes(doc: &CommitDoc, commit_ref: &CommitRef, t: i64) -> Vec<Flake> {
    let subject = commit_sid(&commit_ref.id);
    let meta = |p: &str, o: Value, datatype: Sid| {
        Flake::new(
            subject.clone(),
            Sid::new(codes::LEDGER, p),
            o,
            datatype,
            t,
            true,
            None,
        )
    };

    let mut flakes = vec![
        meta(
            "address",
            Value::String(commit_ref.address.to_string()),
            dt::string(),
        ),
        meta("v", Value::Long(doc.v as i64), dt::long()),
        meta(
            "data",
            Value::String(doc.data.address.to_string()),
            dt::string(),
        ),
        meta("flakes", Value::Long(doc.data.flakes as i64), dt::long()),
        meta("size", Value::Long(doc.data.size as i64), dt::long()),
        meta("t", Value::Long(doc.data.t), dt::long()),
    ];
    if let Some(previous) = &doc.previous {
        flakes.push(Flake::new(
            subject.clone(),
            Sid::new(codes::LEDGER, "previous"),
            Value::Sid(commit_sid(&previous.id)),
            dt::any_uri(),
            t,
            true,
            None,
        ));
    }
    if let Some(issuer) = &doc.issuer {
        flakes.push(meta("issuer", Value::String(issuer.clone()), dt::string()));
    }
    if let Some(message) = &doc.message {
        flakes.push(meta("message", Value::String(message.clone()), dt::string()));
    }
    if let Some(when) = &doc.time {
        flakes.push(meta("time", Value::String(when.clone()), dt::string()));
    }
    flakes
}

#[cfg(test)]
mod test {
    use super::*;
    use store::MemoryStore;

    fn doc(t: i64) -> CommitDoc {
        CommitDoc {
            v: COMMIT_VERSION,
            alias: "demo".to_string(),
            branch: "main".to_string(),
            time: Some("2024-02-29T00:00:00Z".to_string()),
            message: Some("hello".to_string()),
            issuer: None,
            previous: None,
            data: DataRef {
                id: "abc".to_string(),
                address: Address::new("memory", "demo/commit/abc"),
                t,
                flakes: 3,
                size: 120,
            },
            index: None,
        }
    }

    #[tokio::test]
    async fn test_commit_document_round_trip() {
        let store = MemoryStore::new();
        let written = write_commit(&store, "demo", &doc(1)).await.unwrap();
        let read = read_commit(&store, &written.address).await.unwrap();
        assert_eq!(read, doc(1));

        // Identical commit content converges on the same id.
        let again = write_commit(&store, "demo", &doc(1)).await.unwrap();
        assert_eq!(again, written);
    }

    #[tokio::test]
    async fn test_missing_commit_is_invalid() {
        let store = MemoryStore::new();
        let absent = Address::new("memory", "demo/commit/none");
        assert!(matches!(
            read_commit(&store, &absent).await,
            Err(Error::InvalidCommit(_))
        ));
    }

    #[test]
    fn test_meta_flakes_reference_previous() {
        let mut with_previous = doc(2);
        with_previous.previous = Some(CommitRef {
            id: "prior".to_string(),
            address: Address::new("memory", "demo/commit/prior"),
        });

        let commit_ref = CommitRef {
            id: "current".to_string(),
            address: Address::new("memory", "demo/commit/current"),
        };
        let flakes = commit_meta_flakes(&with_previous, &commit_ref, 2);

        assert!(flakes.iter().all(|f| f.t == 2 && f.op));
        assert!(flakes
            .iter()
            .any(|f| f.p.name == "previous" && f.o.as_sid() == Some(&commit_sid("prior"))));
        assert!(flakes
            .iter()
            .any(|f| f.p.name == "address"
                && f.o.as_str() == Some("fluree:memory://demo/commit/current")));
    }
}
