use db::Db;
use shapes::ShapeCache;
use store::{Address, Store};

use crate::assemble::assemble_data;
use crate::commit::{commit_meta_flakes, read_commit_entry, read_data, CommitDoc, CommitRef, DataDoc};
use crate::stage::datatype_hints;
use crate::Error;

/// Walk backwards from `latest` through `previous` links, validating that
/// each hop's transaction directly precedes the one after it. Returns the
/// commits with `t >= from_t`, oldest first.
pub async fn trace_commits(
    store: &dyn Store,
    latest: &Address,
    from_t: i64,
) -> Result<Vec<(CommitDoc, CommitRef, DataDoc)>, Error> {
    let mut chain: Vec<(CommitDoc, CommitRef, DataDoc)> = Vec::new();
    let mut cursor = Some(latest.clone());
    let mut expected_t: Option<i64> = None;

    while let Some(address) = cursor {
        let (doc, reference) = read_commit_entry(store, &address).await?;
        if let Some(expected) = expected_t {
            if doc.data.t != expected {
                return Err(Error::InvalidCommit(format!(
                    "commit chain is not contiguous: expected t {expected}, found {}",
                    doc.data.t
                )));
            }
        }
        if doc.data.t < from_t {
            break;
        }
        let data = read_data(store, &doc.data.address).await?;
        if data.t != doc.data.t {
            return Err(Error::InvalidCommit(format!(
                "data document t {} disagrees with its commit t {}",
                data.t, doc.data.t
            )));
        }

        expected_t = Some(doc.data.t - 1);
        cursor = doc.previous.as_ref().map(|p| p.address.clone());
        let done = doc.data.t == from_t;
        chain.push((doc, reference, data));
        if done {
            break;
        }
        if cursor.is_none() {
            return Err(Error::InvalidCommit(format!(
                "commit chain ends at t {} without reaching t {from_t}",
                expected_t.unwrap_or_default() + 1
            )));
        }
    }

    chain.reverse();
    Ok(chain)
}

/// Fold one foreign commit into the snapshot: translate its data document
/// into flakes, append the commit's own metadata statements, and produce
/// the successor.
pub async fn merge_commit(
    db: &Db,
    doc: &CommitDoc,
    reference: &CommitRef,
    data: &DataDoc,
    cache: &ShapeCache,
) -> Result<Db, Error> {
    let hints = datatype_hints(db, cache).await?;
    let assembled = assemble_data(db, data, &hints)?;

    let mut flakes = assembled.flakes;
    flakes.extend(commit_meta_flakes(doc, reference, data.t));

    tracing::debug!(t = data.t, flakes = flakes.len(), "merged commit");
    let mut next = db
        .with_namespaces(assembled.namespaces)
        .with_flakes(data.t, &flakes, &[]);
    next.head = db::Head {
        t: data.t,
        id: Some(reference.id.clone()),
        address: Some(reference.address.clone()),
        indexed_t: db.head.indexed_t,
    };
    Ok(next)
}

/// Reify a foreign chain whose head is `latest`: replay every commit this
/// snapshot is missing, in order.
pub async fn reify(db: &Db, latest: &Address, cache: &ShapeCache) -> Result<Db, Error> {
    let chain = trace_commits(db.store.as_ref(), latest, db.t + 1).await?;
    let mut current = db.clone();
    for (doc, reference, data) in &chain {
        current = merge_commit(&current, doc, reference, data, cache).await?;
    }
    Ok(current)
}
