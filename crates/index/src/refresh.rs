use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};

use flake::{Flake, FlakeSet, IndexKind, Sid, Test};
use store::{Address, ArtifactKind, Store};

use crate::node::{resolve, write_branch, write_leaf, Branch, ChildRef, IndexRoot, Leaf, Node, NodeId};
use crate::{Config, Error, Novelty};

/// Result of refreshing every index: the new roots, the ids of rewritten
/// nodes, and the address of the garbage record enumerating them.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub roots: Vec<IndexRoot>,
    pub garbage: Vec<Address>,
    pub garbage_address: Option<Address>,
}

/// The persisted garbage record: everything superseded by one refresh.
#[derive(Debug, Serialize, Deserialize)]
pub struct GarbageDoc {
    pub ledger: String,
    pub t: i64,
    pub garbage: Vec<Address>,
}

/// Fold novelty through `to_t` into every index tree, then write one
/// garbage record for all superseded nodes.
pub async fn refresh_all(
    store: &dyn Store,
    ledger: &str,
    roots: Vec<IndexRoot>,
    novelty: &Novelty,
    remove_preds: &FxHashSet<Sid>,
    to_t: i64,
    cfg: &Config,
) -> Result<RefreshOutcome, Error> {
    let mut out_roots = Vec::with_capacity(roots.len());
    let mut garbage = Vec::new();

    for root in roots {
        let kind = root.kind;
        let (root, mut old) =
            refresh_index(store, ledger, root, novelty, remove_preds, to_t, cfg).await?;
        tracing::debug!(
            index = kind.name(),
            t = to_t,
            rewritten = old.len(),
            "refreshed index"
        );
        out_roots.push(root);
        garbage.append(&mut old);
    }

    let garbage_address = if garbage.is_empty() {
        None
    } else {
        let doc = GarbageDoc {
            ledger: ledger.to_string(),
            t: to_t,
            garbage: garbage.clone(),
        };
        let bytes = serde_json::to_vec(&doc).expect("garbage records always serialize");
        let result = store
            .index_file_write(ledger, ArtifactKind::Garbage, &bytes)
            .await?;
        Some(result.address)
    };

    Ok(RefreshOutcome {
        roots: out_roots,
        garbage,
        garbage_address,
    })
}

enum Frame {
    Enter(ChildRef),
    Exit(BranchMeta),
}

struct BranchMeta {
    first: Option<Flake>,
    rhs: Option<Flake>,
    leftmost: bool,
}

/// Refresh a single index tree. A depth-first walk over an explicit stack:
/// children of a branch are processed (and written) before the branch
/// itself, so parents only ever persist final child addresses.
pub async fn refresh_index(
    store: &dyn Store,
    ledger: &str,
    root: IndexRoot,
    novelty: &Novelty,
    remove_preds: &FxHashSet<Sid>,
    to_t: i64,
    cfg: &Config,
) -> Result<(IndexRoot, Vec<Address>), Error> {
    let kind = root.kind;
    if novelty.set(kind).is_empty() && remove_preds.is_empty() {
        return Ok((root, Vec::new()));
    }

    let mut garbage: Vec<Address> = Vec::new();
    let mut acc: Vec<Vec<ChildRef>> = vec![Vec::new()];
    let mut stack: Vec<Frame> = vec![Frame::Enter(root.node)];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(child) => {
                if untouched(kind, &child, novelty, remove_preds, to_t) {
                    acc.last_mut().expect("accumulator never empty").push(child);
                    continue;
                }
                match resolve(store, kind, &child).await? {
                    Node::Leaf(leaf) => {
                        if let Some(address) = leaf.id.address() {
                            garbage.push(address.clone());
                        }
                        let rebuilt =
                            integrate_leaf(kind, leaf, novelty, remove_preds, to_t, cfg);
                        let level = acc.last_mut().expect("accumulator never empty");
                        for piece in rebuilt {
                            let (reference, _) = write_leaf(store, ledger, &piece).await?;
                            level.push(reference);
                        }
                    }
                    Node::Branch(branch) => {
                        if let Some(address) = branch.id.address() {
                            garbage.push(address.clone());
                        }
                        stack.push(Frame::Exit(BranchMeta {
                            first: branch.first.clone(),
                            rhs: branch.rhs.clone(),
                            leftmost: branch.leftmost,
                        }));
                        acc.push(Vec::new());
                        for child in branch.children.into_iter().rev() {
                            stack.push(Frame::Enter(child));
                        }
                    }
                }
            }
            Frame::Exit(meta) => {
                let children = acc.pop().expect("a level was opened for this branch");
                let level = acc.last_mut().expect("accumulator never empty");
                for reference in
                    rebalance_children(store, ledger, kind, meta, children, to_t, cfg).await?
                {
                    level.push(reference);
                }
            }
        }
    }

    let mut refs = acc.pop().expect("accumulator never empty");
    debug_assert!(acc.is_empty());

    let node = if refs.len() == 1 {
        refs.remove(0)
    } else {
        // The root split: wrap the pieces in a fresh top branch.
        let meta = BranchMeta {
            first: None,
            rhs: None,
            leftmost: true,
        };
        let mut wrapped =
            rebalance_children(store, ledger, kind, meta, refs, to_t, cfg).await?;
        if wrapped.len() == 1 {
            wrapped.remove(0)
        } else {
            write_wrapper(store, ledger, kind, wrapped, to_t).await?
        }
    };

    Ok((
        IndexRoot {
            kind,
            t: to_t,
            node,
        },
        garbage,
    ))
}

/// A node is untouched when no novelty lands in its range and no predicate
/// removal is in effect; its reference (and id) carry over unchanged.
fn untouched(
    kind: IndexKind,
    child: &ChildRef,
    novelty: &Novelty,
    remove_preds: &FxHashSet<Sid>,
    to_t: i64,
) -> bool {
    if !remove_preds.is_empty() || child.id.is_empty() {
        return false;
    }
    child_slice(kind, child, novelty)
        .iter()
        .all(|f| f.t > to_t)
}

fn child_slice<'a>(kind: IndexKind, child: &ChildRef, novelty: &'a Novelty) -> &'a [Flake] {
    let lower = if child.leftmost {
        None
    } else {
        child.first.as_ref().map(|f| (Test::Ge, f))
    };
    let upper = child.rhs.as_ref().map(|f| (Test::Lt, f));
    novelty.set(kind).between(lower, upper)
}

/// Integrate novelty into one leaf and split it by byte budget if needed.
fn integrate_leaf(
    kind: IndexKind,
    leaf: Leaf,
    novelty: &Novelty,
    remove_preds: &FxHashSet<Sid>,
    to_t: i64,
    cfg: &Config,
) -> Vec<Leaf> {
    let reference = leaf.to_ref();
    let adds: Vec<&Flake> = child_slice(kind, &reference, novelty)
        .iter()
        .filter(|f| f.t <= to_t)
        .collect();

    let mut flakes = leaf.flakes;
    flakes.insert_all(adds);
    if !remove_preds.is_empty() {
        let keep: Vec<Flake> = flakes
            .iter()
            .filter(|f| !remove_preds.contains(&f.p))
            .cloned()
            .collect();
        flakes = FlakeSet::from_unsorted(kind, keep);
    }

    split_leaf(kind, flakes, leaf.leftmost, leaf.first, leaf.rhs, to_t, cfg)
}

/// Cut an integrated run into leaves. Splitting walks in comparator order,
/// cutting whenever a piece would exceed half the overflow budget; the
/// first piece inherits `leftmost`, the last inherits the original rhs.
fn split_leaf(
    kind: IndexKind,
    flakes: FlakeSet,
    leftmost: bool,
    prior_first: Option<Flake>,
    rhs: Option<Flake>,
    to_t: i64,
    cfg: &Config,
) -> Vec<Leaf> {
    let total = flakes.size_bytes();
    if total <= cfg.overflow_bytes {
        let leaf = make_leaf(kind, flakes.into_vec(), leftmost, prior_first, rhs, to_t);
        return vec![leaf];
    }

    let budget = cfg.overflow_bytes / 2;
    let mut pieces: Vec<Vec<Flake>> = Vec::new();
    let mut current: Vec<Flake> = Vec::new();
    let mut current_bytes = 0u64;

    for f in flakes.into_vec() {
        let size = f.size();
        if !current.is_empty() && current_bytes + size > budget {
            pieces.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(f);
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    let count = pieces.len();
    let firsts: Vec<Option<Flake>> = pieces.iter().map(|piece| piece.first().cloned()).collect();

    pieces
        .into_iter()
        .enumerate()
        .map(|(at, piece)| {
            let piece_rhs = if at + 1 < count {
                firsts[at + 1].clone()
            } else {
                rhs.clone()
            };
            make_leaf(kind, piece, leftmost && at == 0, None, piece_rhs, to_t)
        })
        .collect()
}

fn make_leaf(
    kind: IndexKind,
    flakes: Vec<Flake>,
    leftmost: bool,
    prior_first: Option<Flake>,
    rhs: Option<Flake>,
    to_t: i64,
) -> Leaf {
    let flakes = FlakeSet::from_unsorted(kind, flakes);
    let t = flakes.iter().map(|f| f.t).max().unwrap_or(to_t);
    Leaf {
        id: NodeId::empty(),
        kind,
        // A leaf emptied by predicate removal keeps its prior lower bound
        // so the sibling partition stays intact.
        first: flakes.first().cloned().or(prior_first),
        rhs,
        leftmost,
        size: flakes.size_bytes(),
        t,
        flakes,
    }
}

/// Write rebuilt children under one or more branches. Fanout above
/// `overflow_children` regroups into chunks of half that size, re-marking
/// the leftmost child of the first chunk.
async fn rebalance_children(
    store: &dyn Store,
    ledger: &str,
    kind: IndexKind,
    meta: BranchMeta,
    mut children: Vec<ChildRef>,
    to_t: i64,
    cfg: &Config,
) -> Result<Vec<ChildRef>, Error> {
    // Exactly one leftmost child, and only under a leftmost branch.
    for (at, child) in children.iter_mut().enumerate() {
        child.leftmost = meta.leftmost && at == 0;
    }

    let chunk_size = if children.len() > cfg.overflow_children {
        cfg.overflow_children / 2
    } else {
        children.len().max(1)
    };

    let chunks: Vec<Vec<ChildRef>> = children
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect();
    let count = chunks.len();
    let firsts: Vec<Option<Flake>> = chunks
        .iter()
        .map(|chunk| chunk.first().and_then(|c| c.first.clone()))
        .collect();

    let mut out = Vec::with_capacity(count);
    for (at, chunk) in chunks.into_iter().enumerate() {
        let rhs = if at + 1 < count {
            firsts[at + 1].clone()
        } else {
            meta.rhs.clone()
        };
        let first = if at == 0 {
            meta.first.clone().or_else(|| firsts[0].clone())
        } else {
            firsts[at].clone()
        };
        let branch = Branch {
            id: NodeId::empty(),
            kind,
            first,
            rhs,
            leftmost: meta.leftmost && at == 0,
            t: chunk.iter().map(|c| c.t).max().unwrap_or(to_t),
            size: chunk.iter().map(|c| c.size).sum(),
            children: chunk,
        };
        let (reference, _) = write_branch(store, ledger, &branch).await?;
        out.push(reference);
    }
    Ok(out)
}

/// A top-level wrapper for a split root.
async fn write_wrapper(
    store: &dyn Store,
    ledger: &str,
    kind: IndexKind,
    children: Vec<ChildRef>,
    to_t: i64,
) -> Result<ChildRef, Error> {
    let branch = Branch {
        id: NodeId::empty(),
        kind,
        first: children.first().and_then(|c| c.first.clone()),
        rhs: None,
        leftmost: true,
        t: to_t,
        size: children.iter().map(|c| c.size).sum(),
        children,
    };
    let (reference, _) = write_branch(store, ledger, &branch).await?;
    Ok(reference)
}
