use futures::stream::BoxStream;
use futures::TryStreamExt;
use itertools::{EitherOrBoth, Itertools};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use flake::{Flake, IndexKind, Test};
use store::Store;

use crate::node::{resolve_cached, ChildRef, IndexRoot, Node, NodeCache};
use crate::{Error, Fuel, Novelty};

/// A per-flake predicate applied inside the range walk (object filters,
/// policy visibility, and the like).
pub type FlakeFilter = Arc<dyn Fn(&Flake) -> bool + Send + Sync>;

/// Comparator-space bounds of a range walk.
#[derive(Debug, Clone, Default)]
pub struct RangeBounds {
    pub lower: Option<(Test, Flake)>,
    pub upper: Option<(Test, Flake)>,
}

impl RangeBounds {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn starting(test: Test, probe: Flake) -> Self {
        Self {
            lower: Some((test, probe)),
            upper: None,
        }
    }

    pub fn between(lower: (Test, Flake), upper: (Test, Flake)) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
        }
    }
}

#[derive(Clone, Default)]
pub struct RangeOpts {
    /// Lowest transaction included; only meaningful with `history`.
    pub from_t: i64,
    /// Snapshot cap: flakes above this transaction do not exist yet.
    pub to_t: i64,
    /// When set, emit the full assert/retract history instead of the
    /// collapsed live view.
    pub history: bool,
    pub fuel: Option<Fuel>,
    pub filter: Option<FlakeFilter>,
    /// Memo of resolved nodes shared across walks of the same trees.
    pub cache: Option<Arc<NodeCache>>,
}

impl RangeOpts {
    pub fn live(to_t: i64) -> Self {
        Self {
            to_t,
            ..Self::default()
        }
    }

    pub fn history(from_t: i64, to_t: i64) -> Self {
        Self {
            from_t,
            to_t,
            history: true,
            ..Self::default()
        }
    }
}

struct Walk {
    store: Arc<dyn Store>,
    kind: IndexKind,
    novelty: Arc<Novelty>,
    bounds: RangeBounds,
    opts: RangeOpts,
    /// Children yet to visit; a branch's children are pushed in reverse so
    /// the leftmost is processed first.
    stack: Vec<ChildRef>,
    pending: VecDeque<Flake>,
    /// Live-view collapse carries the newest flake of the current
    /// statement group across leaf boundaries.
    carry: Option<Flake>,
}

/// Stream the flakes of one index, in comparator order, between `bounds`.
/// Branches resolve on demand from the store; each leaf is unioned with
/// the matching novelty subrange; fuel is charged per flake scanned.
pub fn index_range(
    store: Arc<dyn Store>,
    root: IndexRoot,
    novelty: Arc<Novelty>,
    bounds: RangeBounds,
    opts: RangeOpts,
) -> BoxStream<'static, Result<Flake, Error>> {
    let kind = root.kind;
    let walk = Walk {
        store,
        kind,
        novelty,
        bounds,
        opts,
        stack: vec![root.node],
        pending: VecDeque::new(),
        carry: None,
    };

    Box::pin(futures::stream::try_unfold(walk, |mut walk| async move {
        loop {
            if let Some(f) = walk.pending.pop_front() {
                return Ok(Some((f, walk)));
            }
            let child = match walk.stack.pop() {
                Some(child) => child,
                None => {
                    // End of the tree: flush the trailing collapse group.
                    match walk.carry.take() {
                        Some(f) if f.op => return Ok(Some((f, walk))),
                        _ => return Ok(None),
                    }
                }
            };
            if !intersects(walk.kind, &walk.bounds, &child) {
                continue;
            }
            let node = resolve_cached(
                walk.store.as_ref(),
                walk.opts.cache.as_deref(),
                walk.kind,
                &child,
            )
            .await?;
            match node.as_ref() {
                Node::Branch(branch) => {
                    for child in branch.children.iter().rev() {
                        if intersects(walk.kind, &walk.bounds, child) {
                            walk.stack.push(child.clone());
                        }
                    }
                }
                Node::Leaf(leaf) => {
                    let run = walk.leaf_run(leaf)?;
                    walk.absorb(run);
                }
            }
        }
    }))
}

/// Collect an entire range; the streaming form is preferred, this is a
/// convenience for callers that want the whole run anyway.
pub async fn collect_range(
    store: Arc<dyn Store>,
    root: IndexRoot,
    novelty: Arc<Novelty>,
    bounds: RangeBounds,
    opts: RangeOpts,
) -> Result<Vec<Flake>, Error> {
    index_range(store, root, novelty, bounds, opts)
        .try_collect()
        .await
}

impl Walk {
    /// Merge a resolved leaf with its novelty subrange, clipped to the walk
    /// bounds and the transaction window.
    fn leaf_run(&self, leaf: &crate::node::Leaf) -> Result<Vec<Flake>, Error> {
        let (leaf_lower, leaf_upper) = leaf_bounds(leaf);

        let lower = tighter_lower(
            self.kind,
            self.bounds.lower.clone(),
            leaf_lower,
        );
        let upper = tighter_upper(
            self.kind,
            self.bounds.upper.clone(),
            leaf_upper,
        );

        let stored = leaf.flakes.between(
            self.bounds.lower.as_ref().map(|(t, f)| (*t, f)),
            self.bounds.upper.as_ref().map(|(t, f)| (*t, f)),
        );
        let overlay = self.novelty.set(self.kind).between(
            lower.as_ref().map(|(t, f)| (*t, f)),
            upper.as_ref().map(|(t, f)| (*t, f)),
        );

        if let Some(fuel) = &self.opts.fuel {
            fuel.consume((stored.len() + overlay.len()) as i64)?;
        }

        let merged = merge_runs(self.kind, stored, overlay);
        let from_t = if self.opts.history { self.opts.from_t } else { 0 };
        Ok(merged
            .into_iter()
            .filter(|f| f.t >= from_t && f.t <= self.opts.to_t)
            .filter(|f| match &self.opts.filter {
                Some(filter) => filter(f),
                None => true,
            })
            .collect())
    }

    /// Fold a leaf's run into the pending queue: verbatim for history
    /// reads, collapsed to the live view otherwise.
    fn absorb(&mut self, run: Vec<Flake>) {
        if self.opts.history {
            self.pending.extend(run);
            return;
        }
        for f in run {
            match self.carry.take() {
                None => self.carry = Some(f),
                Some(prev) if prev.same_statement(&f) => {
                    // A later operation on the same statement supersedes.
                    self.carry = Some(f);
                }
                Some(prev) => {
                    if prev.op {
                        self.pending.push_back(prev);
                    }
                    self.carry = Some(f);
                }
            }
        }
    }
}

fn leaf_bounds(leaf: &crate::node::Leaf) -> (Option<(Test, Flake)>, Option<(Test, Flake)>) {
    let lower = if leaf.leftmost {
        None
    } else {
        leaf.first.clone().map(|f| (Test::Ge, f))
    };
    let upper = leaf.rhs.clone().map(|f| (Test::Lt, f));
    (lower, upper)
}

fn tighter_lower(
    kind: IndexKind,
    a: Option<(Test, Flake)>,
    b: Option<(Test, Flake)>,
) -> Option<(Test, Flake)> {
    match (a, b) {
        (Some(a), Some(b)) => match kind.cmp(&a.1, &b.1) {
            Ordering::Greater => Some(a),
            Ordering::Less => Some(b),
            Ordering::Equal => {
                if a.0 == Test::Gt {
                    Some(a)
                } else {
                    Some(b)
                }
            }
        },
        (a, b) => a.or(b),
    }
}

fn tighter_upper(
    kind: IndexKind,
    a: Option<(Test, Flake)>,
    b: Option<(Test, Flake)>,
) -> Option<(Test, Flake)> {
    match (a, b) {
        (Some(a), Some(b)) => match kind.cmp(&a.1, &b.1) {
            Ordering::Less => Some(a),
            Ordering::Greater => Some(b),
            Ordering::Equal => {
                if a.0 == Test::Lt {
                    Some(a)
                } else {
                    Some(b)
                }
            }
        },
        (a, b) => a.or(b),
    }
}

fn merge_runs(kind: IndexKind, stored: &[Flake], overlay: &[Flake]) -> Vec<Flake> {
    stored
        .iter()
        .merge_join_by(overlay, |l, r| kind.cmp(l, r))
        .map(|eob| match eob {
            EitherOrBoth::Left(stored) => stored.clone(),
            // The overlay is newer than anything persisted.
            EitherOrBoth::Right(novel) | EitherOrBoth::Both(_, novel) => novel.clone(),
        })
        .collect()
}

/// Whether a child's key range can hold any flake inside `bounds`.
fn intersects(kind: IndexKind, bounds: &RangeBounds, child: &ChildRef) -> bool {
    if let Some((test, up)) = &bounds.upper {
        if !child.leftmost {
            if let Some(first) = &child.first {
                match kind.cmp(first, up) {
                    Ordering::Greater => return false,
                    Ordering::Equal if *test == Test::Lt => return false,
                    _ => (),
                }
            }
        }
    }
    if let Some((_, lo)) = &bounds.lower {
        if let Some(rhs) = &child.rhs {
            // The child covers [first, rhs): nothing at or above rhs.
            if kind.cmp(rhs, lo) != Ordering::Greater {
                return false;
            }
        }
    }
    true
}
