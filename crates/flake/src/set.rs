use itertools::{EitherOrBoth, Itertools};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::{Flake, IndexKind};

/// A subrange test against a probe flake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Test {
    Ge,
    Gt,
    Le,
    Lt,
}

impl Test {
    pub fn matches(&self, ord: Ordering) -> bool {
        match self {
            Test::Ge => ord != Ordering::Less,
            Test::Gt => ord == Ordering::Greater,
            Test::Le => ord != Ordering::Greater,
            Test::Lt => ord == Ordering::Less,
        }
    }

    pub fn is_lower(&self) -> bool {
        matches!(self, Test::Ge | Test::Gt)
    }
}

/// FlakeSet is a comparator-carrying sorted run of flakes. Mutation is
/// batched: adds and removes merge in a single pass, the way a sorted
/// memtable folds its queued entries, rather than element at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakeSet {
    kind: IndexKind,
    items: Vec<Flake>,
}

impl FlakeSet {
    pub fn empty(kind: IndexKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
        }
    }

    pub fn from_unsorted(kind: IndexKind, mut items: Vec<Flake>) -> Self {
        items.sort_by(|l, r| kind.cmp(l, r));
        items.dedup_by(|l, r| kind.cmp(l, r) == Ordering::Equal);
        Self { kind, items }
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Flake> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Flake] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<Flake> {
        self.items
    }

    pub fn first(&self) -> Option<&Flake> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&Flake> {
        self.items.last()
    }

    /// Sum of member sizes.
    pub fn size_bytes(&self) -> u64 {
        self.items.iter().map(Flake::size).sum()
    }

    pub fn contains(&self, f: &Flake) -> bool {
        self.items
            .binary_search_by(|probe| self.kind.cmp(probe, f))
            .is_ok()
    }

    /// Merge a batch of flakes in, keeping order and uniqueness. Flakes the
    /// index does not admit (non-refs for OPST) are skipped.
    pub fn insert_all<'a>(&mut self, adds: impl IntoIterator<Item = &'a Flake>) {
        let mut adds: Vec<Flake> = adds
            .into_iter()
            .filter(|f| self.kind.admits(f))
            .cloned()
            .collect();
        if adds.is_empty() {
            return;
        }
        adds.sort_by(|l, r| self.kind.cmp(l, r));
        adds.dedup_by(|l, r| self.kind.cmp(l, r) == Ordering::Equal);

        let kind = self.kind;
        self.items = std::mem::take(&mut self.items)
            .into_iter()
            .merge_join_by(adds, |l, r| kind.cmp(l, r))
            .map(|eob| match eob {
                EitherOrBoth::Left(kept) => kept,
                // Incoming wins; identical under the comparator.
                EitherOrBoth::Right(added) | EitherOrBoth::Both(_, added) => added,
            })
            .collect();
    }

    /// Remove every member comparing equal to a flake of the batch.
    pub fn remove_all<'a>(&mut self, removes: impl IntoIterator<Item = &'a Flake>) {
        let mut removes: Vec<&Flake> = removes.into_iter().collect();
        if removes.is_empty() {
            return;
        }
        removes.sort_by(|l, r| self.kind.cmp(l, r));

        let kind = self.kind;
        self.items.retain(|f| {
            removes
                .binary_search_by(|probe| kind.cmp(probe, f))
                .is_err()
        });
    }

    /// One-sided subrange: all members satisfying `test` against `probe`.
    pub fn subrange(&self, test: Test, probe: &Flake) -> &[Flake] {
        if test.is_lower() {
            &self.items[self.lower_bound(test, probe)..]
        } else {
            &self.items[..self.upper_bound(test, probe)]
        }
    }

    /// Two-sided subrange between the given bounds.
    pub fn between(
        &self,
        lower: Option<(Test, &Flake)>,
        upper: Option<(Test, &Flake)>,
    ) -> &[Flake] {
        let lo = match lower {
            Some((test, probe)) => self.lower_bound(test, probe),
            None => 0,
        };
        let hi = match upper {
            Some((test, probe)) => self.upper_bound(test, probe),
            None => self.items.len(),
        };
        if lo >= hi {
            &[]
        } else {
            &self.items[lo..hi]
        }
    }

    /// The member nearest `probe` that satisfies `test`: the smallest such
    /// member for lower-bound tests, the largest for upper-bound tests.
    pub fn nearest(&self, test: Test, probe: &Flake) -> Option<&Flake> {
        if test.is_lower() {
            self.items.get(self.lower_bound(test, probe))
        } else {
            let hi = self.upper_bound(test, probe);
            (hi > 0).then(|| &self.items[hi - 1])
        }
    }

    /// Split around a key: members below it, the member equal to it, and
    /// members above it.
    pub fn split_key(&self, probe: &Flake) -> (&[Flake], Option<&Flake>, &[Flake]) {
        let lo = self.lower_bound(Test::Ge, probe);
        let hi = self.lower_bound(Test::Gt, probe);
        let equal = (lo < hi).then(|| &self.items[lo]);
        (&self.items[..lo], equal, &self.items[hi..])
    }

    fn lower_bound(&self, test: Test, probe: &Flake) -> usize {
        self.items
            .partition_point(|f| !test.matches(self.kind.cmp(f, probe)))
    }

    fn upper_bound(&self, test: Test, probe: &Flake) -> usize {
        self.items
            .partition_point(|f| test.matches(self.kind.cmp(f, probe)))
    }
}
