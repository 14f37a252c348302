use serde::{Deserialize, Serialize};

use flake::{Flake, FlakeSet, IndexKind};

/// The in-memory overlay of flakes accumulated since the last index
/// refresh. Every new flake lands in all four sets (OPST admits only
/// reference edges); `size` is accounted from SPOT, which holds everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Novelty {
    pub spot: FlakeSet,
    pub post: FlakeSet,
    pub opst: FlakeSet,
    pub tspo: FlakeSet,
    pub size: u64,
}

impl Default for Novelty {
    fn default() -> Self {
        Self::new()
    }
}

impl Novelty {
    pub fn new() -> Self {
        Self {
            spot: FlakeSet::empty(IndexKind::Spot),
            post: FlakeSet::empty(IndexKind::Post),
            opst: FlakeSet::empty(IndexKind::Opst),
            tspo: FlakeSet::empty(IndexKind::Tspo),
            size: 0,
        }
    }

    pub fn set(&self, kind: IndexKind) -> &FlakeSet {
        match kind {
            IndexKind::Spot => &self.spot,
            IndexKind::Post => &self.post,
            IndexKind::Opst => &self.opst,
            IndexKind::Tspo => &self.tspo,
        }
    }

    pub fn len(&self) -> usize {
        self.spot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spot.is_empty()
    }

    /// Fold a batch of added and removed flakes into a successor overlay.
    /// The receiver is unchanged; snapshots share structure by cloning.
    pub fn update<'a>(
        &self,
        adds: impl IntoIterator<Item = &'a Flake> + Clone,
        removes: impl IntoIterator<Item = &'a Flake> + Clone,
    ) -> Self {
        let mut next = self.clone();
        for set in [
            &mut next.spot,
            &mut next.post,
            &mut next.opst,
            &mut next.tspo,
        ] {
            set.remove_all(removes.clone());
            set.insert_all(adds.clone());
        }
        next.size = next.spot.size_bytes();
        next
    }

    /// Drop flakes at or below `through_t` (all of them when `None`),
    /// marking them flushed into the persistent tree.
    pub fn emptied(&self, through_t: Option<i64>) -> Self {
        let mut next = Self::new();
        if let Some(t) = through_t {
            let retained: Vec<&Flake> = self.spot.iter().filter(|f| f.t > t).collect();
            if !retained.is_empty() {
                next = next.update(retained, std::iter::empty());
            }
        }
        next
    }

    /// The highest transaction currently buffered.
    pub fn max_t(&self) -> Option<i64> {
        self.tspo.last().map(|f| f.t)
    }

    /// The lowest transaction currently buffered.
    pub fn min_t(&self) -> Option<i64> {
        self.tspo.first().map(|f| f.t)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flake::{dt, Sid, Value};

    fn flake(s: &str, o: i64, t: i64) -> Flake {
        Flake::new(
            Sid::new(9, s),
            Sid::new(10, "p"),
            Value::Long(o),
            dt::long(),
            t,
            true,
            None,
        )
    }

    fn ref_flake(s: &str, o: &str, t: i64) -> Flake {
        Flake::new(
            Sid::new(9, s),
            Sid::new(10, "knows"),
            Value::Sid(Sid::new(9, o)),
            dt::any_uri(),
            t,
            true,
            None,
        )
    }

    #[test]
    fn test_update_tracks_size_from_spot() {
        let novelty = Novelty::new().update([&flake("a", 1, 1), &flake("b", 2, 1)], []);
        assert_eq!(novelty.len(), 2);
        assert_eq!(novelty.size, novelty.spot.size_bytes());
        assert!(novelty.size > 0);

        let emptier = novelty.update([], [&flake("a", 1, 1)]);
        assert_eq!(emptier.len(), 1);
        assert!(emptier.size < novelty.size);
    }

    #[test]
    fn test_opst_holds_only_refs() {
        let novelty = Novelty::new().update([&flake("a", 1, 1), &ref_flake("a", "b", 1)], []);
        assert_eq!(novelty.spot.len(), 2);
        assert_eq!(novelty.post.len(), 2);
        assert_eq!(novelty.tspo.len(), 2);
        assert_eq!(novelty.opst.len(), 1);
    }

    #[test]
    fn test_emptied_through_t() {
        let novelty = Novelty::new().update(
            [&flake("a", 1, 1), &flake("b", 2, 2), &flake("c", 3, 3)],
            [],
        );

        let partial = novelty.emptied(Some(2));
        assert_eq!(partial.len(), 1);
        assert_eq!(partial.min_t(), Some(3));

        let full = novelty.emptied(None);
        assert!(full.is_empty());
        assert_eq!(full.size, 0);
    }
}
