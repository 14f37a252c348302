use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::{compare_obj, Flake};

/// The comparator families. Each index holds every flake (OPST holds only
/// reference edges) sorted under its own lexicographic composition, giving
/// the matcher a covering index for whichever components a pattern binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Spot,
    Post,
    Opst,
    Tspo,
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Spot,
        IndexKind::Post,
        IndexKind::Opst,
        IndexKind::Tspo,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::Spot => "spot",
            IndexKind::Post => "post",
            IndexKind::Opst => "opst",
            IndexKind::Tspo => "tspo",
        }
    }

    /// Total order over flakes for this index.
    pub fn cmp(&self, l: &Flake, r: &Flake) -> Ordering {
        match self {
            IndexKind::Spot => l
                .s
                .cmp(&r.s)
                .then_with(|| l.p.cmp(&r.p))
                .then_with(|| cmp_o(l, r))
                .then_with(|| l.t.cmp(&r.t))
                .then_with(|| l.op.cmp(&r.op))
                .then_with(|| l.m.cmp(&r.m)),
            IndexKind::Post => l
                .p
                .cmp(&r.p)
                .then_with(|| cmp_o(l, r))
                .then_with(|| l.s.cmp(&r.s))
                .then_with(|| l.t.cmp(&r.t))
                .then_with(|| l.op.cmp(&r.op))
                .then_with(|| l.m.cmp(&r.m)),
            IndexKind::Opst => cmp_o(l, r)
                .then_with(|| l.p.cmp(&r.p))
                .then_with(|| l.s.cmp(&r.s))
                .then_with(|| l.t.cmp(&r.t))
                .then_with(|| l.op.cmp(&r.op))
                .then_with(|| l.m.cmp(&r.m)),
            IndexKind::Tspo => l
                .t
                .cmp(&r.t)
                .then_with(|| l.s.cmp(&r.s))
                .then_with(|| l.p.cmp(&r.p))
                .then_with(|| cmp_o(l, r))
                .then_with(|| l.op.cmp(&r.op))
                .then_with(|| l.m.cmp(&r.m)),
        }
    }

    /// Whether this index holds the flake at all.
    pub fn admits(&self, f: &Flake) -> bool {
        match self {
            IndexKind::Opst => f.is_ref(),
            _ => true,
        }
    }
}

fn cmp_o(l: &Flake, r: &Flake) -> Ordering {
    compare_obj(&l.o, &l.dt, &r.o, &r.dt)
}
