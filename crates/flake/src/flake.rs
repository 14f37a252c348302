use serde::{Deserialize, Serialize};

use crate::value::size_obj;
use crate::{dt, Sid, Value};

/// Per-flake metadata: the ordinal of a list item, and/or a language tag.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl Meta {
    pub fn list_index(i: u32) -> Self {
        Self {
            i: Some(i),
            lang: None,
        }
    }

    pub fn language(lang: impl Into<String>) -> Self {
        Self {
            i: None,
            lang: Some(lang.into()),
        }
    }

    pub fn size(&self) -> u64 {
        let i = if self.i.is_some() { 4 } else { 0 };
        let lang = self.lang.as_ref().map_or(0, |l| 2 * l.len() as u64);
        i + lang
    }
}

/// Flake is the atomic statement: subject, predicate, object, datatype,
/// transaction number, assert/retract operation, and optional metadata.
/// Statement identity is `(s, p, o, dt)`; `(t, op, m)` carry history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flake {
    pub s: Sid,
    pub p: Sid,
    pub o: Value,
    pub dt: Sid,
    pub t: i64,
    pub op: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Meta>,
}

impl Flake {
    pub fn new(s: Sid, p: Sid, o: Value, dt: Sid, t: i64, op: bool, m: Option<Meta>) -> Self {
        Self {
            s,
            p,
            o,
            dt,
            t,
            op,
            m,
        }
    }

    /// Invert assert <-> retract.
    pub fn flip(&self) -> Self {
        let mut next = self.clone();
        next.op = !next.op;
        next
    }

    /// Invert assert <-> retract, re-stamping the transaction number.
    pub fn flip_t(&self, t: i64) -> Self {
        let mut next = self.flip();
        next.t = t;
        next
    }

    /// Whether two flakes state the same `(s, p, o, dt)` fact, regardless
    /// of when or with what operation.
    pub fn same_statement(&self, other: &Self) -> bool {
        self.s == other.s && self.p == other.p && self.dt == other.dt && self.o == other.o
    }

    /// A reference edge: the object is another subject.
    pub fn is_ref(&self) -> bool {
        dt::is_any_uri(&self.dt)
    }

    /// On-disk size in bytes.
    pub fn size(&self) -> u64 {
        self.s.size()
            + self.p.size()
            + self.dt.size()
            + size_obj(&self.o, &self.dt)
            + 8 // t
            + 1 // op
            + self.m.as_ref().map_or(0, Meta::size)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codes;

    fn fixture() -> Flake {
        Flake::new(
            Sid::new(9, "alice"),
            Sid::new(10, "name"),
            Value::String("Alice".to_string()),
            dt::string(),
            1,
            true,
            None,
        )
    }

    #[test]
    fn test_flip_round_trips() {
        let f = fixture();
        assert!(!f.flip().op);
        assert_eq!(f.flip().flip(), f);

        let retract = f.flip_t(5);
        assert_eq!(retract.t, 5);
        assert!(f.same_statement(&retract));
    }

    #[test]
    fn test_size_accounting() {
        let f = fixture();
        // s: 4+5, p: 4+4, dt: 4+6 ("string" in xsd), o: 2*5, t: 8, op: 1
        let dt_size = 4 + "string".len() as u64;
        assert_eq!(f.size(), 9 + 8 + dt_size + 10 + 8 + 1);

        let with_meta = Flake {
            m: Some(Meta::list_index(2)),
            ..fixture()
        };
        assert_eq!(with_meta.size(), f.size() + 4);
    }

    #[test]
    fn test_ref_detection() {
        let mut f = fixture();
        assert!(!f.is_ref());
        f.o = Value::Sid(Sid::new(9, "bob"));
        f.dt = dt::any_uri();
        assert!(f.is_ref());
        assert_eq!(f.dt.namespace, codes::XSD);
    }
}
