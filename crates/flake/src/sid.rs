use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::Error;

/// Namespace codes reserved at bootstrap. Codes never recycle, so these are
/// stable across every database ever created with this seed.
pub mod codes {
    /// IRIs with no recognizable namespace delimiter.
    pub const EMPTY: u32 = 0;
    pub const RDF: u32 = 1;
    pub const RDFS: u32 = 2;
    pub const XSD: u32 = 3;
    pub const SHACL: u32 = 4;
    /// The ledger-internal vocabulary (commit metadata, policies).
    pub const LEDGER: u32 = 5;
    pub const DID: u32 = 6;
    /// Blank node identifiers, `_:` prefixed.
    pub const BLANK: u32 = 7;
}

pub const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub const RDFS_NS: &str = "http://www.w3.org/2000/01/rdf-schema#";
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema#";
pub const SHACL_NS: &str = "http://www.w3.org/ns/shacl#";
pub const LEDGER_NS: &str = "https://ns.flur.ee/ledger#";

const SEED: &[(u32, &str)] = &[
    (codes::EMPTY, ""),
    (codes::RDF, RDF_NS),
    (codes::RDFS, RDFS_NS),
    (codes::XSD, XSD_NS),
    (codes::SHACL, SHACL_NS),
    (codes::LEDGER, LEDGER_NS),
    (codes::DID, "did:"),
    (codes::BLANK, "_:"),
];

/// Sid is the compact form of an IRI: a namespace code plus the local name.
/// Sids order by (namespace, name), which gives every comparator family a
/// cheap, stable subject ordering without touching the namespace table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sid {
    pub namespace: u32,
    pub name: String,
}

impl Sid {
    pub fn new(namespace: u32, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// On-disk size: four bytes of namespace code plus the utf-8 name.
    pub fn size(&self) -> u64 {
        4 + self.name.len() as u64
    }

    pub fn is_blank(&self) -> bool {
        self.namespace == codes::BLANK
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Split an IRI into (namespace, local name) after the last `#`, `/`, or `:`.
pub fn split_iri(iri: &str) -> (&str, &str) {
    match iri.rfind(['#', '/', ':']) {
        Some(at) => iri.split_at(at + 1),
        None => ("", iri),
    }
}

/// The per-database IRI <-> Sid mapping. Append-only: new namespaces are
/// assigned monotonically increasing codes and codes are never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespaces {
    prefixes: BTreeMap<String, u32>,
    codes: BTreeMap<u32, String>,
    max_code: u32,
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::bootstrap()
    }
}

impl Namespaces {
    pub fn bootstrap() -> Self {
        let mut prefixes = BTreeMap::new();
        let mut codes = BTreeMap::new();
        for (code, prefix) in SEED {
            prefixes.insert((*prefix).to_string(), *code);
            codes.insert(*code, (*prefix).to_string());
        }
        Self {
            prefixes,
            codes,
            max_code: SEED.iter().map(|(c, _)| *c).max().unwrap_or(0),
        }
    }

    pub fn max_code(&self) -> u32 {
        self.max_code
    }

    pub fn code_of(&self, prefix: &str) -> Option<u32> {
        self.prefixes.get(prefix).copied()
    }

    pub fn prefix_of(&self, code: u32) -> Option<&str> {
        self.codes.get(&code).map(String::as_str)
    }

    /// Encode an IRI, allocating a fresh namespace code if needed.
    pub fn encode_iri(&mut self, iri: &str) -> Sid {
        let (prefix, name) = split_iri(iri);
        match self.prefixes.get(prefix) {
            Some(code) => Sid::new(*code, name),
            None => {
                self.max_code += 1;
                self.prefixes.insert(prefix.to_string(), self.max_code);
                self.codes.insert(self.max_code, prefix.to_string());
                Sid::new(self.max_code, name)
            }
        }
    }

    /// Encode an IRI in strict mode: retractions must reference namespaces
    /// that already exist, as a retract of a never-seen IRI is meaningless.
    pub fn try_encode_iri(&self, iri: &str) -> Result<Sid, Error> {
        let (prefix, name) = split_iri(iri);
        match self.prefixes.get(prefix) {
            Some(code) => Ok(Sid::new(*code, name)),
            None => Err(Error::UnknownNamespace(iri.to_string())),
        }
    }

    pub fn decode_sid(&self, sid: &Sid) -> Result<String, Error> {
        match self.codes.get(&sid.namespace) {
            Some(prefix) => Ok(format!("{prefix}{}", sid.name)),
            None => Err(Error::UnknownNamespaceCode(sid.namespace)),
        }
    }

    /// Extend with the namespaces of `iris`, assigning codes in sorted order
    /// so that two databases folding the same commit agree on every code.
    pub fn with_iris<'a>(&self, iris: impl IntoIterator<Item = &'a str>) -> Self {
        let mut novel: Vec<&str> = iris
            .into_iter()
            .map(|iri| split_iri(iri).0)
            .filter(|prefix| !self.prefixes.contains_key(*prefix))
            .collect();
        novel.sort_unstable();
        novel.dedup();

        if novel.is_empty() {
            return self.clone();
        }
        let mut next = self.clone();
        for prefix in novel {
            next.max_code += 1;
            next.prefixes.insert(prefix.to_string(), next.max_code);
            next.codes.insert(next.max_code, prefix.to_string());
        }
        next
    }

    /// All non-seed namespace prefixes in code order, for inclusion in
    /// commit data documents. Replaying this list through
    /// `with_prefixes_in_order` reproduces the exact code assignment.
    pub fn novel_prefixes(&self) -> Vec<String> {
        let seed_max = SEED.iter().map(|(c, _)| *c).max().unwrap_or(0);
        self.codes
            .iter()
            .filter(|(code, _)| **code > seed_max)
            .map(|(_, prefix)| prefix.clone())
            .collect()
    }

    /// Append prefixes one at a time in the given order, skipping ones
    /// already present. Used when loading a ledger from its persisted
    /// namespace list, where order carries the code assignment.
    pub fn with_prefixes_in_order<'a>(&self, prefixes: impl IntoIterator<Item = &'a str>) -> Self {
        let mut next = self.clone();
        for prefix in prefixes {
            if next.prefixes.contains_key(prefix) {
                continue;
            }
            next.max_code += 1;
            next.prefixes.insert(prefix.to_string(), next.max_code);
            next.codes.insert(next.max_code, prefix.to_string());
        }
        next
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_iri_round_trip() {
        let mut ns = Namespaces::bootstrap();

        for iri in [
            "http://example.org/ns#alice",
            "http://schema.org/name",
            "did:key:z6Mkt",
            "_:b0",
            "urn:isbn:0451450523",
            "bareword",
        ] {
            let sid = ns.encode_iri(iri);
            assert_eq!(ns.decode_sid(&sid).unwrap(), iri, "round trip of {iri}");
        }
    }

    #[test]
    fn test_codes_are_stable_and_monotone() {
        let mut ns = Namespaces::bootstrap();
        let seed_max = ns.max_code();

        let a = ns.encode_iri("http://example.org/ns#a");
        let b = ns.encode_iri("http://example.org/ns#b");
        let c = ns.encode_iri("http://other.org/x");

        assert_eq!(a.namespace, seed_max + 1);
        assert_eq!(b.namespace, a.namespace);
        assert_eq!(c.namespace, seed_max + 2);
    }

    #[test]
    fn test_with_iris_assigns_sorted() {
        let ns = Namespaces::bootstrap();
        let next = ns.with_iris(["http://zzz.example/b", "http://aaa.example/a"]);

        let aaa = next.code_of("http://aaa.example/").unwrap();
        let zzz = next.code_of("http://zzz.example/").unwrap();
        assert!(aaa < zzz);
        // The source map is untouched.
        assert_eq!(ns.code_of("http://aaa.example/"), None);
    }

    #[test]
    fn test_strict_mode_rejects_unknown() {
        let ns = Namespaces::bootstrap();
        let err = ns.try_encode_iri("http://nowhere.example/x").unwrap_err();
        assert!(matches!(err, Error::UnknownNamespace(_)));
    }
}
