use query::{Pattern, Term, TriplePattern};
use serde_json::Value as Json;

use crate::Error;

/// A deletion template, instantiated once per where-clause solution.
#[derive(Debug, Clone)]
pub struct TripleTemplate {
    pub s: Term,
    pub p: Term,
    pub o: Term,
}

/// A staged transaction: a plain JSON-LD insertion, or a modify form with
/// delete templates bound by a where clause.
#[derive(Debug, Clone)]
pub enum Txn {
    Insert(serde_json::Value),
    Modify {
        insert: Option<serde_json::Value>,
        delete: Vec<TripleTemplate>,
        clauses: Vec<Pattern>,
    },
}

impl Txn {
    pub fn insert(nodes: serde_json::Value) -> Self {
        Txn::Insert(nodes)
    }

    pub fn delete(delete: Vec<TripleTemplate>, clauses: Vec<Pattern>) -> Self {
        Txn::Modify {
            insert: None,
            delete,
            clauses,
        }
    }

    /// Parse the JSON transaction form. A bare node (or array of nodes)
    /// stages as a pure insertion; an object carrying any of `insert`,
    /// `delete`, or `where` builds the modify form, with triples written
    /// as three-element arrays and `?name` strings as variables.
    pub fn from_json(txn: &Json) -> Result<Txn, Error> {
        let object = match txn {
            Json::Object(object) => object,
            Json::Array(_) => return Ok(Txn::Insert(txn.clone())),
            other => {
                return Err(Error::MalformedTxn(format!(
                    "expected a transaction document, got {other}"
                )))
            }
        };

        let modify = ["insert", "delete", "where"]
            .iter()
            .any(|key| object.contains_key(*key));
        if !modify {
            return Ok(Txn::Insert(txn.clone()));
        }

        let delete = match object.get("delete") {
            None => Vec::new(),
            Some(Json::Array(triples)) => triples
                .iter()
                .map(parse_template)
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(Error::MalformedTxn(format!(
                    "'delete' must be an array of triples, got {other}"
                )))
            }
        };
        let clauses = match object.get("where") {
            None => Vec::new(),
            Some(Json::Array(triples)) => triples
                .iter()
                .map(parse_where)
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(Error::MalformedTxn(format!(
                    "'where' must be an array of triples, got {other}"
                )))
            }
        };

        Ok(Txn::Modify {
            insert: object.get("insert").cloned(),
            delete,
            clauses,
        })
    }
}

fn parse_template(triple: &Json) -> Result<TripleTemplate, Error> {
    let (s, p, o) = parse_triple(triple)?;
    Ok(TripleTemplate { s, p, o })
}

fn parse_where(triple: &Json) -> Result<Pattern, Error> {
    let (s, p, o) = parse_triple(triple)?;
    Ok(Pattern::Tuple(TriplePattern { s, p, o }))
}

fn parse_triple(triple: &Json) -> Result<(Term, Term, Term), Error> {
    match triple {
        Json::Array(parts) if parts.len() == 3 => Ok((
            parse_term(&parts[0]),
            parse_term(&parts[1]),
            parse_term(&parts[2]),
        )),
        other => Err(Error::MalformedTxn(format!(
            "a triple is a three-element array, got {other}"
        ))),
    }
}

/// `?name` is a variable and any other bare string an IRI, as in expanded
/// JSON-LD; a string literal in object position is written `{"@value": …}`.
fn parse_term(part: &Json) -> Term {
    match part {
        Json::String(text) if text.starts_with('?') => Term::Var(text.clone()),
        Json::String(text) => Term::Iri(text.clone()),
        Json::Object(object) => {
            if let Some(iri) = object.get("@id").and_then(Json::as_str) {
                Term::Iri(iri.to_string())
            } else if let Some(value) = object.get("@value") {
                Term::Value(value.clone())
            } else {
                Term::Value(part.clone())
            }
        }
        other => Term::Value(other.clone()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_node_is_an_insert() {
        let txn = Txn::from_json(&json!({"@id": "http://x.example/a"})).unwrap();
        assert!(matches!(txn, Txn::Insert(_)));
    }

    #[test]
    fn test_modify_form_parses_triples() {
        let txn = Txn::from_json(&json!({
            "delete": [["?s", "http://schema.org/name", {"@value": "Alice"}]],
            "where": [["?s", "http://schema.org/name", {"@value": "Alice"}]]
        }))
        .unwrap();
        match txn {
            Txn::Modify {
                insert,
                delete,
                clauses,
            } => {
                assert!(insert.is_none());
                assert_eq!(delete.len(), 1);
                assert!(matches!(delete[0].s, Term::Var(_)));
                assert!(matches!(delete[0].p, Term::Iri(_)));
                assert_eq!(clauses.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_triples_rejected() {
        assert!(Txn::from_json(&json!({"delete": [["?s", "p"]]})).is_err());
        assert!(Txn::from_json(&json!({"delete": "nope"})).is_err());
        assert!(Txn::from_json(&json!(42)).is_err());
    }
}
