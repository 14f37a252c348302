use fxhash::FxHashMap;
use serde_json::Value as Json;

use db::Db;
use flake::{coerce, codes, dt, Flake, Meta, Namespaces, Sid, Value};

use crate::commit::DataDoc;
use crate::Error;

/// The outcome of translating a data document: the transaction's flakes
/// and the namespace table extended with any newly seen prefixes.
#[derive(Debug)]
pub struct Assembled {
    pub flakes: Vec<Flake>,
    pub namespaces: Namespaces,
}

/// Translate an inbound data document into flakes against `db`. The
/// document's `t` must directly follow the snapshot; retractions resolve
/// identifiers strictly, as retracting a never-seen name is meaningless.
pub fn assemble_data(
    db: &Db,
    data: &DataDoc,
    datatype_hints: &FxHashMap<Sid, Sid>,
) -> Result<Assembled, Error> {
    if data.t != db.t + 1 {
        return Err(Error::InvalidCommit(format!(
            "data document t {} does not follow database t {}",
            data.t, db.t
        )));
    }

    let mut ctx = AssembleCtx {
        namespaces: db.namespaces.with_prefixes_in_order(data.namespaces.iter().map(String::as_str)),
        datatype_hints,
        t: data.t,
        flakes: Vec::new(),
        next_blank: 0,
    };

    for node in &data.assert {
        ctx.node(node, true)?;
    }
    for node in &data.retract {
        ctx.node(node, false)?;
    }

    if ctx.flakes.is_empty() {
        return Err(Error::EmptyCommit);
    }
    Ok(Assembled {
        flakes: ctx.flakes,
        namespaces: ctx.namespaces,
    })
}

struct AssembleCtx<'a> {
    namespaces: Namespaces,
    datatype_hints: &'a FxHashMap<Sid, Sid>,
    t: i64,
    flakes: Vec<Flake>,
    next_blank: u32,
}

impl AssembleCtx<'_> {
    fn encode(&mut self, iri: &str, op: bool) -> Result<Sid, Error> {
        if op {
            Ok(self.namespaces.encode_iri(iri))
        } else {
            Ok(self.namespaces.try_encode_iri(iri)?)
        }
    }

    fn fresh_blank(&mut self) -> Sid {
        self.next_blank += 1;
        Sid::new(codes::BLANK, format!("b{}", self.next_blank))
    }

    /// Emit the flakes of one node object, returning its subject id.
    fn node(&mut self, node: &Json, op: bool) -> Result<Sid, Error> {
        let object = match node {
            Json::Object(object) => object,
            Json::Array(nodes) => {
                let mut last = None;
                for node in nodes {
                    last = Some(self.node(node, op)?);
                }
                return last.ok_or(Error::EmptyCommit);
            }
            other => {
                return Err(Error::InvalidCommit(format!(
                    "expected a node object, got {other}"
                )))
            }
        };

        let sid = match object.get("@id").and_then(Json::as_str) {
            Some(id) => self.encode(id, op)?,
            None => self.fresh_blank(),
        };

        for class in strings_of(object.get("@type")) {
            let class_sid = self.encode(&class, op)?;
            self.flakes.push(Flake::new(
                sid.clone(),
                dt::rdf_type(),
                Value::Sid(class_sid),
                dt::any_uri(),
                self.t,
                op,
                None,
            ));
        }

        for (key, value) in object {
            if key.starts_with('@') {
                continue;
            }
            let pid = self.encode(key, op)?;
            let required = self.datatype_hints.get(&pid).cloned();
            self.values(&sid, &pid, value, required.as_ref(), None, op)?;
        }

        Ok(sid)
    }

    /// Emit flakes for one property's value(s).
    fn values(
        &mut self,
        s: &Sid,
        p: &Sid,
        value: &Json,
        required: Option<&Sid>,
        meta: Option<Meta>,
        op: bool,
    ) -> Result<(), Error> {
        match value {
            Json::Array(items) => {
                for item in items {
                    self.values(s, p, item, required, meta.clone(), op)?;
                }
                Ok(())
            }
            Json::Object(object) => {
                if let Some(Json::Array(items)) = object.get("@list") {
                    for (at, item) in items.iter().enumerate() {
                        self.values(s, p, item, required, Some(Meta::list_index(at as u32)), op)?;
                    }
                    return Ok(());
                }
                if object.contains_key("@value") {
                    let inner = &object["@value"];
                    let lang = object.get("@language").and_then(Json::as_str);
                    let declared = match object.get("@type").and_then(Json::as_str) {
                        Some(iri) => Some(self.encode(iri, op)?),
                        None => None,
                    };
                    let target = declared.as_ref().or(required);
                    let (coerced, datatype) = coerce::from_json(inner, target, lang)?;
                    let meta = match (meta, lang) {
                        (Some(meta), _) => Some(meta),
                        (None, Some(lang)) => Some(Meta::language(lang)),
                        (None, None) => None,
                    };
                    self.flakes.push(Flake::new(
                        s.clone(),
                        p.clone(),
                        coerced,
                        datatype,
                        self.t,
                        op,
                        meta,
                    ));
                    return Ok(());
                }
                // A reference node: link it, and emit its own statements
                // when it carries more than an @id.
                let has_content = object
                    .keys()
                    .any(|key| key != "@id");
                let target = if has_content {
                    self.node(value, op)?
                } else {
                    match object.get("@id").and_then(Json::as_str) {
                        Some(id) => self.encode(id, op)?,
                        None => self.fresh_blank(),
                    }
                };
                self.flakes.push(Flake::new(
                    s.clone(),
                    p.clone(),
                    Value::Sid(target),
                    dt::any_uri(),
                    self.t,
                    op,
                    meta,
                ));
                Ok(())
            }
            literal => {
                let (coerced, datatype) = coerce::from_json(literal, required, None)?;
                self.flakes.push(Flake::new(
                    s.clone(),
                    p.clone(),
                    coerced,
                    datatype,
                    self.t,
                    op,
                    meta,
                ));
                Ok(())
            }
        }
    }
}

fn strings_of(value: Option<&Json>) -> Vec<String> {
    match value {
        Some(Json::String(s)) => vec![s.clone()],
        Some(Json::Array(items)) => items
            .iter()
            .filter_map(Json::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Reconstruct expanded node objects from flakes, the inverse of
/// `assemble_data`. Used to build commit data documents that a replica
/// can replay into identical flakes.
pub fn flakes_to_nodes(db: &Db, flakes: &[Flake]) -> Result<Vec<Json>, Error> {
    // subject -> node object, in first-seen order.
    let mut subjects: Vec<(Sid, serde_json::Map<String, Json>)> = Vec::new();

    for f in flakes {
        let at = match subjects.iter().position(|(sid, _)| sid == &f.s) {
            Some(at) => at,
            None => {
                let mut object = serde_json::Map::new();
                object.insert(
                    "@id".to_string(),
                    Json::String(db.namespaces.decode_sid(&f.s).map_err(flake::Error::from)?),
                );
                subjects.push((f.s.clone(), object));
                subjects.len() - 1
            }
        };
        let object = &mut subjects[at].1;

        if f.p == dt::rdf_type() {
            if let Value::Sid(class) = &f.o {
                let iri = db.namespaces.decode_sid(class).map_err(flake::Error::from)?;
                push_multi(object, "@type", Json::String(iri));
            }
            continue;
        }

        let key = db.namespaces.decode_sid(&f.p).map_err(flake::Error::from)?;
        let rendered = render_value(db, f)?;
        match f.m.as_ref().and_then(|m| m.i) {
            Some(at_list) => push_list(object, &key, at_list, rendered),
            None => push_multi(object, &key, rendered),
        }
    }

    Ok(subjects
        .into_iter()
        .map(|(_, object)| Json::Object(object))
        .collect())
}

fn render_value(db: &Db, f: &Flake) -> Result<Json, Error> {
    if let (Value::Sid(target), true) = (&f.o, f.is_ref()) {
        let iri = db.namespaces.decode_sid(target).map_err(flake::Error::from)?;
        return Ok(serde_json::json!({ "@id": iri }));
    }

    let raw = match &f.o {
        Value::Long(n) => Json::Number((*n).into()),
        Value::Double(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(f.o.to_string())),
        Value::Boolean(b) => Json::Bool(*b),
        other => Json::String(other.to_string()),
    };
    let datatype = db.namespaces.decode_sid(&f.dt).map_err(flake::Error::from)?;

    let mut object = serde_json::Map::new();
    object.insert("@value".to_string(), raw);
    if let Some(lang) = f.m.as_ref().and_then(|m| m.lang.as_deref()) {
        object.insert("@language".to_string(), Json::String(lang.to_string()));
    } else {
        object.insert("@type".to_string(), Json::String(datatype));
    }
    Ok(Json::Object(object))
}

fn push_multi(object: &mut serde_json::Map<String, Json>, key: &str, value: Json) {
    match object.get_mut(key) {
        None => {
            object.insert(key.to_string(), value);
        }
        Some(Json::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Json::Array(vec![first, value]);
        }
    }
}

fn push_list(object: &mut serde_json::Map<String, Json>, key: &str, at: u32, value: Json) {
    let entry = object
        .entry(key.to_string())
        .or_insert_with(|| serde_json::json!({ "@list": [] }));
    if let Some(Json::Array(items)) = entry.get_mut("@list") {
        let at = at as usize;
        if items.len() <= at {
            items.resize(at + 1, Json::Null);
        }
        items[at] = value;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use store::MemoryStore;

    fn empty_db() -> Db {
        Db::genesis("demo", Arc::new(MemoryStore::new()))
    }

    fn data(t: i64, assert: Json) -> DataDoc {
        DataDoc {
            t,
            assert: match assert {
                Json::Array(nodes) => nodes,
                node => vec![node],
            },
            retract: Vec::new(),
            namespaces: Vec::new(),
        }
    }

    #[test]
    fn test_simple_node_to_flakes() {
        let db = empty_db();
        let assembled = assemble_data(
            &db,
            &data(
                1,
                json!({
                    "@id": "http://example.org/ns#alice",
                    "@type": "http://example.org/ns#User",
                    "http://schema.org/name": "Alice"
                }),
            ),
            &FxHashMap::default(),
        )
        .unwrap();

        assert_eq!(assembled.flakes.len(), 2);
        let type_flake = &assembled.flakes[0];
        assert_eq!(type_flake.p, dt::rdf_type());
        assert!(type_flake.is_ref());

        let name_flake = &assembled.flakes[1];
        assert_eq!(name_flake.o.as_str(), Some("Alice"));
        assert_eq!(name_flake.dt, dt::string());
        assert_eq!(name_flake.t, 1);
        assert!(name_flake.op);
    }

    #[test]
    fn test_t_must_follow() {
        let db = empty_db();
        let result = assemble_data(
            &db,
            &data(5, json!({"@id": "http://x.example/a", "http://x.example/p": 1})),
            &FxHashMap::default(),
        );
        assert!(matches!(result, Err(Error::InvalidCommit(_))));
    }

    #[test]
    fn test_lists_carry_their_index() {
        let db = empty_db();
        let assembled = assemble_data(
            &db,
            &data(
                1,
                json!({
                    "@id": "http://example.org/ns#alice",
                    "http://example.org/ns#favNums": { "@list": [42, 76, 9] }
                }),
            ),
            &FxHashMap::default(),
        )
        .unwrap();

        let indexes: Vec<Option<u32>> = assembled
            .flakes
            .iter()
            .map(|f| f.m.as_ref().and_then(|m| m.i))
            .collect();
        assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_nested_nodes_link_and_expand() {
        let db = empty_db();
        let assembled = assemble_data(
            &db,
            &data(
                1,
                json!({
                    "@id": "http://example.org/ns#alice",
                    "http://example.org/ns#address": {
                        "@id": "http://example.org/ns#home",
                        "http://example.org/ns#city": "Oakland"
                    }
                }),
            ),
            &FxHashMap::default(),
        )
        .unwrap();

        // The city statement of the nested node plus the linking edge.
        assert_eq!(assembled.flakes.len(), 2);
        assert!(assembled.flakes.iter().any(|f| f.is_ref()));
        assert!(assembled
            .flakes
            .iter()
            .any(|f| f.o.as_str() == Some("Oakland")));
    }

    #[test]
    fn test_anonymous_nodes_get_blank_ids() {
        let db = empty_db();
        let assembled = assemble_data(
            &db,
            &data(
                1,
                json!({
                    "@id": "http://example.org/ns#alice",
                    "http://example.org/ns#address": {
                        "http://example.org/ns#city": "Oakland"
                    }
                }),
            ),
            &FxHashMap::default(),
        )
        .unwrap();

        let edge = assembled.flakes.iter().find(|f| f.is_ref()).unwrap();
        let target = edge.o.as_sid().unwrap();
        assert_eq!(target.namespace, codes::BLANK);
    }

    #[test]
    fn test_retract_requires_known_namespaces() {
        let db = empty_db();
        let doc = DataDoc {
            t: 1,
            assert: Vec::new(),
            retract: vec![json!({
                "@id": "http://unknown.example/x",
                "http://unknown.example/p": 1
            })],
            namespaces: Vec::new(),
        };
        let result = assemble_data(&db, &doc, &FxHashMap::default());
        assert!(matches!(
            result,
            Err(Error::Codec(flake::Error::UnknownNamespace(_)))
        ));
    }

    #[test]
    fn test_datatype_hint_coerces() {
        let mut db = empty_db();
        let mut namespaces = flake::Namespaces::bootstrap();
        let age = namespaces.encode_iri("http://schema.org/age");
        db = db.with_namespaces(namespaces);

        let mut hints = FxHashMap::default();
        hints.insert(age.clone(), dt::integer());

        let ok = assemble_data(
            &db,
            &data(1, json!({"@id": "http://schema.org/freddy", "http://schema.org/age": 8})),
            &hints,
        )
        .unwrap();
        let stored = ok.flakes.iter().find(|f| f.p == age).unwrap();
        assert_eq!(stored.dt, dt::integer());

        let err = assemble_data(
            &db,
            &data(
                1,
                json!({"@id": "http://schema.org/letti", "http://schema.org/age": "alot"}),
            ),
            &hints,
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("alot cannot be coerced to provided datatype"));
    }

    #[test]
    fn test_round_trip_through_nodes() {
        let db = empty_db();
        let source = json!([{
            "@id": "http://example.org/ns#alice",
            "@type": "http://example.org/ns#User",
            "http://schema.org/name": "Alice",
            "http://example.org/ns#favNums": { "@list": [42, 76] },
            "http://example.org/ns#knows": { "@id": "http://example.org/ns#bob" }
        }]);
        let assembled = assemble_data(&db, &data(1, source), &FxHashMap::default()).unwrap();

        // Render back to nodes against a db that knows the namespaces.
        let db = db.with_namespaces(assembled.namespaces.clone());
        let nodes = flakes_to_nodes(&db, &assembled.flakes).unwrap();

        // Reassembling the rendered nodes yields the same statements.
        let again = assemble_data(
            &db,
            &DataDoc {
                t: 1,
                assert: nodes,
                retract: Vec::new(),
                namespaces: Vec::new(),
            },
            &FxHashMap::default(),
        )
        .unwrap();

        let mut lhs = assembled.flakes.clone();
        let mut rhs = again.flakes.clone();
        let spot = flake::IndexKind::Spot;
        lhs.sort_by(|l, r| spot.cmp(l, r));
        rhs.sort_by(|l, r| spot.cmp(l, r));
        assert_eq!(lhs, rhs);
    }
}
