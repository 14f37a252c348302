use futures::stream::BoxStream;
use futures::TryStreamExt;

use flake::{dt, Flake, IndexKind, Meta, Sid, Test, Value};
use index::{RangeBounds, RangeOpts};

use crate::{Db, Error};

impl Db {
    /// Stream a range of one index, with this snapshot's policy applied.
    pub fn range(
        &self,
        kind: IndexKind,
        bounds: RangeBounds,
        opts: RangeOpts,
    ) -> BoxStream<'static, Result<Flake, Error>> {
        let stream = self.raw_range(kind, bounds, opts);
        match &self.policy {
            None => stream,
            Some(policy) => {
                let policy = policy.clone();
                let db = self.clone();
                Box::pin(stream.try_filter(move |f| {
                    let policy = policy.clone();
                    let db = db.clone();
                    let f = f.clone();
                    async move { policy.allow(&db, &f).await }
                }))
            }
        }
    }

    /// Stream a range without visibility filtering. Used by the policy
    /// engine's own path walks and by shape validation, which must see
    /// the unredacted data.
    pub fn raw_range(
        &self,
        kind: IndexKind,
        bounds: RangeBounds,
        mut opts: RangeOpts,
    ) -> BoxStream<'static, Result<Flake, Error>> {
        if opts.cache.is_none() {
            opts.cache = Some(self.node_cache.clone());
        }
        Box::pin(
            index::index_range(
                self.store.clone(),
                self.indexes.root(kind).clone(),
                self.novelty.clone(),
                bounds,
                opts,
            )
            .map_err(Error::from),
        )
    }
}

/// The smallest possible subject id; sorts before every real identifier.
pub fn min_sid() -> Sid {
    Sid::new(0, "")
}

/// Sorts after every identifier a namespace table can issue.
pub fn max_sid() -> Sid {
    Sid::new(u32::MAX, "")
}

fn extreme_flake(max: bool) -> Flake {
    let sid = if max { max_sid() } else { min_sid() };
    Flake::new(
        sid.clone(),
        sid.clone(),
        Value::Sid(sid.clone()),
        sid,
        if max { i64::MAX } else { i64::MIN },
        max,
        max.then(|| Meta {
            i: Some(u32::MAX),
            lang: None,
        }),
    )
}

/// Build comparator-space bounds from the bound components of a pattern.
/// Components are consumed in the index's comparator order until the first
/// unbound one; anything bound beyond that prefix must be filtered by the
/// caller.
pub fn component_bounds(
    kind: IndexKind,
    s: Option<&Sid>,
    p: Option<&Sid>,
    o: Option<(&Value, &Sid)>,
) -> RangeBounds {
    let assemble = |max: bool| -> Flake {
        let mut probe = extreme_flake(max);
        let order: &[char] = match kind {
            IndexKind::Spot => &['s', 'p', 'o'],
            IndexKind::Post => &['p', 'o', 's'],
            IndexKind::Opst => &['o', 'p', 's'],
            IndexKind::Tspo => &[],
        };
        for component in order {
            match component {
                's' => match s {
                    Some(sid) => probe.s = sid.clone(),
                    None => break,
                },
                'p' => match p {
                    Some(sid) => probe.p = sid.clone(),
                    None => break,
                },
                'o' => match o {
                    Some((value, datatype)) => {
                        probe.o = value.clone();
                        probe.dt = datatype.clone();
                    }
                    None => break,
                },
                _ => unreachable!(),
            }
        }
        probe
    };

    RangeBounds {
        lower: Some((Test::Ge, assemble(false))),
        upper: Some((Test::Le, assemble(true))),
    }
}

/// POST-space bounds spanning every predicate in `[lo, hi)`. Used to
/// sweep a whole vocabulary namespace, whose predicates are contiguous
/// under the identifier ordering.
pub fn predicate_span(lo: &Sid, hi: &Sid) -> RangeBounds {
    let mut lower = extreme_flake(false);
    lower.p = lo.clone();
    let mut upper = extreme_flake(false);
    upper.p = hi.clone();
    RangeBounds {
        lower: Some((Test::Ge, lower)),
        upper: Some((Test::Lt, upper)),
    }
}

/// All live flakes of one subject as of `to_t`, in SPOT order.
pub async fn subject_flakes(db: &Db, sid: &Sid, to_t: i64) -> Result<Vec<Flake>, Error> {
    let bounds = component_bounds(IndexKind::Spot, Some(sid), None, None);
    db.range(IndexKind::Spot, bounds, RangeOpts::live(to_t))
        .try_collect()
        .await
}

/// Assemble the JSON object view of a subject: `@id`, `@type`, and every
/// live property. Multi-valued properties become arrays; list values are
/// ordered by their list index.
pub async fn subject_graph(
    db: &Db,
    sid: &Sid,
    to_t: i64,
) -> Result<Option<serde_json::Value>, Error> {
    let flakes = subject_flakes(db, sid, to_t).await?;
    if flakes.is_empty() {
        return Ok(None);
    }

    let mut object = serde_json::Map::new();
    object.insert(
        "@id".to_string(),
        serde_json::Value::String(db.sid_to_iri(sid)?),
    );

    let mut types: Vec<serde_json::Value> = Vec::new();
    // property iri -> (list index, value), preserving SPOT arrival order.
    let mut properties: Vec<(String, Vec<(Option<u32>, serde_json::Value)>)> = Vec::new();

    for f in &flakes {
        if f.p == dt::rdf_type() {
            if let Value::Sid(class) = &f.o {
                types.push(serde_json::Value::String(db.sid_to_iri(class)?));
            }
            continue;
        }
        let iri = db.sid_to_iri(&f.p)?;
        let value = flake_value_json(db, f)?;
        let at = match properties.iter().position(|(name, _)| *name == iri) {
            Some(at) => at,
            None => {
                properties.push((iri, Vec::new()));
                properties.len() - 1
            }
        };
        properties[at].1.push((f.m.as_ref().and_then(|m| m.i), value));
    }

    if !types.is_empty() {
        let value = if types.len() == 1 {
            types.remove(0)
        } else {
            serde_json::Value::Array(types)
        };
        object.insert("@type".to_string(), value);
    }

    for (iri, mut values) in properties {
        values.sort_by_key(|(at, _)| *at);
        let json = if values.len() == 1 && values[0].0.is_none() {
            values.remove(0).1
        } else {
            serde_json::Value::Array(values.into_iter().map(|(_, v)| v).collect())
        };
        object.insert(iri, json);
    }

    Ok(Some(serde_json::Value::Object(object)))
}

/// The JSON rendition of a flake's object position.
pub fn flake_value_json(db: &Db, f: &Flake) -> Result<serde_json::Value, Error> {
    Ok(match &f.o {
        Value::Sid(sid) => serde_json::json!({ "@id": db.sid_to_iri(sid)? }),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Long(n) => serde_json::Value::Number((*n).into()),
        Value::Double(n) => match serde_json::Number::from_f64(*n) {
            Some(number) => serde_json::Value::Number(number),
            None => serde_json::Value::String(f.o.to_string()),
        },
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        other => serde_json::Value::String(other.to_string()),
    })
}

/// One transaction's worth of history for a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBlock {
    pub t: i64,
    pub assert: Vec<Flake>,
    pub retract: Vec<Flake>,
}

/// Walk TSPO between transactions, grouped per `t` into assert and
/// retract blocks. With a subject, only its statements are reported.
pub async fn history(
    db: &Db,
    subject: Option<&Sid>,
    from_t: i64,
    to_t: i64,
) -> Result<Vec<HistoryBlock>, Error> {
    let mut opts = RangeOpts::history(from_t, to_t);
    if let Some(sid) = subject {
        let sid = sid.clone();
        opts.filter = Some(std::sync::Arc::new(move |f: &Flake| f.s == sid));
    }

    let flakes: Vec<Flake> = db
        .range(IndexKind::Tspo, RangeBounds::all(), opts)
        .try_collect()
        .await?;

    let mut blocks: Vec<HistoryBlock> = Vec::new();
    for f in flakes {
        if blocks.last().map(|b| b.t) != Some(f.t) {
            blocks.push(HistoryBlock {
                t: f.t,
                assert: Vec::new(),
                retract: Vec::new(),
            });
        }
        let block = blocks.last_mut().expect("just ensured");
        if f.op {
            block.assert.push(f);
        } else {
            block.retract.push(f);
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use store::MemoryStore;

    fn db_with(adds: Vec<Flake>, t: i64) -> Db {
        let db = Db::genesis("demo", Arc::new(MemoryStore::new()));
        db.with_flakes(t, &adds, &[])
    }

    fn sid(name: &str) -> Sid {
        Sid::new(9, name)
    }

    fn name_flake(s: &str, value: &str, t: i64) -> Flake {
        Flake::new(
            sid(s),
            Sid::new(10, "name"),
            Value::String(value.to_string()),
            dt::string(),
            t,
            true,
            None,
        )
    }

    #[tokio::test]
    async fn test_subject_flakes_isolated_per_subject() {
        let db = db_with(
            vec![
                name_flake("alice", "Alice", 1),
                name_flake("bob", "Bob", 1),
                name_flake("carol", "Carol", 1),
            ],
            1,
        );

        let flakes = subject_flakes(&db, &sid("bob"), 1).await.unwrap();
        assert_eq!(flakes.len(), 1);
        assert_eq!(flakes[0].o.as_str(), Some("Bob"));
    }

    #[tokio::test]
    async fn test_subject_graph_assembly() {
        let namespaces = flake::Namespaces::bootstrap()
            .with_iris(["http://example.org/ns#x", "http://schema.org/x"]);
        let ex = namespaces.code_of("http://example.org/ns#").unwrap();
        let schema_org = namespaces.code_of("http://schema.org/").unwrap();

        let alice = Sid::new(ex, "alice");
        let flakes = vec![
            Flake::new(
                alice.clone(),
                dt::rdf_type(),
                Value::Sid(Sid::new(ex, "User")),
                dt::any_uri(),
                1,
                true,
                None,
            ),
            Flake::new(
                alice.clone(),
                Sid::new(schema_org, "name"),
                Value::String("Alice".to_string()),
                dt::string(),
                1,
                true,
                None,
            ),
            Flake::new(
                alice.clone(),
                Sid::new(ex, "favNums"),
                Value::Long(7),
                dt::long(),
                1,
                true,
                Some(Meta::list_index(1)),
            ),
            Flake::new(
                alice.clone(),
                Sid::new(ex, "favNums"),
                Value::Long(42),
                dt::long(),
                1,
                true,
                Some(Meta::list_index(0)),
            ),
        ];

        let db = Db::genesis("demo", Arc::new(MemoryStore::new()))
            .with_namespaces(namespaces)
            .with_flakes(1, &flakes, &[]);

        let graph = subject_graph(&db, &alice, 1).await.unwrap().unwrap();
        insta::assert_json_snapshot!(graph, @r###"
        {
          "@id": "http://example.org/ns#alice",
          "@type": "http://example.org/ns#User",
          "http://example.org/ns#favNums": [
            42,
            7
          ],
          "http://schema.org/name": "Alice"
        }
        "###);
    }

    #[tokio::test]
    async fn test_missing_subject_graph_is_none() {
        let db = db_with(vec![name_flake("alice", "Alice", 1)], 1);
        assert!(subject_graph(&db, &sid("ghost"), 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_groups_by_t() {
        let assert_flake = name_flake("alice", "Alice", 1);
        let retract_flake = assert_flake.flip_t(2);

        let db = db_with(vec![assert_flake.clone()], 1).with_flakes(2, &[retract_flake], &[]);

        let blocks = history(&db, Some(&sid("alice")), 0, 2).await.unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].t, 1);
        assert_eq!(blocks[0].assert.len(), 1);
        assert_eq!(blocks[1].t, 2);
        assert_eq!(blocks[1].retract.len(), 1);

        // As-of the first transaction, the subject still has its name.
        let live = subject_flakes(&db, &sid("alice"), 1).await.unwrap();
        assert_eq!(live.len(), 1);
        // As-of the second, it does not.
        let live = subject_flakes(&db, &sid("alice"), 2).await.unwrap();
        assert!(live.is_empty());
    }
}
