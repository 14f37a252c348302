use futures::future::ready;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use fxhash::FxHashSet;
use std::sync::{Arc, Mutex};

use db::reads::component_bounds;
use db::Db;
use flake::{coerce, compare_obj, dt, Flake, IndexKind, Sid, Value};
use index::{Fuel, RangeOpts};

use crate::expr::eval_filter;
use crate::pattern::{Match, Pattern, Query, Solution, Term, TriplePattern};
use crate::{eval, Error};

pub type SolutionStream = BoxStream<'static, Result<Solution, Error>>;

/// Run a query against a snapshot: seed solutions (or one blank solution)
/// folded through the where clause, one pattern at a time.
pub fn search(db: &Db, query: Query, fuel: Option<Fuel>) -> SolutionStream {
    tracing::debug!(
        t = db.t,
        patterns = query.patterns.len(),
        seeds = query.values.len(),
        "running graph-pattern search"
    );
    let seeds: Vec<Solution> = if query.values.is_empty() {
        vec![Solution::new()]
    } else {
        query.values
    };
    let input: SolutionStream = Box::pin(futures::stream::iter(
        seeds.into_iter().map(Ok::<Solution, Error>),
    ));
    match_clause(db.clone(), query.patterns, input, fuel)
}

fn match_clause(
    db: Db,
    patterns: Vec<Pattern>,
    input: SolutionStream,
    fuel: Option<Fuel>,
) -> SolutionStream {
    patterns.into_iter().fold(input, |stream, pattern| {
        match_pattern(db.clone(), pattern, stream, fuel.clone())
    })
}

fn match_pattern(
    db: Db,
    pattern: Pattern,
    input: SolutionStream,
    fuel: Option<Fuel>,
) -> SolutionStream {
    match pattern {
        Pattern::Tuple(tp) => {
            let stream = input
                .map_ok(move |solution| match_tuple(db.clone(), tp.clone(), solution, fuel.clone()))
                .try_flatten();
            Box::pin(stream)
        }
        Pattern::Class(tp) => {
            let stream = input
                .map_ok(move |solution| match_class(db.clone(), tp.clone(), solution, fuel.clone()))
                .try_flatten();
            Box::pin(stream)
        }
        Pattern::Graph { alias, clauses } => {
            // A single loaded ledger: the alias must name it (or the
            // default alias); the sub-clause then runs unchanged.
            let ledger = db.ledger.clone();
            let gate = input.map(move |result| {
                result.and_then(|solution| {
                    if alias == ledger || alias == "default" {
                        Ok(solution)
                    } else {
                        Err(Error::UnknownGraph(alias.clone()))
                    }
                })
            });
            match_clause(db, clauses, Box::pin(gate), fuel)
        }
        Pattern::Union(alternatives) => {
            let stream = input
                .map_ok(move |solution| {
                    let branches: Vec<SolutionStream> = alternatives
                        .iter()
                        .map(|clauses| {
                            let seed: SolutionStream =
                                Box::pin(futures::stream::once(ready(Ok(solution.clone()))));
                            match_clause(db.clone(), clauses.clone(), seed, fuel.clone())
                        })
                        .collect();
                    futures::stream::iter(branches).flatten()
                })
                .try_flatten();
            Box::pin(stream)
        }
        Pattern::Optional(clauses) => {
            let stream = input
                .map_ok(move |solution| {
                    let db = db.clone();
                    let clauses = clauses.clone();
                    let fuel = fuel.clone();
                    async move {
                        let seed: SolutionStream =
                            Box::pin(futures::stream::once(ready(Ok(solution.clone()))));
                        let inner: Vec<Solution> = match_clause(db, clauses, seed, fuel)
                            .try_collect()
                            .await?;
                        // No inner solutions: the input passes through.
                        let out = if inner.is_empty() { vec![solution] } else { inner };
                        Ok::<_, Error>(futures::stream::iter(
                            out.into_iter().map(Ok::<Solution, Error>),
                        ))
                    }
                })
                .try_buffered(1)
                .try_flatten();
            Box::pin(stream)
        }
        Pattern::Bind { var, expr } => {
            let stream = input.map(move |result| {
                let mut solution = result?;
                let value = eval(&expr, &solution)?;
                solution.insert(var.clone(), value);
                Ok(solution)
            });
            Box::pin(stream)
        }
        Pattern::Filter(expr) => {
            let stream = input.try_filter_map(move |solution| {
                ready(match eval_filter(&expr, &solution) {
                    Ok(true) => Ok(Some(solution)),
                    Ok(false) => Ok(None),
                    Err(err) => Err(err),
                })
            });
            Box::pin(stream)
        }
    }
}

/// Resolution of one pattern term against the current solution.
enum Component {
    Unbound(String),
    BoundSid(Sid),
    BoundValue(Value, Sid),
    /// A fixed term that cannot exist in this database.
    Unmatchable,
}

fn resolve_term(db: &Db, term: &Term, solution: &Solution) -> Component {
    match term {
        Term::Var(name) => match solution.get(name) {
            None => Component::Unbound(name.clone()),
            Some(Match::Sid(sid)) => Component::BoundSid(sid.clone()),
            Some(Match::Val(value, datatype)) => {
                Component::BoundValue(value.clone(), datatype.clone())
            }
        },
        Term::Iri(iri) => match db.namespaces.try_encode_iri(iri) {
            Ok(sid) => Component::BoundSid(sid),
            // An IRI in a namespace this db has never seen matches nothing.
            Err(_) => Component::Unmatchable,
        },
        Term::Value(json) => {
            let datatype = coerce::infer(json, None);
            match coerce::coerce(json, &datatype) {
                Ok(value) => Component::BoundValue(value, datatype),
                Err(_) => Component::Unmatchable,
            }
        }
    }
}

fn empty_stream() -> SolutionStream {
    Box::pin(futures::stream::empty())
}

/// Match one triple pattern: pick the index whose comparator prefix is
/// covered by the bound components, walk it, and extend the solution per
/// matching flake.
fn match_tuple(
    db: Db,
    tp: TriplePattern,
    solution: Solution,
    fuel: Option<Fuel>,
) -> SolutionStream {
    let s = resolve_term(&db, &tp.s, &solution);
    let p = resolve_term(&db, &tp.p, &solution);
    let o = resolve_term(&db, &tp.o, &solution);

    if matches!(s, Component::Unmatchable)
        || matches!(p, Component::Unmatchable)
        || matches!(o, Component::Unmatchable)
    {
        return empty_stream();
    }
    // Subjects and predicates must be identifiers when bound.
    let s_sid = match &s {
        Component::BoundSid(sid) => Some(sid.clone()),
        Component::BoundValue(..) => return empty_stream(),
        Component::Unbound(_) => None,
        Component::Unmatchable => unreachable!("filtered out above"),
    };
    let p_sid = match &p {
        Component::BoundSid(sid) => Some(sid.clone()),
        Component::BoundValue(..) => return empty_stream(),
        Component::Unbound(_) => None,
        Component::Unmatchable => unreachable!("filtered out above"),
    };
    let o_pair: Option<(Value, Sid)> = match &o {
        Component::BoundSid(sid) => Some((Value::Sid(sid.clone()), dt::any_uri())),
        Component::BoundValue(value, datatype) => Some((value.clone(), datatype.clone())),
        Component::Unbound(_) => None,
        Component::Unmatchable => unreachable!("filtered out above"),
    };

    let o_is_ref = matches!(&o_pair, Some((Value::Sid(_), _)));
    let kind = if s_sid.is_some() {
        IndexKind::Spot
    } else if o_is_ref {
        IndexKind::Opst
    } else if p_sid.is_some() {
        IndexKind::Post
    } else {
        IndexKind::Spot
    };

    let bounds = component_bounds(
        kind,
        s_sid.as_ref(),
        p_sid.as_ref(),
        o_pair.as_ref().map(|(v, d)| (v, d)),
    );
    let mut opts = RangeOpts::live(db.t);
    opts.fuel = fuel;

    let stream = db
        .range(kind, bounds, opts)
        .map_err(Error::from)
        .try_filter_map(move |f| {
            let keep = component_matches(&f, &s_sid, &p_sid, &o_pair);
            let extended = if keep {
                extend_solution(&solution, &tp, &f)
            } else {
                None
            };
            ready(Ok(extended))
        });
    Box::pin(stream)
}

/// Class pattern: expand the object class over its subclass closure and
/// de-duplicate subjects across the fanout.
fn match_class(
    db: Db,
    tp: TriplePattern,
    solution: Solution,
    fuel: Option<Fuel>,
) -> SolutionStream {
    let class = match resolve_term(&db, &tp.o, &solution) {
        Component::BoundSid(sid) => sid,
        Component::Unbound(_) => {
            // An unbound class variable degrades to a plain rdf:type scan.
            let rdf_type = TriplePattern {
                s: tp.s.clone(),
                p: Term::Iri(type_iri()),
                o: tp.o,
            };
            return match_tuple(db, rdf_type, solution, fuel);
        }
        _ => return empty_stream(),
    };

    let classes = db.schema.class_closure(&class);
    let seen: Arc<Mutex<FxHashSet<Sid>>> = Arc::new(Mutex::new(FxHashSet::default()));

    let branches: Vec<SolutionStream> = classes
        .into_iter()
        .map(|cls| {
            match_tuple_fixed_object(db.clone(), tp.s.clone(), cls, solution.clone(), fuel.clone())
        })
        .collect();

    let stream = futures::stream::iter(branches)
        .flatten()
        .try_filter(move |solution| {
            let keep = match subject_of(solution, &tp.s) {
                Some(sid) => seen.lock().expect("dedup set poisoned").insert(sid),
                None => true,
            };
            ready(keep)
        });
    Box::pin(stream)
}

fn type_iri() -> String {
    format!("{}type", flake::RDF_NS)
}

fn subject_of(solution: &Solution, term: &Term) -> Option<Sid> {
    match term {
        Term::Var(name) => solution.get(name).and_then(|m| m.as_sid().cloned()),
        _ => None,
    }
}

/// A tuple match for `?s rdf:type <class>` with the class already
/// resolved to a sid.
fn match_tuple_fixed_object(
    db: Db,
    subject: Term,
    class: Sid,
    solution: Solution,
    fuel: Option<Fuel>,
) -> SolutionStream {
    let s_sid = match resolve_term(&db, &subject, &solution) {
        Component::BoundSid(sid) => Some(sid),
        Component::Unbound(_) => None,
        _ => return empty_stream(),
    };
    let p_sid = dt::rdf_type();
    let o_pair = (Value::Sid(class), dt::any_uri());

    let kind = if s_sid.is_some() {
        IndexKind::Spot
    } else {
        IndexKind::Opst
    };
    let bounds = component_bounds(
        kind,
        s_sid.as_ref(),
        Some(&p_sid),
        Some((&o_pair.0, &o_pair.1)),
    );
    let mut opts = RangeOpts::live(db.t);
    opts.fuel = fuel;

    let s_check = s_sid.clone();
    let stream = db
        .range(kind, bounds, opts)
        .map_err(Error::from)
        .try_filter_map(move |f| {
            let keep = component_matches(
                &f,
                &s_check,
                &Some(p_sid.clone()),
                &Some(o_pair.clone()),
            );
            let extended = if keep {
                extend_subject_only(&solution, &subject, &f)
            } else {
                None
            };
            ready(Ok(extended))
        });
    Box::pin(stream)
}

fn component_matches(
    f: &Flake,
    s: &Option<Sid>,
    p: &Option<Sid>,
    o: &Option<(Value, Sid)>,
) -> bool {
    if let Some(sid) = s {
        if &f.s != sid {
            return false;
        }
    }
    if let Some(sid) = p {
        if &f.p != sid {
            return false;
        }
    }
    if let Some((value, datatype)) = o {
        if compare_obj(&f.o, &f.dt, value, datatype) != std::cmp::Ordering::Equal {
            return false;
        }
    }
    true
}

/// Extend a solution with this flake's bindings for the pattern's
/// variables. A variable bound twice must agree with itself.
fn extend_solution(solution: &Solution, tp: &TriplePattern, f: &Flake) -> Option<Solution> {
    let mut next = solution.clone();

    let mut bind = |term: &Term, binding: Match| -> bool {
        let name = match term {
            Term::Var(name) => name,
            _ => return true,
        };
        match next.get(name) {
            Some(existing) => existing.same(&binding),
            None => {
                next.insert(name.clone(), binding);
                true
            }
        }
    };

    if !bind(&tp.s, Match::Sid(f.s.clone())) {
        return None;
    }
    if !bind(&tp.p, Match::Sid(f.p.clone())) {
        return None;
    }
    let o_match = match (&f.o, f.is_ref()) {
        (Value::Sid(sid), true) => Match::Sid(sid.clone()),
        _ => Match::Val(f.o.clone(), f.dt.clone()),
    };
    if !bind(&tp.o, o_match) {
        return None;
    }
    Some(next)
}

fn extend_subject_only(solution: &Solution, term: &Term, f: &Flake) -> Option<Solution> {
    let mut next = solution.clone();
    if let Term::Var(name) = term {
        match next.get(name) {
            Some(existing) if !existing.same(&Match::Sid(f.s.clone())) => return None,
            Some(_) => (),
            None => {
                next.insert(name.clone(), Match::Sid(f.s.clone()));
            }
        }
    }
    Some(next)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Expr, Op};
    use flake::codes;
    use std::sync::Arc as StdArc;
    use store::MemoryStore;

    const EX: u32 = 8;

    fn sid(name: &str) -> Sid {
        Sid::new(EX, name)
    }

    fn ex(name: &str) -> String {
        format!("http://example.org/ns#{name}")
    }

    fn ref_flake(s: &str, p: &str, o: &str) -> Flake {
        Flake::new(
            sid(s),
            if p == "type" { dt::rdf_type() } else { sid(p) },
            Value::Sid(sid(o)),
            dt::any_uri(),
            1,
            true,
            None,
        )
    }

    fn long_flake(s: &str, p: &str, o: i64) -> Flake {
        Flake::new(sid(s), sid(p), Value::Long(o), dt::long(), 1, true, None)
    }

    fn fixture() -> Db {
        let namespaces =
            flake::Namespaces::bootstrap().with_iris(["http://example.org/ns#anything"]);
        assert_eq!(namespaces.code_of("http://example.org/ns#"), Some(EX));

        let subclass = Flake::new(
            sid("Admin"),
            Sid::new(codes::RDFS, "subClassOf"),
            Value::Sid(sid("User")),
            dt::any_uri(),
            1,
            true,
            None,
        );
        let flakes = vec![
            ref_flake("alice", "type", "User"),
            long_flake("alice", "age", 30),
            ref_flake("alice", "knows", "bob"),
            ref_flake("bob", "type", "User"),
            long_flake("bob", "age", 41),
            ref_flake("carol", "type", "Admin"),
            long_flake("carol", "age", 22),
            subclass,
        ];

        Db::genesis("demo", StdArc::new(MemoryStore::new()))
            .with_namespaces(namespaces)
            .with_flakes(1, &flakes, &[])
    }

    fn tuple(s: Term, p: Term, o: Term) -> Pattern {
        Pattern::Tuple(TriplePattern { s, p, o })
    }

    async fn run(db: &Db, patterns: Vec<Pattern>) -> Vec<Solution> {
        search(
            db,
            Query {
                values: Vec::new(),
                patterns,
            },
            None,
        )
        .try_collect()
        .await
        .unwrap()
    }

    fn bound_subjects(solutions: &[Solution], var: &str) -> Vec<String> {
        solutions
            .iter()
            .filter_map(|s| s.get(var))
            .filter_map(|m| m.as_sid())
            .map(|sid| sid.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_tuple_join_across_patterns() {
        let db = fixture();
        // ?s knows ?other . ?other age ?age
        let solutions = run(
            &db,
            vec![
                tuple(Term::var("?s"), Term::iri(ex("knows")), Term::var("?other")),
                tuple(Term::var("?other"), Term::iri(ex("age")), Term::var("?age")),
            ],
        )
        .await;
        assert_eq!(solutions.len(), 1);
        assert_eq!(bound_subjects(&solutions, "?s"), vec!["alice"]);
        assert!(solutions[0]
            .get("?age")
            .unwrap()
            .same(&Match::Val(Value::Long(41), dt::long())));
    }

    #[tokio::test]
    async fn test_class_pattern_expands_subclasses() {
        let db = fixture();
        let solutions = run(
            &db,
            vec![Pattern::Class(TriplePattern {
                s: Term::var("?s"),
                p: Term::iri(format!("{}type", flake::RDF_NS)),
                o: Term::iri(ex("User")),
            })],
        )
        .await;
        let mut subjects = bound_subjects(&solutions, "?s");
        subjects.sort();
        // carol is an Admin, a subclass of User.
        assert_eq!(subjects, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_filter_and_bind() {
        let db = fixture();
        let solutions = run(
            &db,
            vec![
                tuple(Term::var("?s"), Term::iri(ex("age")), Term::var("?age")),
                Pattern::Filter(Expr::call(
                    Op::Gt,
                    vec![Expr::var("?age"), Expr::lit(25)],
                )),
                Pattern::Bind {
                    var: "?next".to_string(),
                    expr: Expr::call(Op::Add, vec![Expr::var("?age"), Expr::lit(1)]),
                },
            ],
        )
        .await;
        let mut subjects = bound_subjects(&solutions, "?s");
        subjects.sort();
        assert_eq!(subjects, vec!["alice", "bob"]);
        for solution in &solutions {
            let age = match solution.get("?age").unwrap() {
                Match::Val(Value::Long(n), _) => *n,
                other => panic!("unexpected {other:?}"),
            };
            assert!(solution
                .get("?next")
                .unwrap()
                .same(&Match::Val(Value::Long(age + 1), dt::long())));
        }
    }

    #[tokio::test]
    async fn test_optional_passes_through_on_no_match() {
        let db = fixture();
        let solutions = run(
            &db,
            vec![
                tuple(Term::var("?s"), Term::iri(ex("age")), Term::var("?age")),
                Pattern::Optional(vec![tuple(
                    Term::var("?s"),
                    Term::iri(ex("knows")),
                    Term::var("?other"),
                )]),
            ],
        )
        .await;
        assert_eq!(solutions.len(), 3);
        let with_other = solutions
            .iter()
            .filter(|s| s.contains_key("?other"))
            .count();
        assert_eq!(with_other, 1);
    }

    #[tokio::test]
    async fn test_union_concatenates() {
        let db = fixture();
        let solutions = run(
            &db,
            vec![Pattern::Union(vec![
                vec![tuple(
                    Term::var("?s"),
                    Term::iri(ex("knows")),
                    Term::var("?o"),
                )],
                vec![tuple(
                    Term::var("?s"),
                    Term::iri(format!("{}type", flake::RDF_NS)),
                    Term::iri(ex("Admin")),
                )],
            ])],
        )
        .await;
        let mut subjects = bound_subjects(&solutions, "?s");
        subjects.sort();
        assert_eq!(subjects, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_unknown_iri_matches_nothing() {
        let db = fixture();
        let solutions = run(
            &db,
            vec![tuple(
                Term::var("?s"),
                Term::iri("http://nowhere.example/p"),
                Term::var("?o"),
            )],
        )
        .await;
        assert!(solutions.is_empty());
    }

    #[tokio::test]
    async fn test_fuel_exhaustion_surfaces() {
        let db = fixture();
        let result: Result<Vec<Solution>, Error> = search(
            &db,
            Query {
                values: Vec::new(),
                patterns: vec![tuple(
                    Term::var("?s"),
                    Term::var("?p"),
                    Term::var("?o"),
                )],
            },
            Some(Fuel::new(2)),
        )
        .try_collect()
        .await;
        assert!(matches!(
            result,
            Err(Error::Db(db::Error::Index(index::Error::FuelExhausted { .. })))
        ));
    }

    #[tokio::test]
    async fn test_same_variable_twice_must_agree() {
        let db = fixture();
        // ?s knows ?s never matches: alice knows bob, not herself.
        let solutions = run(
            &db,
            vec![tuple(
                Term::var("?s"),
                Term::iri(ex("knows")),
                Term::var("?s"),
            )],
        )
        .await;
        assert!(solutions.is_empty());
    }

    #[tokio::test]
    async fn test_values_seed_the_fold() {
        let db = fixture();
        let mut seed = Solution::new();
        seed.insert("?s".to_string(), Match::Sid(sid("bob")));

        let solutions: Vec<Solution> = search(
            &db,
            Query {
                values: vec![seed],
                patterns: vec![tuple(
                    Term::var("?s"),
                    Term::iri(ex("age")),
                    Term::var("?age"),
                )],
            },
            None,
        )
        .try_collect()
        .await
        .unwrap();

        assert_eq!(solutions.len(), 1);
        assert!(solutions[0]
            .get("?age")
            .unwrap()
            .same(&Match::Val(Value::Long(41), dt::long())));
    }

    #[tokio::test]
    async fn test_graph_alias_gates_the_clause() {
        let db = fixture();
        let inner = vec![tuple(
            Term::var("?s"),
            Term::iri(ex("age")),
            Term::var("?age"),
        )];

        let solutions = run(
            &db,
            vec![Pattern::Graph {
                alias: "demo".to_string(),
                clauses: inner.clone(),
            }],
        )
        .await;
        assert_eq!(solutions.len(), 3);

        let result: Result<Vec<Solution>, Error> = search(
            &db,
            Query {
                values: Vec::new(),
                patterns: vec![Pattern::Graph {
                    alias: "elsewhere".to_string(),
                    clauses: inner,
                }],
            },
            None,
        )
        .try_collect()
        .await;
        assert!(matches!(result, Err(Error::UnknownGraph(_))));
    }

    #[tokio::test]
    async fn test_bind_error_closes_the_stream() {
        let db = fixture();
        let result: Result<Vec<Solution>, Error> = search(
            &db,
            Query {
                values: Vec::new(),
                patterns: vec![
                    tuple(Term::var("?s"), Term::iri(ex("age")), Term::var("?age")),
                    Pattern::Bind {
                        var: "?oops".to_string(),
                        expr: Expr::call(Op::Add, vec![Expr::var("?missing"), Expr::lit(1)]),
                    },
                ],
            },
            None,
        )
        .try_collect()
        .await;
        assert!(matches!(result, Err(Error::UnboundVariable(_))));
    }

    #[tokio::test]
    async fn test_select_projects_solutions() {
        let db = fixture();
        let rows = crate::select(
            &db,
            Query {
                values: Vec::new(),
                patterns: vec![tuple(
                    Term::var("?s"),
                    Term::iri(ex("age")),
                    Term::var("?age"),
                )],
            },
            &[crate::Selection::var("?s"), crate::Selection::var("?age")],
            None,
        )
        .await
        .unwrap();

        assert_eq!(rows.len(), 3);
        assert!(rows.contains(&serde_json::json!([ex("alice"), 30])));

        let graphs = crate::select(
            &db,
            Query {
                values: Vec::new(),
                patterns: vec![tuple(
                    Term::var("?s"),
                    Term::iri(ex("knows")),
                    Term::var("?o"),
                )],
            },
            &[crate::Selection::graph("?s")],
            None,
        )
        .await
        .unwrap();
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0]["@id"], serde_json::json!(ex("alice")));
    }
}
