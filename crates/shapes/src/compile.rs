use fxhash::FxHashMap;
use std::sync::{Arc, RwLock};

use db::reads::component_bounds;
use db::Db;
use flake::{codes, dt, Flake, IndexKind, Sid, Value};
use futures::TryStreamExt;
use index::RangeOpts;

use crate::Error;

pub fn sh(name: &str) -> Sid {
    Sid::new(codes::SHACL, name)
}

/// One segment of a property path. Only the linear predicate/inverse
/// subset participates in validation; richer constructs are carried as
/// `Unsupported` and their property shapes evaluate vacuously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Predicate(Sid),
    Inverse(Sid),
    Unsupported(Sid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    BlankNode,
    Iri,
    Literal,
    BlankNodeOrIri,
    IriOrLiteral,
    BlankNodeOrLiteral,
}

impl NodeKind {
    fn parse(sid: &Sid) -> Option<Self> {
        if sid.namespace != codes::SHACL {
            return None;
        }
        Some(match sid.name.as_str() {
            "BlankNode" => NodeKind::BlankNode,
            "IRI" => NodeKind::Iri,
            "Literal" => NodeKind::Literal,
            "BlankNodeOrIRI" => NodeKind::BlankNodeOrIri,
            "IRIOrLiteral" => NodeKind::IriOrLiteral,
            "BlankNodeOrLiteral" => NodeKind::BlankNodeOrLiteral,
            _ => return None,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::BlankNode => "sh:BlankNode",
            NodeKind::Iri => "sh:IRI",
            NodeKind::Literal => "sh:Literal",
            NodeKind::BlankNodeOrIri => "sh:BlankNodeOrIRI",
            NodeKind::IriOrLiteral => "sh:IRIOrLiteral",
            NodeKind::BlankNodeOrLiteral => "sh:BlankNodeOrLiteral",
        }
    }
}

/// A compiled constraint component. Closed enum: the validator dispatches
/// exhaustively, and unknown sh: predicates are ignored at compile time.
#[derive(Debug, Clone)]
pub enum Constraint {
    MinCount(u64),
    MaxCount(u64),
    MinInclusive(Value, Sid),
    MaxInclusive(Value, Sid),
    MinExclusive(Value, Sid),
    MaxExclusive(Value, Sid),
    MinLength(u64),
    MaxLength(u64),
    Pattern {
        source: String,
        regex: regex::Regex,
    },
    In(Vec<(Value, Sid)>),
    HasValue(Value, Sid),
    Datatype(Sid),
    NodeKind(NodeKind),
    Class(Vec<Sid>),
    Node(Sid),
    QualifiedValueShape {
        shape: Sid,
        min: Option<u64>,
        max: Option<u64>,
        disjoint: bool,
    },
    Equals(Sid),
    Disjoint(Sid),
    LessThan(Sid),
    LessThanOrEquals(Sid),
    Not(Sid),
}

impl Constraint {
    pub fn component(&self) -> &'static str {
        match self {
            Constraint::MinCount(_) => "sh:minCount",
            Constraint::MaxCount(_) => "sh:maxCount",
            Constraint::MinInclusive(..) => "sh:minInclusive",
            Constraint::MaxInclusive(..) => "sh:maxInclusive",
            Constraint::MinExclusive(..) => "sh:minExclusive",
            Constraint::MaxExclusive(..) => "sh:maxExclusive",
            Constraint::MinLength(_) => "sh:minLength",
            Constraint::MaxLength(_) => "sh:maxLength",
            Constraint::Pattern { .. } => "sh:pattern",
            Constraint::In(_) => "sh:in",
            Constraint::HasValue(..) => "sh:hasValue",
            Constraint::Datatype(_) => "sh:datatype",
            Constraint::NodeKind(_) => "sh:nodeKind",
            Constraint::Class(_) => "sh:class",
            Constraint::Node(_) => "sh:node",
            Constraint::QualifiedValueShape { .. } => "sh:qualifiedValueShape",
            Constraint::Equals(_) => "sh:equals",
            Constraint::Disjoint(_) => "sh:disjoint",
            Constraint::LessThan(_) => "sh:lessThan",
            Constraint::LessThanOrEquals(_) => "sh:lessThanOrEquals",
            Constraint::Not(_) => "sh:not",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyShape {
    pub sid: Sid,
    pub path: Vec<PathSegment>,
    pub constraints: Vec<Constraint>,
}

impl PropertyShape {
    /// The predicate this shape covers for closed-world checking: the
    /// first forward segment of its path.
    pub fn covered_predicate(&self) -> Option<&Sid> {
        match self.path.first() {
            Some(PathSegment::Predicate(p)) => Some(p),
            _ => None,
        }
    }

    pub fn path_label(&self) -> String {
        self.path
            .iter()
            .map(|segment| match segment {
                PathSegment::Predicate(p) => p.to_string(),
                PathSegment::Inverse(p) => format!("^{p}"),
                PathSegment::Unsupported(p) => format!("?{p}"),
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[derive(Debug, Clone)]
pub struct NodeShape {
    pub sid: Sid,
    pub target_class: Vec<Sid>,
    pub target_node: Vec<Sid>,
    pub target_subjects_of: Vec<Sid>,
    pub target_objects_of: Vec<Sid>,
    /// The shape subject is itself declared a class: implicit targeting.
    pub implicit_class: bool,
    pub closed: bool,
    pub ignored_properties: Vec<Sid>,
    pub properties: Vec<PropertyShape>,
}

impl NodeShape {
    pub fn has_targets(&self) -> bool {
        self.implicit_class
            || !self.target_class.is_empty()
            || !self.target_node.is_empty()
            || !self.target_subjects_of.is_empty()
            || !self.target_objects_of.is_empty()
    }
}

/// Compiled shapes keyed by shape subject, invalidated when the schema is
/// rehydrated (i.e. when any vocabulary statement lands).
#[derive(Debug, Default)]
pub struct ShapeCache {
    inner: RwLock<FxHashMap<Sid, (i64, Arc<NodeShape>)>>,
}

impl ShapeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, sid: &Sid, schema_t: i64) -> Option<Arc<NodeShape>> {
        let inner = self.inner.read().expect("shape cache poisoned");
        match inner.get(sid) {
            Some((t, shape)) if *t == schema_t => Some(shape.clone()),
            _ => None,
        }
    }

    fn put(&self, sid: Sid, schema_t: i64, shape: Arc<NodeShape>) {
        self.inner
            .write()
            .expect("shape cache poisoned")
            .insert(sid, (schema_t, shape));
    }
}

async fn live_flakes(db: &Db, sid: &Sid) -> Result<Vec<Flake>, Error> {
    let bounds = component_bounds(IndexKind::Spot, Some(sid), None, None);
    Ok(db
        .raw_range(IndexKind::Spot, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?)
}

fn refs_of<'a>(flakes: &'a [Flake], predicate: &Sid) -> Vec<&'a Sid> {
    flakes
        .iter()
        .filter(|f| &f.p == predicate)
        .filter_map(|f| f.o.as_sid())
        .collect()
}

fn first_value<'a>(flakes: &'a [Flake], predicate: &Sid) -> Option<&'a Flake> {
    flakes.iter().find(|f| &f.p == predicate)
}

fn u64_of(f: &Flake) -> Option<u64> {
    match &f.o {
        Value::Long(n) if *n >= 0 => Some(*n as u64),
        _ => None,
    }
}

/// Compile the node shape rooted at `sid`, consulting the cache first.
pub async fn compile_shape(
    db: &Db,
    sid: &Sid,
    cache: &ShapeCache,
) -> Result<Arc<NodeShape>, Error> {
    if let Some(shape) = cache.get(sid, db.schema.t) {
        return Ok(shape);
    }

    let flakes = live_flakes(db, sid).await?;
    let types: Vec<&Sid> = refs_of(&flakes, &dt::rdf_type());
    let implicit_class = types.iter().any(|t| **t == sh("NodeShape"))
        && types
            .iter()
            .any(|t| t.namespace == codes::RDFS && t.name == "Class");

    let mut properties = Vec::new();
    for property_sid in refs_of(&flakes, &sh("property")) {
        properties.push(compile_property(db, property_sid).await?);
    }

    let closed = matches!(
        first_value(&flakes, &sh("closed")).map(|f| &f.o),
        Some(Value::Boolean(true))
    );

    let shape = Arc::new(NodeShape {
        sid: sid.clone(),
        target_class: refs_of(&flakes, &sh("targetClass"))
            .into_iter()
            .cloned()
            .collect(),
        target_node: refs_of(&flakes, &sh("targetNode"))
            .into_iter()
            .cloned()
            .collect(),
        target_subjects_of: refs_of(&flakes, &sh("targetSubjectsOf"))
            .into_iter()
            .cloned()
            .collect(),
        target_objects_of: refs_of(&flakes, &sh("targetObjectsOf"))
            .into_iter()
            .cloned()
            .collect(),
        implicit_class,
        closed,
        ignored_properties: refs_of(&flakes, &sh("ignoredProperties"))
            .into_iter()
            .cloned()
            .collect(),
        properties,
    });

    cache.put(sid.clone(), db.schema.t, shape.clone());
    Ok(shape)
}

async fn compile_property(db: &Db, sid: &Sid) -> Result<PropertyShape, Error> {
    let flakes = live_flakes(db, sid).await?;

    let mut path_flakes: Vec<&Flake> = flakes.iter().filter(|f| f.p == sh("path")).collect();
    path_flakes.sort_by_key(|f| f.m.as_ref().and_then(|m| m.i));

    let mut path = Vec::new();
    for f in path_flakes {
        let segment_sid = match f.o.as_sid() {
            Some(sid) => sid,
            None => {
                return Err(Error::MalformedShape {
                    shape: sid.to_string(),
                    what: "sh:path".to_string(),
                })
            }
        };
        path.push(parse_segment(db, segment_sid).await?);
    }
    if path.is_empty() {
        return Err(Error::MalformedShape {
            shape: sid.to_string(),
            what: "sh:path".to_string(),
        });
    }

    let mut constraints = Vec::new();

    if let Some(f) = first_value(&flakes, &sh("minCount")).and_then(u64_of_opt) {
        constraints.push(Constraint::MinCount(f));
    }
    if let Some(f) = first_value(&flakes, &sh("maxCount")).and_then(u64_of_opt) {
        constraints.push(Constraint::MaxCount(f));
    }
    if let Some(f) = first_value(&flakes, &sh("minLength")).and_then(u64_of_opt) {
        constraints.push(Constraint::MinLength(f));
    }
    if let Some(f) = first_value(&flakes, &sh("maxLength")).and_then(u64_of_opt) {
        constraints.push(Constraint::MaxLength(f));
    }

    for (predicate, build) in [
        ("minInclusive", Constraint::MinInclusive as fn(Value, Sid) -> Constraint),
        ("maxInclusive", Constraint::MaxInclusive),
        ("minExclusive", Constraint::MinExclusive),
        ("maxExclusive", Constraint::MaxExclusive),
    ] {
        if let Some(f) = first_value(&flakes, &sh(predicate)) {
            constraints.push(build(f.o.clone(), f.dt.clone()));
        }
    }

    if let Some(f) = first_value(&flakes, &sh("pattern")) {
        if let Value::String(source) = &f.o {
            let flags = first_value(&flakes, &sh("flags"))
                .and_then(|f| f.o.as_str().map(str::to_string))
                .unwrap_or_default();
            constraints.push(compile_pattern(sid, source, &flags)?);
        }
    }

    let in_values: Vec<(Value, Sid)> = {
        let mut members: Vec<&Flake> = flakes.iter().filter(|f| f.p == sh("in")).collect();
        members.sort_by_key(|f| f.m.as_ref().and_then(|m| m.i));
        members.iter().map(|f| (f.o.clone(), f.dt.clone())).collect()
    };
    if !in_values.is_empty() {
        constraints.push(Constraint::In(in_values));
    }

    if let Some(f) = first_value(&flakes, &sh("hasValue")) {
        constraints.push(Constraint::HasValue(f.o.clone(), f.dt.clone()));
    }
    if let Some(target) = refs_of(&flakes, &sh("datatype")).first() {
        constraints.push(Constraint::Datatype((*target).clone()));
    }
    if let Some(kind) = refs_of(&flakes, &sh("nodeKind"))
        .first()
        .and_then(|sid| NodeKind::parse(sid))
    {
        constraints.push(Constraint::NodeKind(kind));
    }
    let classes: Vec<Sid> = refs_of(&flakes, &sh("class")).into_iter().cloned().collect();
    if !classes.is_empty() {
        constraints.push(Constraint::Class(classes));
    }
    if let Some(node) = refs_of(&flakes, &sh("node")).first() {
        constraints.push(Constraint::Node((*node).clone()));
    }

    if let Some(shape) = refs_of(&flakes, &sh("qualifiedValueShape")).first() {
        constraints.push(Constraint::QualifiedValueShape {
            shape: (*shape).clone(),
            min: first_value(&flakes, &sh("qualifiedMinCount")).and_then(u64_of_opt),
            max: first_value(&flakes, &sh("qualifiedMaxCount")).and_then(u64_of_opt),
            disjoint: matches!(
                first_value(&flakes, &sh("qualifiedValueShapesDisjoint")).map(|f| &f.o),
                Some(Value::Boolean(true))
            ),
        });
    }

    for (predicate, build) in [
        ("equals", Constraint::Equals as fn(Sid) -> Constraint),
        ("disjoint", Constraint::Disjoint),
        ("lessThan", Constraint::LessThan),
        ("lessThanOrEquals", Constraint::LessThanOrEquals),
    ] {
        if let Some(rhs) = refs_of(&flakes, &sh(predicate)).first() {
            constraints.push(build((*rhs).clone()));
        }
    }

    if let Some(inner) = refs_of(&flakes, &sh("not")).first() {
        constraints.push(Constraint::Not((*inner).clone()));
    }

    Ok(PropertyShape {
        sid: sid.clone(),
        path,
        constraints,
    })
}

fn u64_of_opt(f: &Flake) -> Option<u64> {
    u64_of(f)
}

/// A path segment: a plain predicate reference, or a blank node carrying
/// sh:inversePath (other path constructs compile as unsupported).
async fn parse_segment(db: &Db, segment: &Sid) -> Result<PathSegment, Error> {
    if !segment.is_blank() {
        return Ok(PathSegment::Predicate(segment.clone()));
    }
    let flakes = live_flakes(db, segment).await?;
    if let Some(inverse) = refs_of(&flakes, &sh("inversePath")).first() {
        return Ok(PathSegment::Inverse((*inverse).clone()));
    }
    tracing::debug!(segment = %segment, "unsupported path construct");
    Ok(PathSegment::Unsupported(segment.clone()))
}

/// Fold SHACL regex flags into the pattern: `i`, `m`, `s`, `x` map onto
/// inline flags, `q` quotes the pattern literally.
fn compile_pattern(shape: &Sid, source: &str, flags: &str) -> Result<Constraint, Error> {
    let quoted = flags.contains('q');
    let inline: String = flags.chars().filter(|c| "imsx".contains(*c)).collect();

    let mut pattern = String::new();
    if !inline.is_empty() {
        pattern.push_str(&format!("(?{inline})"));
    }
    if quoted {
        pattern.push_str(&regex::escape(source));
    } else {
        pattern.push_str(source);
    }

    let regex = regex::Regex::new(&pattern).map_err(|_| Error::MalformedShape {
        shape: shape.to_string(),
        what: format!("sh:pattern '{source}'"),
    })?;
    Ok(Constraint::Pattern {
        source: source.to_string(),
        regex,
    })
}
