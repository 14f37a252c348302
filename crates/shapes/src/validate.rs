use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use fxhash::FxHashSet;
use std::cmp::Ordering;

use db::reads::component_bounds;
use db::Db;
use flake::{compare_obj, dt, Flake, IndexKind, Sid, Value};
use index::RangeOpts;

use crate::compile::{compile_shape, Constraint, NodeKind, NodeShape, PathSegment, PropertyShape, ShapeCache};
use crate::{Error, ValidationReport, ValidationResult};

/// A value node reached through a property path: the object value with its
/// datatype (references carry xsd:anyURI).
#[derive(Debug, Clone, PartialEq)]
pub struct ValueNode {
    pub value: Value,
    pub dt: Sid,
}

impl ValueNode {
    fn reference(sid: Sid) -> Self {
        Self {
            value: Value::Sid(sid),
            dt: dt::any_uri(),
        }
    }

    fn as_sid(&self) -> Option<&Sid> {
        self.value.as_sid().filter(|_| dt::is_any_uri(&self.dt))
    }

    fn equals(&self, value: &Value, datatype: &Sid) -> bool {
        compare_obj(&self.value, &self.dt, value, datatype) == Ordering::Equal
    }
}

struct Ctx<'a> {
    db: &'a Db,
    cache: &'a ShapeCache,
}

/// Validate every shape that targets a subject modified by this
/// transaction. Violations are collected across all shapes and focus
/// nodes; a non-empty report fails the transaction.
pub async fn validate_transaction(
    db: &Db,
    modified: &[Flake],
    cache: &ShapeCache,
) -> Result<(), Error> {
    let ctx = Ctx { db, cache };
    let mut report = ValidationReport::default();

    let mut subjects: Vec<Sid> = Vec::new();
    for f in modified {
        if !subjects.contains(&f.s) {
            subjects.push(f.s.clone());
        }
    }

    let shape_sids: Vec<Sid> = db.schema.shapes().cloned().collect();
    for shape_sid in shape_sids {
        let shape = compile_shape(db, &shape_sid, cache).await?;
        if !shape.has_targets() {
            continue;
        }
        let focus_nodes = resolve_focus(&ctx, &shape, modified, &subjects).await?;
        for focus in focus_nodes {
            let mut visiting = Vec::new();
            let results = eval_node_shape(&ctx, &shape, &focus, &mut visiting).await?;
            report.results.extend(results);
        }
    }

    if report.conforms() {
        Ok(())
    } else {
        tracing::debug!(violations = report.results.len(), "transaction failed SHACL");
        Err(Error::Violation(report))
    }
}

/// Focus-node resolution: target-node identity, class membership
/// (including implicit class targeting), subjects-of, and objects-of.
async fn resolve_focus(
    ctx: &Ctx<'_>,
    shape: &NodeShape,
    modified: &[Flake],
    subjects: &[Sid],
) -> Result<Vec<Sid>, Error> {
    let mut focus: Vec<Sid> = Vec::new();
    let mut add = |sid: &Sid, focus: &mut Vec<Sid>| {
        if !focus.contains(sid) {
            focus.push(sid.clone());
        }
    };

    for s in subjects {
        if shape.target_node.contains(s) {
            add(s, &mut focus);
            continue;
        }
        let flakes = live_flakes(ctx.db, s).await?;
        let targeted = flakes.iter().any(|f| {
            if f.p == dt::rdf_type() {
                if let Some(class) = f.o.as_sid() {
                    return shape.target_class.contains(class)
                        || (shape.implicit_class && *class == shape.sid);
                }
            }
            shape.target_subjects_of.contains(&f.p)
        });
        if targeted {
            add(s, &mut focus);
        }
    }

    for f in modified {
        if shape.target_objects_of.contains(&f.p) {
            if let Some(object) = f.o.as_sid() {
                add(object, &mut focus);
            }
        }
    }

    Ok(focus)
}

async fn live_flakes(db: &Db, sid: &Sid) -> Result<Vec<Flake>, Error> {
    let bounds = component_bounds(IndexKind::Spot, Some(sid), None, None);
    Ok(db
        .raw_range(IndexKind::Spot, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?)
}

async fn objects_of(db: &Db, subject: &Sid, predicate: &Sid) -> Result<Vec<ValueNode>, Error> {
    let bounds = component_bounds(IndexKind::Spot, Some(subject), Some(predicate), None);
    let flakes: Vec<Flake> = db
        .raw_range(IndexKind::Spot, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?;
    Ok(flakes
        .into_iter()
        .map(|f| ValueNode {
            value: f.o,
            dt: f.dt,
        })
        .collect())
}

async fn subjects_referring(db: &Db, predicate: &Sid, object: &Sid) -> Result<Vec<ValueNode>, Error> {
    let object_value = Value::Sid(object.clone());
    let any_uri = dt::any_uri();
    let bounds = component_bounds(
        IndexKind::Post,
        None,
        Some(predicate),
        Some((&object_value, &any_uri)),
    );
    let flakes: Vec<Flake> = db
        .raw_range(IndexKind::Post, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?;
    Ok(flakes
        .into_iter()
        .map(|f| ValueNode::reference(f.s))
        .collect())
}

/// Walk a linear property path from the focus node. Literals terminate a
/// branch; an unsupported segment makes the whole path vacuous.
async fn resolve_path(
    db: &Db,
    focus: &Sid,
    path: &[PathSegment],
) -> Result<Vec<ValueNode>, Error> {
    let mut nodes = vec![ValueNode::reference(focus.clone())];
    for segment in path {
        let mut next: Vec<ValueNode> = Vec::new();
        for node in &nodes {
            let subject = match node.as_sid() {
                Some(sid) => sid,
                None => continue,
            };
            let reached = match segment {
                PathSegment::Predicate(p) => objects_of(db, subject, p).await?,
                PathSegment::Inverse(p) => subjects_referring(db, p, subject).await?,
                PathSegment::Unsupported(_) => return Ok(Vec::new()),
            };
            for value in reached {
                if !next.contains(&value) {
                    next.push(value);
                }
            }
        }
        nodes = next;
    }
    Ok(nodes)
}

fn iri(db: &Db, sid: &Sid) -> String {
    db.sid_to_iri(sid).unwrap_or_else(|_| sid.to_string())
}

fn value_json(db: &Db, node: &ValueNode) -> serde_json::Value {
    match (&node.value, node.as_sid()) {
        (_, Some(sid)) => serde_json::json!({ "@id": iri(db, sid) }),
        (Value::String(s), _) => serde_json::Value::String(s.clone()),
        (Value::Long(n), _) => serde_json::Value::Number((*n).into()),
        (Value::Double(n), _) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(node.value.to_string())),
        (Value::Boolean(b), _) => serde_json::Value::Bool(*b),
        (other, _) => serde_json::Value::String(other.to_string()),
    }
}

/// Evaluate a node shape against one focus node, returning its results.
/// Cycles through nested shapes stop at already-visiting pairs.
fn eval_node_shape<'a>(
    ctx: &'a Ctx<'a>,
    shape: &'a NodeShape,
    focus: &'a Sid,
    visiting: &'a mut Vec<(Sid, Sid)>,
) -> BoxFuture<'a, Result<Vec<ValidationResult>, Error>> {
    async move {
        let key = (shape.sid.clone(), focus.clone());
        if visiting.contains(&key) {
            return Ok(Vec::new());
        }
        visiting.push(key);

        let mut results = Vec::new();

        if shape.closed {
            results.extend(eval_closed(ctx, shape, focus).await?);
        }
        for property in &shape.properties {
            let values = resolve_path(ctx.db, focus, &property.path).await?;
            for constraint in &property.constraints {
                results.extend(
                    eval_constraint(ctx, shape, property, constraint, focus, &values, visiting)
                        .await?,
                );
            }
        }

        visiting.pop();
        Ok(results)
    }
    .boxed()
}

/// Closed-world check: every predicate used on the focus node must be
/// covered by a property shape or explicitly ignored.
async fn eval_closed(
    ctx: &Ctx<'_>,
    shape: &NodeShape,
    focus: &Sid,
) -> Result<Vec<ValidationResult>, Error> {
    let covered: FxHashSet<&Sid> = shape
        .properties
        .iter()
        .filter_map(PropertyShape::covered_predicate)
        .chain(shape.ignored_properties.iter())
        .collect();

    let mut results = Vec::new();
    let mut seen: FxHashSet<Sid> = FxHashSet::default();
    for f in live_flakes(ctx.db, focus).await? {
        if covered.contains(&f.p) || !seen.insert(f.p.clone()) {
            continue;
        }
        results.push(ValidationResult {
            subject: iri(ctx.db, focus),
            path: iri(ctx.db, &f.p),
            constraint: "sh:closed".to_string(),
            shape: iri(ctx.db, &shape.sid),
            value: Some(value_json(
                ctx.db,
                &ValueNode {
                    value: f.o.clone(),
                    dt: f.dt.clone(),
                },
            )),
            expect: "no predicates outside the declared property shapes".to_string(),
            message: format!(
                "predicate {} is not covered by closed shape {}",
                iri(ctx.db, &f.p),
                iri(ctx.db, &shape.sid)
            ),
        });
    }
    Ok(results)
}

#[allow(clippy::too_many_arguments)]
fn eval_constraint<'a>(
    ctx: &'a Ctx<'a>,
    shape: &'a NodeShape,
    property: &'a PropertyShape,
    constraint: &'a Constraint,
    focus: &'a Sid,
    values: &'a [ValueNode],
    visiting: &'a mut Vec<(Sid, Sid)>,
) -> BoxFuture<'a, Result<Vec<ValidationResult>, Error>> {
    async move {
        let mut results = Vec::new();
        let mut fail = |value: Option<&ValueNode>, expect: String, message: String| {
            results.push(ValidationResult {
                subject: iri(ctx.db, focus),
                path: property.path_label(),
                constraint: constraint.component().to_string(),
                shape: iri(ctx.db, &shape.sid),
                value: value.map(|v| value_json(ctx.db, v)),
                expect,
                message,
            });
        };

        match constraint {
            Constraint::MinCount(min) => {
                if (values.len() as u64) < *min {
                    fail(
                        None,
                        format!("at least {min} values"),
                        format!(
                            "path {} has {} values, fewer than minCount {min}",
                            property.path_label(),
                            values.len()
                        ),
                    );
                }
            }
            Constraint::MaxCount(max) => {
                if (values.len() as u64) > *max {
                    fail(
                        None,
                        format!("at most {max} values"),
                        format!(
                            "path {} has {} values, more than maxCount {max}",
                            property.path_label(),
                            values.len()
                        ),
                    );
                }
            }
            Constraint::MinInclusive(bound, bound_dt) => {
                range_check(&mut fail, values, bound, bound_dt, "minInclusive", |ord| {
                    ord != Ordering::Less
                });
            }
            Constraint::MaxInclusive(bound, bound_dt) => {
                range_check(&mut fail, values, bound, bound_dt, "maxInclusive", |ord| {
                    ord != Ordering::Greater
                });
            }
            Constraint::MinExclusive(bound, bound_dt) => {
                range_check(&mut fail, values, bound, bound_dt, "minExclusive", |ord| {
                    ord == Ordering::Greater
                });
            }
            Constraint::MaxExclusive(bound, bound_dt) => {
                range_check(&mut fail, values, bound, bound_dt, "maxExclusive", |ord| {
                    ord == Ordering::Less
                });
            }
            Constraint::MinLength(min) => {
                for value in values {
                    match literal_text(value) {
                        Some(text) if text.chars().count() as u64 >= *min => (),
                        Some(text) => fail(
                            Some(value),
                            format!("length >= {min}"),
                            format!("value '{text}' is shorter than minLength {min}"),
                        ),
                        None => fail(
                            Some(value),
                            "a literal value".to_string(),
                            "minLength applies only to literals".to_string(),
                        ),
                    }
                }
            }
            Constraint::MaxLength(max) => {
                for value in values {
                    match literal_text(value) {
                        Some(text) if text.chars().count() as u64 <= *max => (),
                        Some(text) => fail(
                            Some(value),
                            format!("length <= {max}"),
                            format!("value '{text}' is longer than maxLength {max}"),
                        ),
                        None => fail(
                            Some(value),
                            "a literal value".to_string(),
                            "maxLength applies only to literals".to_string(),
                        ),
                    }
                }
            }
            Constraint::Pattern { source, regex } => {
                for value in values {
                    match literal_text(value) {
                        Some(text) if regex.is_match(&text) => (),
                        Some(text) => fail(
                            Some(value),
                            format!("a match of /{source}/"),
                            format!("value '{text}' does not match pattern /{source}/"),
                        ),
                        None => fail(
                            Some(value),
                            "a literal value".to_string(),
                            "pattern applies only to literals".to_string(),
                        ),
                    }
                }
            }
            Constraint::In(members) => {
                for value in values {
                    if !members.iter().any(|(v, d)| value.equals(v, d)) {
                        fail(
                            Some(value),
                            "a member of the sh:in list".to_string(),
                            format!("value {} is not an allowed member", value.value),
                        );
                    }
                }
            }
            Constraint::HasValue(expected, expected_dt) => {
                if !values.iter().any(|v| v.equals(expected, expected_dt)) {
                    fail(
                        None,
                        format!("at least one value equal to {expected}"),
                        format!(
                            "path {} is missing required value {expected}",
                            property.path_label()
                        ),
                    );
                }
            }
            Constraint::Datatype(expected) => {
                for value in values {
                    if &value.dt != expected {
                        fail(
                            Some(value),
                            iri(ctx.db, expected),
                            format!(
                                "value {} has datatype {}, expected {}",
                                value.value,
                                iri(ctx.db, &value.dt),
                                iri(ctx.db, expected)
                            ),
                        );
                    }
                }
            }
            Constraint::NodeKind(kind) => {
                for value in values {
                    if !node_kind_matches(*kind, value) {
                        fail(
                            Some(value),
                            kind.label().to_string(),
                            format!("value {} is not a {}", value.value, kind.label()),
                        );
                    }
                }
            }
            Constraint::Class(expected) => {
                for value in values {
                    let Some(sid) = value.as_sid() else {
                        fail(
                            Some(value),
                            "a reference node".to_string(),
                            "class constraint applies to references".to_string(),
                        );
                        continue;
                    };
                    let types: Vec<Sid> = live_flakes(ctx.db, sid)
                        .await?
                        .into_iter()
                        .filter(|f| f.p == dt::rdf_type())
                        .filter_map(|f| f.o.as_sid().cloned())
                        .collect();
                    for class in expected {
                        let closure = ctx.db.schema.class_closure(class);
                        if !types.iter().any(|t| closure.contains(t)) {
                            fail(
                                Some(value),
                                iri(ctx.db, class),
                                format!(
                                    "node {} is not an instance of {}",
                                    iri(ctx.db, sid),
                                    iri(ctx.db, class)
                                ),
                            );
                        }
                    }
                }
            }
            Constraint::Node(nested_sid) => {
                let nested = compile_shape(ctx.db, nested_sid, ctx.cache).await?;
                for value in values {
                    let Some(sid) = value.as_sid() else {
                        fail(
                            Some(value),
                            "a reference node".to_string(),
                            "node constraint applies to references".to_string(),
                        );
                        continue;
                    };
                    let inner = eval_node_shape(ctx, &nested, sid, visiting).await?;
                    if !inner.is_empty() {
                        fail(
                            Some(value),
                            format!("conformance to {}", iri(ctx.db, nested_sid)),
                            format!(
                                "node {} does not conform to shape {}",
                                iri(ctx.db, sid),
                                iri(ctx.db, nested_sid)
                            ),
                        );
                    }
                }
            }
            Constraint::QualifiedValueShape {
                shape: qualified_sid,
                min,
                max,
                disjoint,
            } => {
                let qualified = compile_shape(ctx.db, qualified_sid, ctx.cache).await?;

                // Sibling qualified shapes, for the disjointness carve-out.
                let siblings: Vec<Sid> = shape
                    .properties
                    .iter()
                    .filter(|p| p.sid != property.sid)
                    .flat_map(|p| p.constraints.iter())
                    .filter_map(|c| match c {
                        Constraint::QualifiedValueShape { shape, .. } => Some(shape.clone()),
                        _ => None,
                    })
                    .collect();

                let mut conforming: u64 = 0;
                for value in values {
                    let Some(sid) = value.as_sid() else { continue };
                    if !eval_node_shape(ctx, &qualified, sid, visiting).await?.is_empty() {
                        continue;
                    }
                    if *disjoint {
                        let mut taken = false;
                        for sibling_sid in &siblings {
                            let sibling = compile_shape(ctx.db, sibling_sid, ctx.cache).await?;
                            if eval_node_shape(ctx, &sibling, sid, visiting).await?.is_empty() {
                                taken = true;
                                break;
                            }
                        }
                        if taken {
                            continue;
                        }
                    }
                    conforming += 1;
                }

                if let Some(min) = min {
                    if conforming < *min {
                        fail(
                            None,
                            format!("at least {min} conforming values"),
                            format!(
                                "only {conforming} values conform to {}",
                                iri(ctx.db, qualified_sid)
                            ),
                        );
                    }
                }
                if let Some(max) = max {
                    if conforming > *max {
                        fail(
                            None,
                            format!("at most {max} conforming values"),
                            format!(
                                "{conforming} values conform to {}",
                                iri(ctx.db, qualified_sid)
                            ),
                        );
                    }
                }
            }
            Constraint::Equals(rhs) => {
                let others = objects_of(ctx.db, focus, rhs).await?;
                let missing = values.iter().any(|v| !others.iter().any(|o| o == v));
                let extra = others.iter().any(|o| !values.iter().any(|v| v == o));
                if missing || extra {
                    fail(
                        None,
                        format!("the same values as {}", iri(ctx.db, rhs)),
                        format!(
                            "path {} and {} hold different value sets",
                            property.path_label(),
                            iri(ctx.db, rhs)
                        ),
                    );
                }
            }
            Constraint::Disjoint(rhs) => {
                let others = objects_of(ctx.db, focus, rhs).await?;
                for value in values {
                    if others.iter().any(|o| o == value) {
                        fail(
                            Some(value),
                            format!("no values shared with {}", iri(ctx.db, rhs)),
                            format!(
                                "value {} appears in both {} and {}",
                                value.value,
                                property.path_label(),
                                iri(ctx.db, rhs)
                            ),
                        );
                    }
                }
            }
            Constraint::LessThan(rhs) => {
                pair_order(ctx, &mut fail, property, focus, values, rhs, false).await?;
            }
            Constraint::LessThanOrEquals(rhs) => {
                pair_order(ctx, &mut fail, property, focus, values, rhs, true).await?;
            }
            Constraint::Not(inner_sid) => {
                let inner = compile_shape(ctx.db, inner_sid, ctx.cache).await?;
                if eval_node_shape(ctx, &inner, focus, visiting).await?.is_empty() {
                    fail(
                        None,
                        format!("non-conformance to {}", iri(ctx.db, inner_sid)),
                        format!(
                            "focus node {} conforms to negated shape {}",
                            iri(ctx.db, focus),
                            iri(ctx.db, inner_sid)
                        ),
                    );
                }
            }
        }
        Ok(results)
    }
    .boxed()
}

fn literal_text(value: &ValueNode) -> Option<String> {
    if value.as_sid().is_some() {
        return None;
    }
    Some(match &value.value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn node_kind_matches(kind: NodeKind, value: &ValueNode) -> bool {
    let (blank, reference) = match value.as_sid() {
        Some(sid) => (sid.is_blank(), true),
        None => (false, false),
    };
    match kind {
        NodeKind::BlankNode => blank,
        NodeKind::Iri => reference && !blank,
        NodeKind::Literal => !reference,
        NodeKind::BlankNodeOrIri => reference,
        NodeKind::IriOrLiteral => !blank,
        NodeKind::BlankNodeOrLiteral => blank || !reference,
    }
}

/// Range constraints compare numerics numerically and temporal values
/// chronologically; a value outside the bound's datatype family fails
/// outright.
fn range_check(
    fail: &mut impl FnMut(Option<&ValueNode>, String, String),
    values: &[ValueNode],
    bound: &Value,
    bound_dt: &Sid,
    component: &str,
    ok: impl Fn(Ordering) -> bool,
) {
    for value in values {
        match comparable(value, bound, bound_dt) {
            Some(ord) if ok(ord) => (),
            Some(_) => fail(
                Some(value),
                format!("{component} {bound}"),
                format!("value {} violates {component} {bound}", value.value),
            ),
            None => fail(
                Some(value),
                format!("a value comparable to {bound}"),
                format!(
                    "value {} is not comparable to {component} bound {bound}",
                    value.value
                ),
            ),
        }
    }
}

fn comparable(value: &ValueNode, bound: &Value, bound_dt: &Sid) -> Option<Ordering> {
    let numeric = dt::is_numeric(&value.dt) && dt::is_numeric(bound_dt);
    let temporal = dt::is_temporal(&value.dt) && dt::is_temporal(bound_dt);
    if !numeric && !temporal {
        return None;
    }
    match (&value.value, bound) {
        (Value::Long(_) | Value::Double(_), Value::Long(_) | Value::Double(_)) if numeric => {
            Some(value.value.as_f64()?.total_cmp(&bound.as_f64()?))
        }
        (Value::DateTime(l), Value::DateTime(r)) => Some(l.cmp(r)),
        (Value::Date(l), Value::Date(r)) => Some(l.cmp(r)),
        (Value::Time(l), Value::Time(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// lessThan / lessThanOrEquals: every value of the path must order below
/// (or at) every value of the sibling predicate; incomparable datatypes
/// fail the comparison form outright.
async fn pair_order(
    ctx: &Ctx<'_>,
    fail: &mut impl FnMut(Option<&ValueNode>, String, String),
    property: &PropertyShape,
    focus: &Sid,
    values: &[ValueNode],
    rhs: &Sid,
    or_equal: bool,
) -> Result<(), Error> {
    let others = objects_of(ctx.db, focus, rhs).await?;
    let relation = if or_equal { "<=" } else { "<" };
    for value in values {
        for other in &others {
            let ok = match comparable_pair(value, other) {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => or_equal,
                Some(Ordering::Greater) | None => false,
            };
            if !ok {
                fail(
                    Some(value),
                    format!("every value of {} {relation} those of {}", property.path_label(), iri(ctx.db, rhs)),
                    format!(
                        "value {} is not {relation} {} of {}",
                        value.value,
                        other.value,
                        iri(ctx.db, rhs)
                    ),
                );
            }
        }
    }
    Ok(())
}

fn comparable_pair(l: &ValueNode, r: &ValueNode) -> Option<Ordering> {
    if dt::is_numeric(&l.dt) && dt::is_numeric(&r.dt) {
        return Some(l.value.as_f64()?.total_cmp(&r.value.as_f64()?));
    }
    match (&l.value, &r.value) {
        (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::sh;
    use crate::ShapeCache;
    use flake::codes;
    use std::sync::Arc;
    use store::MemoryStore;

    fn sid(name: &str) -> Sid {
        Sid::new(9, name)
    }

    fn assert_flake(s: Sid, p: Sid, o: Value, datatype: Sid) -> Flake {
        Flake::new(s, p, o, datatype, 1, true, None)
    }

    fn ref_flake(s: Sid, p: Sid, o: Sid) -> Flake {
        assert_flake(s, p, Value::Sid(o), dt::any_uri())
    }

    /// A shape targeting ex:User with `schema:age xsd:integer`, maxCount 1,
    /// minInclusive 0.
    fn age_shape_flakes() -> Vec<Flake> {
        let shape = sid("UserShape");
        let property = Sid::new(codes::BLANK, "b0");
        vec![
            ref_flake(shape.clone(), dt::rdf_type(), sh("NodeShape")),
            ref_flake(shape.clone(), sh("targetClass"), sid("User")),
            ref_flake(shape.clone(), sh("property"), property.clone()),
            ref_flake(property.clone(), sh("path"), sid("age")),
            assert_flake(
                property.clone(),
                sh("maxCount"),
                Value::Long(1),
                dt::long(),
            ),
            assert_flake(
                property.clone(),
                sh("minInclusive"),
                Value::Long(0),
                dt::long(),
            ),
            ref_flake(property, sh("datatype"), dt::integer()),
        ]
    }

    fn user(s: &str, age: i64) -> Vec<Flake> {
        vec![
            ref_flake(sid(s), dt::rdf_type(), sid("User")),
            assert_flake(sid(s), sid("age"), Value::Long(age), dt::integer()),
        ]
    }

    fn db_with(flakes: Vec<Flake>) -> Db {
        Db::genesis("demo", Arc::new(MemoryStore::new())).with_flakes(1, &flakes, &[])
    }

    #[tokio::test]
    async fn test_conforming_subject_passes() {
        let mut flakes = age_shape_flakes();
        flakes.extend(user("alice", 30));
        let db = db_with(flakes);

        let modified = user("alice", 30);
        validate_transaction(&db, &modified, &ShapeCache::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_range_violation_reported() {
        let mut flakes = age_shape_flakes();
        flakes.extend(user("alice", -5));
        let db = db_with(flakes);

        let modified = user("alice", -5);
        let err = validate_transaction(&db, &modified, &ShapeCache::new())
            .await
            .unwrap_err();
        match err {
            Error::Violation(report) => {
                assert_eq!(report.results.len(), 1);
                assert_eq!(report.results[0].constraint, "sh:minInclusive");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_max_count_violation() {
        let mut flakes = age_shape_flakes();
        flakes.extend(user("alice", 30));
        flakes.push(assert_flake(
            sid("alice"),
            sid("age"),
            Value::Long(31),
            dt::integer(),
        ));
        let db = db_with(flakes.clone());

        let err = validate_transaction(&db, &flakes, &ShapeCache::new())
            .await
            .unwrap_err();
        match err {
            Error::Violation(report) => {
                assert!(report
                    .results
                    .iter()
                    .any(|r| r.constraint == "sh:maxCount"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_untargeted_subjects_are_ignored() {
        let mut flakes = age_shape_flakes();
        // No rdf:type ex:User: the shape does not target this subject.
        flakes.push(assert_flake(
            sid("bob"),
            sid("age"),
            Value::Long(-40),
            dt::integer(),
        ));
        let db = db_with(flakes.clone());
        validate_transaction(&db, &flakes, &ShapeCache::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_shape_rejects_stray_predicates() {
        let shape = sid("ClosedShape");
        let property = Sid::new(codes::BLANK, "b1");
        let mut flakes = vec![
            ref_flake(shape.clone(), dt::rdf_type(), sh("NodeShape")),
            ref_flake(shape.clone(), sh("targetClass"), sid("T")),
            assert_flake(shape.clone(), sh("closed"), Value::Boolean(true), dt::boolean()),
            ref_flake(shape.clone(), sh("ignoredProperties"), dt::rdf_type()),
            ref_flake(shape.clone(), sh("property"), property.clone()),
            ref_flake(property.clone(), sh("path"), sid("name")),
        ];
        flakes.push(ref_flake(sid("x"), dt::rdf_type(), sid("T")));
        flakes.push(assert_flake(
            sid("x"),
            sid("extra"),
            Value::String("nope".to_string()),
            dt::string(),
        ));
        let db = db_with(flakes.clone());

        let err = validate_transaction(&db, &flakes, &ShapeCache::new())
            .await
            .unwrap_err();
        let report = match err {
            Error::Violation(report) => report,
            other => panic!("unexpected {other:?}"),
        };
        assert!(report.results.iter().any(|r| r.constraint == "sh:closed"));
        assert!(err_mentions(&report, "extra"));
    }

    fn err_mentions(report: &ValidationReport, needle: &str) -> bool {
        report.results.iter().any(|r| r.message.contains(needle))
    }

    #[tokio::test]
    async fn test_pattern_and_flags() {
        let shape = sid("NameShape");
        let property = Sid::new(codes::BLANK, "b2");
        let mut flakes = vec![
            ref_flake(shape.clone(), dt::rdf_type(), sh("NodeShape")),
            ref_flake(shape.clone(), sh("targetClass"), sid("User")),
            ref_flake(shape.clone(), sh("property"), property.clone()),
            ref_flake(property.clone(), sh("path"), sid("name")),
            assert_flake(
                property.clone(),
                sh("pattern"),
                Value::String("^al".to_string()),
                dt::string(),
            ),
            assert_flake(
                property,
                sh("flags"),
                Value::String("i".to_string()),
                dt::string(),
            ),
        ];
        flakes.push(ref_flake(sid("alice"), dt::rdf_type(), sid("User")));
        flakes.push(assert_flake(
            sid("alice"),
            sid("name"),
            Value::String("ALICE".to_string()),
            dt::string(),
        ));
        let db = db_with(flakes.clone());
        // Case-insensitive flag makes "ALICE" match "^al".
        validate_transaction(&db, &flakes, &ShapeCache::new())
            .await
            .unwrap();
    }

    fn property_shape(shape: &str, path: Sid) -> (Sid, Vec<Flake>) {
        let shape = sid(shape);
        let property = Sid::new(codes::BLANK, format!("p-{}", shape.name));
        let flakes = vec![
            ref_flake(shape.clone(), dt::rdf_type(), sh("NodeShape")),
            ref_flake(shape.clone(), sh("targetClass"), sid("User")),
            ref_flake(shape.clone(), sh("property"), property.clone()),
            ref_flake(property.clone(), sh("path"), path),
        ];
        (property, flakes)
    }

    async fn expect_constraint(flakes: Vec<Flake>, modified: Vec<Flake>, component: &str) {
        let db = db_with(flakes);
        let err = validate_transaction(&db, &modified, &ShapeCache::new())
            .await
            .unwrap_err();
        match err {
            Error::Violation(report) => {
                assert!(
                    report.results.iter().any(|r| r.constraint == component),
                    "expected {component} in {report:?}"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_in_and_has_value() {
        let (property, mut flakes) = property_shape("TeamShape", sid("team"));
        flakes.push(assert_flake(
            property.clone(),
            sh("in"),
            Value::String("red".to_string()),
            dt::string(),
        ));
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            assert_flake(
                sid("x"),
                sid("team"),
                Value::String("mauve".to_string()),
                dt::string(),
            ),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:in").await;

        let (property, mut flakes) = property_shape("NameShape2", sid("name"));
        flakes.push(assert_flake(
            property,
            sh("hasValue"),
            Value::String("Ada".to_string()),
            dt::string(),
        ));
        let subject = vec![
            ref_flake(sid("y"), dt::rdf_type(), sid("User")),
            assert_flake(
                sid("y"),
                sid("name"),
                Value::String("Grace".to_string()),
                dt::string(),
            ),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:hasValue").await;
    }

    #[tokio::test]
    async fn test_node_kind() {
        let (property, mut flakes) = property_shape("RefShape", sid("knows"));
        flakes.push(ref_flake(property, sh("nodeKind"), sh("IRI")));
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            assert_flake(
                sid("x"),
                sid("knows"),
                Value::String("not a node".to_string()),
                dt::string(),
            ),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:nodeKind").await;
    }

    #[tokio::test]
    async fn test_class_accepts_subclasses() {
        let (property, mut flakes) = property_shape("PetShape", sid("pet"));
        flakes.push(ref_flake(property, sh("class"), sid("Animal")));
        flakes.push(ref_flake(
            sid("Dog"),
            Sid::new(codes::RDFS, "subClassOf"),
            sid("Animal"),
        ));
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            ref_flake(sid("x"), sid("pet"), sid("rex")),
            ref_flake(sid("rex"), dt::rdf_type(), sid("Dog")),
        ];
        flakes.extend(subject.clone());
        let db = db_with(flakes);
        validate_transaction(&db, &subject, &ShapeCache::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_class_rejects_untyped_target() {
        let (property, mut flakes) = property_shape("PetShape2", sid("pet"));
        flakes.push(ref_flake(property, sh("class"), sid("Animal")));
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            ref_flake(sid("x"), sid("pet"), sid("pebble")),
            ref_flake(sid("pebble"), dt::rdf_type(), sid("Rock")),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:class").await;
    }

    #[tokio::test]
    async fn test_nested_node_shape() {
        let (property, mut flakes) = property_shape("FriendShape", sid("knows"));
        // Friends must themselves carry a non-negative age.
        let nested = sid("AgedShape");
        let nested_property = Sid::new(codes::BLANK, "aged");
        flakes.push(ref_flake(property, sh("node"), nested.clone()));
        flakes.extend(vec![
            ref_flake(nested.clone(), sh("property"), nested_property.clone()),
            ref_flake(nested_property.clone(), sh("path"), sid("age")),
            assert_flake(
                nested_property,
                sh("minCount"),
                Value::Long(1),
                dt::long(),
            ),
        ]);
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            ref_flake(sid("x"), sid("knows"), sid("ageless")),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:node").await;
    }

    #[tokio::test]
    async fn test_not_inverts_conformance() {
        let (property, mut flakes) = property_shape("NotShape", sid("name"));
        // Negate a shape requiring a name: having one is the violation.
        let negated = sid("NamedShape");
        let negated_property = Sid::new(codes::BLANK, "named");
        flakes.push(ref_flake(property, sh("not"), negated.clone()));
        flakes.extend(vec![
            ref_flake(negated.clone(), sh("property"), negated_property.clone()),
            ref_flake(negated_property.clone(), sh("path"), sid("name")),
            assert_flake(negated_property, sh("minCount"), Value::Long(1), dt::long()),
        ]);
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            assert_flake(
                sid("x"),
                sid("name"),
                Value::String("Ada".to_string()),
                dt::string(),
            ),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:not").await;
    }

    #[tokio::test]
    async fn test_less_than_orders_pairs() {
        let (property, mut flakes) = property_shape("SpanShape", sid("start"));
        flakes.push(ref_flake(property, sh("lessThan"), sid("end")));
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            assert_flake(sid("x"), sid("start"), Value::Long(9), dt::long()),
            assert_flake(sid("x"), sid("end"), Value::Long(3), dt::long()),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:lessThan").await;
    }

    #[tokio::test]
    async fn test_qualified_min_count() {
        let (property, mut flakes) = property_shape("CrewShape", sid("member"));
        let qualified = sid("PilotShape");
        let qualified_property = Sid::new(codes::BLANK, "pilot");
        flakes.push(ref_flake(
            property.clone(),
            sh("qualifiedValueShape"),
            qualified.clone(),
        ));
        flakes.push(assert_flake(
            property,
            sh("qualifiedMinCount"),
            Value::Long(1),
            dt::long(),
        ));
        flakes.extend(vec![
            ref_flake(qualified.clone(), sh("property"), qualified_property.clone()),
            ref_flake(qualified_property.clone(), sh("path"), sid("license")),
            assert_flake(
                qualified_property,
                sh("minCount"),
                Value::Long(1),
                dt::long(),
            ),
        ]);
        // One member, unlicensed: zero qualified values.
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            ref_flake(sid("x"), sid("member"), sid("casey")),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:qualifiedValueShape").await;
    }

    #[tokio::test]
    async fn test_target_node_and_objects_of() {
        // targetNode pins one subject regardless of type.
        let shape = sid("PinShape");
        let property = Sid::new(codes::BLANK, "pin");
        let mut flakes = vec![
            ref_flake(shape.clone(), dt::rdf_type(), sh("NodeShape")),
            ref_flake(shape.clone(), sh("targetNode"), sid("pinned")),
            ref_flake(shape.clone(), sh("property"), property.clone()),
            ref_flake(property.clone(), sh("path"), sid("name")),
            assert_flake(property, sh("minCount"), Value::Long(1), dt::long()),
        ];
        let subject = vec![assert_flake(
            sid("pinned"),
            sid("other"),
            Value::Long(1),
            dt::long(),
        )];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:minCount").await;

        // targetObjectsOf focuses the referenced node, not the referrer.
        let shape = sid("TargetShape");
        let property = Sid::new(codes::BLANK, "tgt");
        let mut flakes = vec![
            ref_flake(shape.clone(), dt::rdf_type(), sh("NodeShape")),
            ref_flake(shape.clone(), sh("targetObjectsOf"), sid("manages")),
            ref_flake(shape.clone(), sh("property"), property.clone()),
            ref_flake(property.clone(), sh("path"), sid("name")),
            assert_flake(property, sh("minCount"), Value::Long(1), dt::long()),
        ];
        let subject = vec![ref_flake(sid("boss"), sid("manages"), sid("worker"))];
        flakes.extend(subject.clone());
        let db = db_with(flakes);
        let err = validate_transaction(&db, &subject, &ShapeCache::new())
            .await
            .unwrap_err();
        match err {
            Error::Violation(report) => {
                assert!(report.results.iter().any(|r| r.subject.ends_with("worker")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inverse_path() {
        // Every user must be known by someone.
        let shape = sid("KnownShape");
        let property = Sid::new(codes::BLANK, "known");
        let inverse = Sid::new(codes::BLANK, "inv");
        let mut flakes = vec![
            ref_flake(shape.clone(), dt::rdf_type(), sh("NodeShape")),
            ref_flake(shape.clone(), sh("targetClass"), sid("User")),
            ref_flake(shape.clone(), sh("property"), property.clone()),
            ref_flake(property.clone(), sh("path"), inverse.clone()),
            ref_flake(inverse, sh("inversePath"), sid("knows")),
            assert_flake(property, sh("minCount"), Value::Long(1), dt::long()),
        ];
        let known = vec![
            ref_flake(sid("popular"), dt::rdf_type(), sid("User")),
            ref_flake(sid("fan"), sid("knows"), sid("popular")),
        ];
        flakes.extend(known.clone());
        let db = db_with(flakes.clone());
        validate_transaction(&db, &known, &ShapeCache::new())
            .await
            .unwrap();

        let unknown = vec![ref_flake(sid("hermit"), dt::rdf_type(), sid("User"))];
        flakes.extend(unknown.clone());
        expect_constraint(flakes, unknown, "sh:minCount").await;
    }

    #[tokio::test]
    async fn test_quoted_pattern_flag() {
        let (property, mut flakes) = property_shape("LiteralDot", sid("code"));
        flakes.push(assert_flake(
            property.clone(),
            sh("pattern"),
            Value::String("a.b".to_string()),
            dt::string(),
        ));
        flakes.push(assert_flake(
            property,
            sh("flags"),
            Value::String("q".to_string()),
            dt::string(),
        ));
        // With q, the dot is literal: "axb" no longer matches.
        let subject = vec![
            ref_flake(sid("x"), dt::rdf_type(), sid("User")),
            assert_flake(
                sid("x"),
                sid("code"),
                Value::String("axb".to_string()),
                dt::string(),
            ),
        ];
        flakes.extend(subject.clone());
        expect_constraint(flakes, subject, "sh:pattern").await;
    }
}
