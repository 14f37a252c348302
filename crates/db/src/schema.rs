use fxhash::{FxHashMap, FxHashSet};

use flake::{codes, Flake, Sid, Value};

/// The schema view hydrated from vocabulary flakes: the subclass graph for
/// class-pattern expansion, and the set of shape subjects for validation
/// targeting. Rehydrated only when a transaction touches the vocabulary.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// class -> direct subclasses.
    subclasses: FxHashMap<Sid, FxHashSet<Sid>>,
    /// Subjects carrying shacl statements.
    shapes: FxHashSet<Sid>,
    /// Transaction of the last hydration.
    pub t: i64,
}

/// A vocabulary flake changes the schema view: any shacl-namespace
/// predicate, and rdfs:subClassOf edges.
pub fn is_vocab_flake(f: &Flake) -> bool {
    f.p.namespace == codes::SHACL
        || (f.p.namespace == codes::RDFS && f.p.name == "subClassOf")
        || matches!(&f.o, Value::Sid(o) if f.p.namespace == codes::RDF
            && f.p.name == "type"
            && o.namespace == codes::SHACL)
}

impl Schema {
    /// Fold a transaction's vocabulary statements into a successor view.
    pub fn hydrate(&self, t: i64, adds: &[Flake], removes: &[Flake]) -> Schema {
        let mut next = self.clone();
        next.t = t;

        for f in removes.iter().chain(adds.iter().filter(|f| !f.op)) {
            if let (true, Value::Sid(object)) = (is_subclass_edge(f), &f.o) {
                if let Some(subs) = next.subclasses.get_mut(object) {
                    subs.remove(&f.s);
                }
            }
        }
        for f in adds.iter().filter(|f| f.op) {
            if let (true, Value::Sid(object)) = (is_subclass_edge(f), &f.o) {
                next.subclasses
                    .entry(object.clone())
                    .or_default()
                    .insert(f.s.clone());
            }
            if f.p.namespace == codes::SHACL
                || matches!(&f.o, Value::Sid(o) if o.namespace == codes::SHACL)
            {
                next.shapes.insert(f.s.clone());
            }
        }
        next
    }

    pub fn is_shape(&self, sid: &Sid) -> bool {
        self.shapes.contains(sid)
    }

    pub fn shapes(&self) -> impl Iterator<Item = &Sid> {
        self.shapes.iter()
    }

    /// The class plus every transitive subclass, for class-pattern fanout.
    pub fn class_closure(&self, class: &Sid) -> Vec<Sid> {
        let mut seen: FxHashSet<Sid> = FxHashSet::default();
        let mut queue = vec![class.clone()];
        while let Some(cls) = queue.pop() {
            if !seen.insert(cls.clone()) {
                continue;
            }
            if let Some(subs) = self.subclasses.get(&cls) {
                queue.extend(subs.iter().cloned());
            }
        }
        let mut closure: Vec<Sid> = seen.into_iter().collect();
        closure.sort();
        closure
    }
}

fn is_subclass_edge(f: &Flake) -> bool {
    f.p.namespace == codes::RDFS && f.p.name == "subClassOf"
}
