use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use flake::{Flake, FlakeSet, IndexKind};
use store::{Address, ArtifactKind, Store};

use crate::Error;

/// A node's identity: unwritten nodes are `Empty`, written nodes carry
/// their content address. Rewriting a node always produces a new address,
/// which is what makes the tree persistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeId {
    Address(Address),
    Empty(EmptyMarker),
}

/// Serialized form of the `Empty` node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmptyMarker {
    #[serde(rename = "empty")]
    Empty,
}

impl NodeId {
    pub fn empty() -> Self {
        NodeId::Empty(EmptyMarker::Empty)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, NodeId::Empty(_))
    }

    pub fn address(&self) -> Option<&Address> {
        match self {
            NodeId::Address(address) => Some(address),
            NodeId::Empty(_) => None,
        }
    }
}

/// A lightweight reference to a child node, carried inside branches and as
/// the root pointer of each index. Bounds are half-open: a node covers
/// `[first, rhs)`, with the leftmost node unbounded below and a `None`
/// rhs unbounded above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub id: NodeId,
    pub leaf: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<Flake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhs: Option<Flake>,
    pub leftmost: bool,
    pub t: i64,
    pub size: u64,
}

impl ChildRef {
    /// The genesis reference: an unwritten, empty, leftmost leaf.
    pub fn genesis() -> Self {
        Self {
            id: NodeId::empty(),
            leaf: true,
            first: None,
            rhs: None,
            leftmost: true,
            t: 0,
            size: 0,
        }
    }

    /// Whether `f` falls inside this node's key range.
    pub fn covers(&self, kind: IndexKind, f: &Flake) -> bool {
        use std::cmp::Ordering;
        if !self.leftmost {
            if let Some(first) = &self.first {
                if kind.cmp(f, first) == Ordering::Less {
                    return false;
                }
            }
        }
        match &self.rhs {
            Some(rhs) => kind.cmp(f, rhs) == Ordering::Less,
            None => true,
        }
    }
}

/// The root pointer of one index tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRoot {
    pub kind: IndexKind,
    /// Transaction through which this tree is current.
    pub t: i64,
    pub node: ChildRef,
}

impl IndexRoot {
    pub fn genesis(kind: IndexKind) -> Self {
        Self {
            kind,
            t: 0,
            node: ChildRef::genesis(),
        }
    }
}

/// A leaf holds a sorted run of flakes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaf {
    pub id: NodeId,
    pub kind: IndexKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<Flake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhs: Option<Flake>,
    pub leftmost: bool,
    pub flakes: FlakeSet,
    pub t: i64,
    pub size: u64,
}

impl Leaf {
    pub fn empty(kind: IndexKind) -> Self {
        Self {
            id: NodeId::empty(),
            kind,
            first: None,
            rhs: None,
            leftmost: true,
            flakes: FlakeSet::empty(kind),
            t: 0,
            size: 0,
        }
    }

    pub fn to_ref(&self) -> ChildRef {
        ChildRef {
            id: self.id.clone(),
            leaf: true,
            first: self.first.clone(),
            rhs: self.rhs.clone(),
            leftmost: self.leftmost,
            t: self.t,
            size: self.size,
        }
    }
}

/// A branch routes by comparator over its children, which partition the
/// branch's key range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: NodeId,
    pub kind: IndexKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<Flake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhs: Option<Flake>,
    pub leftmost: bool,
    pub children: Vec<ChildRef>,
    pub t: i64,
    pub size: u64,
}

impl Branch {
    pub fn to_ref(&self) -> ChildRef {
        ChildRef {
            id: self.id.clone(),
            leaf: false,
            first: self.first.clone(),
            rhs: self.rhs.clone(),
            leftmost: self.leftmost,
            t: self.t,
            size: self.size,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Leaf),
    Branch(Branch),
}

/// Persisted payload of a leaf or branch. The node's own id is not part of
/// its content (the content hash *is* the id), so the wire form drops it.
#[derive(Debug, Serialize, Deserialize)]
struct NodeDoc {
    kind: IndexKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first: Option<Flake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rhs: Option<Flake>,
    leftmost: bool,
    t: i64,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flakes: Option<Vec<Flake>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    children: Option<Vec<ChildRef>>,
}

/// A memo of resolved nodes. Nodes are content-addressed and immutable,
/// so an address resolves to the same node forever; superseded addresses
/// simply stop being asked for.
#[derive(Debug, Default)]
pub struct NodeCache {
    inner: Mutex<FxHashMap<Address, Arc<Node>>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, address: &Address) -> Option<Arc<Node>> {
        self.inner
            .lock()
            .expect("node cache poisoned")
            .get(address)
            .cloned()
    }

    fn put(&self, address: Address, node: Arc<Node>) {
        self.inner
            .lock()
            .expect("node cache poisoned")
            .insert(address, node);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("node cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve through the cache, filling it on a miss.
pub async fn resolve_cached(
    store: &dyn Store,
    cache: Option<&NodeCache>,
    kind: IndexKind,
    child: &ChildRef,
) -> Result<Arc<Node>, Error> {
    let address = match (cache, child.id.address()) {
        (Some(_), Some(address)) => address.clone(),
        _ => return Ok(Arc::new(resolve(store, kind, child).await?)),
    };
    let cache = cache.expect("checked above");
    if let Some(node) = cache.get(&address) {
        return Ok(node);
    }
    let node = Arc::new(resolve(store, kind, child).await?);
    cache.put(address, node.clone());
    Ok(node)
}

/// Resolve a child reference into its node, reading from the store unless
/// the reference is the unwritten genesis leaf.
pub async fn resolve(store: &dyn Store, kind: IndexKind, child: &ChildRef) -> Result<Node, Error> {
    let address = match child.id.address() {
        None => {
            // Only the genesis leaf is legitimately unwritten.
            return Ok(Node::Leaf(Leaf::empty(kind)));
        }
        Some(address) => address,
    };

    let bytes = store.index_file_read(address).await?;
    let doc: NodeDoc = serde_json::from_slice(&bytes).map_err(|source| Error::CorruptNode {
        address: address.to_string(),
        source,
    })?;

    if child.leaf {
        let flakes = doc.flakes.unwrap_or_default();
        Ok(Node::Leaf(Leaf {
            id: child.id.clone(),
            kind: doc.kind,
            first: doc.first,
            rhs: doc.rhs,
            leftmost: doc.leftmost,
            flakes: FlakeSet::from_unsorted(kind, flakes),
            t: doc.t,
            size: doc.size,
        }))
    } else {
        Ok(Node::Branch(Branch {
            id: child.id.clone(),
            kind: doc.kind,
            first: doc.first,
            rhs: doc.rhs,
            leftmost: doc.leftmost,
            children: doc.children.unwrap_or_default(),
            t: doc.t,
            size: doc.size,
        }))
    }
}

/// Write a leaf, returning its content-addressed reference.
pub async fn write_leaf(
    store: &dyn Store,
    ledger: &str,
    leaf: &Leaf,
) -> Result<(ChildRef, Address), Error> {
    let doc = NodeDoc {
        kind: leaf.kind,
        first: leaf.first.clone(),
        rhs: leaf.rhs.clone(),
        leftmost: leaf.leftmost,
        t: leaf.t,
        size: leaf.size,
        flakes: Some(leaf.flakes.as_slice().to_vec()),
        children: None,
    };
    let bytes = serde_json::to_vec(&doc).expect("index nodes always serialize");
    let result = store
        .index_file_write(ledger, ArtifactKind::Leaf, &bytes)
        .await?;

    let mut reference = leaf.to_ref();
    reference.id = NodeId::Address(result.address.clone());
    Ok((reference, result.address))
}

/// Write a branch. Its children must already be written: a branch never
/// persists a placeholder child id.
pub async fn write_branch(
    store: &dyn Store,
    ledger: &str,
    branch: &Branch,
) -> Result<(ChildRef, Address), Error> {
    debug_assert!(
        branch.children.iter().all(|c| !c.id.is_empty()),
        "child writes complete before parent writes"
    );
    let doc = NodeDoc {
        kind: branch.kind,
        first: branch.first.clone(),
        rhs: branch.rhs.clone(),
        leftmost: branch.leftmost,
        t: branch.t,
        size: branch.size,
        flakes: None,
        children: Some(branch.children.clone()),
    };
    let bytes = serde_json::to_vec(&doc).expect("index nodes always serialize");
    let result = store
        .index_file_write(ledger, ArtifactKind::Branch, &bytes)
        .await?;

    let mut reference = branch.to_ref();
    reference.id = NodeId::Address(result.address.clone());
    Ok((reference, result.address))
}
