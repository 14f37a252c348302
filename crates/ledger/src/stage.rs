use futures::TryStreamExt;
use fxhash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use db::reads::{component_bounds, predicate_span};
use db::{Db, Head, IndexRoots, Stats};
use flake::{codes, coerce, compare_obj, dt, Flake, IndexKind, Namespaces, Sid, Value};
use index::{refresh_all, Config, IndexRoot, RangeOpts, StatusLock, WatchEvent, Watchers};
use query::{Match, Pattern, Query, Term};
use shapes::{compile_shape, Constraint, ShapeCache};
use store::{Address, ArtifactKind, Store};

use crate::assemble::{assemble_data, flakes_to_nodes};
use crate::commit::{
    commit_meta_flakes, read_commit_entry, read_data, write_commit, CommitDoc, CommitRef, DataDoc,
    DataRef, IndexDoc, COMMIT_VERSION,
};
use crate::merge::{merge_commit, trace_commits};
use crate::txn::{TripleTemplate, Txn};
use crate::Error;

/// Options for producing a commit point.
#[derive(Debug, Clone, Default)]
pub struct CommitOpts {
    pub message: Option<String>,
    pub issuer: Option<String>,
    /// Commit timestamp; the current wall clock when absent.
    pub time: Option<String>,
}

struct HeadState {
    db: Db,
    commit: Option<CommitRef>,
    index: Option<IndexDoc>,
    /// Superseded index documents, capped at `max_old_indexes`.
    old_indexes: VecDeque<Address>,
}

/// One branch of one ledger: the single writer over its commit chain.
/// `stage` produces candidate snapshots; `commit` alone advances the head.
pub struct Ledger {
    pub alias: String,
    pub branch: String,
    store: Arc<dyn Store>,
    cfg: Config,
    head: RwLock<HeadState>,
    shape_cache: ShapeCache,
    indexer_lock: StatusLock<i64>,
    watchers: Watchers,
}

impl Ledger {
    /// A fresh ledger over an empty branch.
    pub fn create(
        store: Arc<dyn Store>,
        alias: impl Into<String>,
        cfg: Config,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let alias = alias.into();
        let db = Db::genesis(alias.clone(), store.clone());
        Ok(Self {
            alias,
            branch: "main".to_string(),
            store,
            cfg,
            head: RwLock::new(HeadState {
                db,
                commit: None,
                index: None,
                old_indexes: VecDeque::new(),
            }),
            shape_cache: ShapeCache::new(),
            indexer_lock: StatusLock::new(),
            watchers: Watchers::new(),
        })
    }

    /// Load a ledger from its published head: restore namespaces and index
    /// roots, rebuild the schema from the vocabulary, and replay every
    /// commit newer than the persisted index.
    pub async fn load(
        store: Arc<dyn Store>,
        alias: impl Into<String>,
        cfg: Config,
    ) -> Result<Self, Error> {
        let ledger = Self::create(store.clone(), alias, cfg)?;

        let address = match store.lookup(&ledger.head_path()).await? {
            Some(address) => address,
            None => return Ok(ledger),
        };
        let (head_doc, head_ref) = read_commit_entry(store.as_ref(), &address).await?;
        let head_data = read_data(store.as_ref(), &head_doc.data.address).await?;

        let namespaces = Namespaces::bootstrap()
            .with_prefixes_in_order(head_data.namespaces.iter().map(String::as_str));

        let (roots, indexed_t) = match &head_doc.index {
            Some(index_doc) => (
                read_index_roots(store.as_ref(), index_doc).await?,
                index_doc.t,
            ),
            None => (IndexRoots::genesis(), 0),
        };

        let mut base = Db::genesis(ledger.alias.clone(), store.clone());
        base.t = indexed_t;
        base.indexes = roots;
        base.head.indexed_t = indexed_t;
        base = base.with_namespaces(namespaces);
        base.schema = Arc::new(rebuild_schema(&base).await?);

        let chain = trace_commits(store.as_ref(), &address, indexed_t + 1).await?;
        let mut current = base;
        for (doc, reference, data) in &chain {
            current = merge_commit(&current, doc, reference, data, &ledger.shape_cache).await?;
        }

        // The head commit's summary numbers are authoritative for the
        // whole database, indexed flakes included.
        current.stats = Stats {
            flakes: head_doc.data.flakes,
            size: head_doc.data.size,
        };
        current.head = Head {
            t: head_doc.data.t,
            id: Some(head_ref.id.clone()),
            address: Some(head_ref.address.clone()),
            indexed_t,
        };

        let mut head = ledger.head.write().await;
        head.db = current;
        head.commit = Some(head_ref);
        head.index = head_doc.index.clone();
        drop(head);
        Ok(ledger)
    }

    pub fn head_path(&self) -> String {
        format!("{}/{}/head", self.alias, self.branch)
    }

    /// The current head snapshot.
    pub async fn db(&self) -> Db {
        self.head.read().await.db.clone()
    }

    pub fn watchers(&self) -> &Watchers {
        &self.watchers
    }

    /// Emit the terminal watcher event; further events reach no one.
    pub fn close(&self) {
        self.watchers.close();
    }

    /// Stage a transaction against the current head, producing a candidate
    /// snapshot that has passed coercion and shape validation.
    pub async fn stage(&self, txn: &Txn) -> Result<Db, Error> {
        let current = self.db().await;
        self.stage_db(&current, txn, None).await
    }

    /// Stage as an identity: the staged flakes must also pass the
    /// identity's modification policy.
    pub async fn stage_as(&self, identity: &str, txn: &Txn) -> Result<Db, Error> {
        let current = self.db().await;
        self.stage_db(&current, txn, Some(identity)).await
    }

    /// Stage an inbound JSON transaction document. The raw payload is
    /// recorded through the store's transaction channel before parsing, so
    /// the original request survives alongside what it became.
    pub async fn stage_json(&self, txn: &serde_json::Value) -> Result<Db, Error> {
        let payload = serde_json::to_vec(txn).expect("json values always serialize");
        let recorded = self.store.txn_write(&self.alias, &payload).await?;
        tracing::debug!(address = %recorded.address, "recorded transaction payload");
        self.stage(&Txn::from_json(txn)?).await
    }

    async fn stage_db(&self, current: &Db, txn: &Txn, identity: Option<&str>) -> Result<Db, Error> {
        let t = current.t + 1;
        if current.novelty.size > self.cfg.reindex_max_bytes {
            tracing::warn!(
                size = current.novelty.size,
                max = self.cfg.reindex_max_bytes,
                "novelty exceeds reindexMaxBytes; staging will proceed but indexing is overdue"
            );
        }
        let hints = datatype_hints(current, &self.shape_cache).await?;

        let (insert, deletes, clauses) = match txn {
            Txn::Insert(nodes) => (Some(nodes), &[] as &[TripleTemplate], &[] as &[Pattern]),
            Txn::Modify {
                insert,
                delete,
                clauses,
            } => (insert.as_ref(), delete.as_slice(), clauses.as_slice()),
        };

        let mut flakes: Vec<Flake> = Vec::new();
        let mut namespaces = current.namespaces.as_ref().clone();

        if let Some(nodes) = insert {
            let doc = DataDoc {
                t,
                assert: match nodes {
                    serde_json::Value::Array(nodes) => nodes.clone(),
                    node => vec![node.clone()],
                },
                retract: Vec::new(),
                namespaces: Vec::new(),
            };
            let assembled = assemble_data(current, &doc, &hints)?;
            namespaces = assembled.namespaces;
            flakes = assembled.flakes;
        }

        if !deletes.is_empty() {
            flakes.extend(self.retract_flakes(current, deletes, clauses, t).await?);
        }

        if flakes.is_empty() {
            return Err(Error::EmptyCommit);
        }

        let staged = current
            .with_namespaces(namespaces)
            .with_flakes(t, &flakes, &[]);

        shapes::validate_transaction(&staged, &flakes, &self.shape_cache).await?;

        if let Some(identity) = identity {
            let enforcer = policy::compile_enforcer(&staged, identity).await?;
            policy::allowed(&staged, &enforcer, &flakes).await?;
        }

        Ok(staged)
    }

    /// Resolve delete templates: run the where clause, instantiate each
    /// template per solution, and flip the matching live statements.
    async fn retract_flakes(
        &self,
        current: &Db,
        templates: &[TripleTemplate],
        clauses: &[Pattern],
        t: i64,
    ) -> Result<Vec<Flake>, Error> {
        let solutions: Vec<query::Solution> = if clauses.is_empty() {
            vec![query::Solution::new()]
        } else {
            query::search(
                current,
                Query {
                    values: Vec::new(),
                    patterns: clauses.to_vec(),
                },
                None,
            )
            .try_collect()
            .await?
        };

        let mut retracts: Vec<Flake> = Vec::new();
        for solution in &solutions {
            for template in templates {
                let Some(s) = bound_sid(current, &template.s, solution)? else {
                    continue;
                };
                let Some(p) = bound_sid(current, &template.p, solution)? else {
                    continue;
                };
                let object = bound_object(current, &template.o, solution)?;

                let bounds = component_bounds(IndexKind::Spot, Some(&s), Some(&p), None);
                let live: Vec<Flake> = current
                    .raw_range(IndexKind::Spot, bounds, RangeOpts::live(current.t))
                    .try_collect()
                    .await?;
                for f in live {
                    let matches = match &object {
                        None => true,
                        Some((value, datatype)) => {
                            compare_obj(&f.o, &f.dt, value, datatype) == std::cmp::Ordering::Equal
                        }
                    };
                    if matches {
                        retracts.push(f.flip_t(t));
                    }
                }
            }
        }
        Ok(retracts)
    }

    /// Advance the branch head: write the data and commit documents, push
    /// the head pointer, fold the commit's metadata statements in, and
    /// kick indexing if novelty has grown past its threshold.
    pub async fn commit(&self, staged: Db, opts: CommitOpts) -> Result<Db, Error> {
        let mut head = self.head.write().await;
        if staged.t != head.db.t + 1 {
            return Err(Error::InvalidCommit(format!(
                "staged t {} does not follow head t {}",
                staged.t, head.db.t
            )));
        }

        // This transaction's flakes are exactly the novelty at the staged t.
        let txn_flakes: Vec<Flake> = staged
            .novelty
            .tspo
            .iter()
            .filter(|f| f.t == staged.t)
            .cloned()
            .collect();
        let asserts: Vec<Flake> = txn_flakes.iter().filter(|f| f.op).cloned().collect();
        let retracts: Vec<Flake> = txn_flakes.iter().filter(|f| !f.op).cloned().collect();

        let data_doc = DataDoc {
            t: staged.t,
            assert: flakes_to_nodes(&staged, &asserts)?,
            retract: flakes_to_nodes(&staged, &retracts)?,
            namespaces: staged.namespaces.novel_prefixes(),
        };
        let data_bytes = serde_json::to_vec(&data_doc).expect("data documents always serialize");
        let data_result = self.store.write(&self.alias, &data_bytes).await?;

        let time = match opts.time {
            Some(time) => time,
            None => coerce::format_date_time(time::OffsetDateTime::now_utc()),
        };
        let doc = CommitDoc {
            v: COMMIT_VERSION,
            alias: self.alias.clone(),
            branch: self.branch.clone(),
            time: Some(time),
            message: opts.message,
            issuer: opts.issuer,
            previous: head.commit.clone(),
            data: DataRef {
                id: data_result.hash,
                address: data_result.address,
                t: staged.t,
                flakes: staged.stats.flakes,
                size: staged.stats.size,
            },
            index: head.index.clone(),
        };
        let commit_ref = write_commit(self.store.as_ref(), &self.alias, &doc).await?;
        self.store
            .push(&self.head_path(), &commit_ref.address)
            .await?;

        let meta = commit_meta_flakes(&doc, &commit_ref, staged.t);
        let mut committed = staged.with_flakes(staged.t, &meta, &[]);
        committed.head = Head {
            t: staged.t,
            id: Some(commit_ref.id.clone()),
            address: Some(commit_ref.address.clone()),
            indexed_t: committed.head.indexed_t,
        };

        head.db = committed.clone();
        head.commit = Some(commit_ref);
        drop(head);

        self.ensure_indexed().await?;
        Ok(self.db().await)
    }

    /// Merge a foreign commit chain whose head is `latest` into this
    /// branch, replaying every missing transaction in order.
    pub async fn merge_remote(&self, latest: &Address) -> Result<Db, Error> {
        let mut head = self.head.write().await;
        let chain = trace_commits(self.store.as_ref(), latest, head.db.t + 1).await?;

        let mut current = head.db.clone();
        for (doc, reference, data) in &chain {
            current = merge_commit(&current, doc, reference, data, &self.shape_cache).await?;
        }
        if let Some((_, reference, _)) = chain.last() {
            head.commit = Some(reference.clone());
        }
        head.db = current.clone();
        drop(head);

        self.ensure_indexed().await?;
        Ok(current)
    }

    /// Fold novelty into the index trees when it has outgrown the
    /// threshold. A single-slot lock serializes passes; a request landing
    /// while one runs leaves its target behind for the runner to pick up.
    async fn ensure_indexed(&self) -> Result<(), Error> {
        loop {
            let snapshot = self.db().await;
            if snapshot.novelty.size <= self.cfg.reindex_min_bytes {
                return Ok(());
            }
            if !self.indexer_lock.try_acquire(snapshot.t) {
                tracing::debug!(t = snapshot.t, "indexing in flight; left request pending");
                return Ok(());
            }

            let refreshed = self.run_refresh(&snapshot).await;
            let pending = self.indexer_lock.take_pending();
            self.indexer_lock.release();

            if let Err(error) = refreshed {
                // Indexing failures stay in the operator log; the next
                // pass retries from current state.
                tracing::error!(%error, t = snapshot.t, "index refresh failed");
                return Ok(());
            }
            match pending {
                Some(t) if t > snapshot.t => continue,
                _ => return Ok(()),
            }
        }
    }

    async fn run_refresh(&self, snapshot: &Db) -> Result<(), Error> {
        self.watchers.emit(&WatchEvent::IndexStart { t: snapshot.t });

        let outcome = refresh_all(
            self.store.as_ref(),
            &self.alias,
            snapshot.indexes.all(),
            &snapshot.novelty,
            &FxHashSet::default(),
            snapshot.t,
            &self.cfg,
        )
        .await?;

        let index_doc = write_index_roots(
            self.store.as_ref(),
            &self.alias,
            snapshot.t,
            &outcome.roots,
        )
        .await?;
        tracing::info!(
            t = snapshot.t,
            garbage = outcome.garbage.len(),
            "index refresh complete"
        );

        let mut head = self.head.write().await;
        head.db = head.db.with_index_roots(snapshot.t, outcome.roots);
        if let Some(old) = head.index.replace(index_doc) {
            head.old_indexes.push_back(old.spot);
            while head.old_indexes.len() > self.cfg.max_old_indexes as usize {
                head.old_indexes.pop_front();
            }
        }
        drop(head);

        self.watchers.emit(&WatchEvent::IndexEnd { t: snapshot.t });
        Ok(())
    }
}

/// Predicate-level datatype requirements declared by the current shapes,
/// applied during coercion so a shape's datatype travels with inserts.
pub(crate) async fn datatype_hints(
    db: &Db,
    cache: &ShapeCache,
) -> Result<FxHashMap<Sid, Sid>, Error> {
    let mut hints = FxHashMap::default();
    let shape_sids: Vec<Sid> = db.schema.shapes().cloned().collect();
    for shape_sid in shape_sids {
        let shape = compile_shape(db, &shape_sid, cache).await?;
        for property in &shape.properties {
            let declared = property.constraints.iter().find_map(|c| match c {
                Constraint::Datatype(datatype) => Some(datatype.clone()),
                _ => None,
            });
            if let (Some(predicate), Some(datatype)) = (property.covered_predicate(), declared) {
                hints.insert(predicate.clone(), datatype);
            }
        }
    }
    Ok(hints)
}

fn bound_sid(
    db: &Db,
    term: &Term,
    solution: &query::Solution,
) -> Result<Option<Sid>, Error> {
    match term {
        Term::Var(name) => Ok(solution.get(name).and_then(|m| m.as_sid().cloned())),
        Term::Iri(iri) => Ok(Some(db.namespaces.try_encode_iri(iri).map_err(|_| {
            Error::InvalidRetraction(format!("'{iri}' names nothing in this ledger"))
        })?)),
        Term::Value(_) => Ok(None),
    }
}

fn bound_object(
    db: &Db,
    term: &Term,
    solution: &query::Solution,
) -> Result<Option<(Value, Sid)>, Error> {
    match term {
        Term::Var(name) => Ok(solution.get(name).map(|m| match m {
            Match::Sid(sid) => (Value::Sid(sid.clone()), dt::any_uri()),
            Match::Val(value, datatype) => (value.clone(), datatype.clone()),
        })),
        Term::Iri(iri) => match db.namespaces.try_encode_iri(iri) {
            Ok(sid) => Ok(Some((Value::Sid(sid), dt::any_uri()))),
            Err(_) => Err(Error::InvalidRetraction(format!(
                "'{iri}' names nothing in this ledger"
            ))),
        },
        Term::Value(json) => {
            let datatype = coerce::infer(json, None);
            let value = coerce::coerce(json, &datatype)?;
            Ok(Some((value, datatype)))
        }
    }
}

async fn read_index_roots(store: &dyn Store, doc: &IndexDoc) -> Result<IndexRoots, Error> {
    let mut roots = IndexRoots::genesis();
    for address in [&doc.spot, &doc.post, &doc.opst, &doc.tspo] {
        let bytes = store.index_file_read(address).await.map_err(index::Error::from)?;
        let root: IndexRoot =
            serde_json::from_slice(&bytes).map_err(|source| Error::MalformedCommit {
                address: address.to_string(),
                source,
            })?;
        roots = roots.replace(vec![root]);
    }
    Ok(roots)
}

async fn write_index_roots(
    store: &dyn Store,
    ledger: &str,
    t: i64,
    roots: &[IndexRoot],
) -> Result<IndexDoc, Error> {
    let mut addresses: FxHashMap<IndexKind, Address> = FxHashMap::default();
    for root in roots {
        let bytes = serde_json::to_vec(root).expect("index roots always serialize");
        let result = store
            .index_file_write(ledger, ArtifactKind::Root, &bytes)
            .await
            .map_err(index::Error::from)?;
        addresses.insert(root.kind, result.address);
    }
    let mut take = |kind: IndexKind| -> Result<Address, Error> {
        addresses
            .remove(&kind)
            .ok_or_else(|| Error::InvalidCommit(format!("missing {} root", kind.name())))
    };
    Ok(IndexDoc {
        t,
        spot: take(IndexKind::Spot)?,
        post: take(IndexKind::Post)?,
        opst: take(IndexKind::Opst)?,
        tspo: take(IndexKind::Tspo)?,
    })
}

/// Rebuild the schema view from indexed vocabulary statements: subclass
/// edges, shacl-namespace predicates, and shacl-typed subjects.
async fn rebuild_schema(db: &Db) -> Result<db::Schema, Error> {
    let mut vocab: Vec<Flake> = Vec::new();

    let sub_class_of = Sid::new(codes::RDFS, "subClassOf");
    let bounds = component_bounds(IndexKind::Post, None, Some(&sub_class_of), None);
    let edges: Vec<Flake> = db
        .raw_range(IndexKind::Post, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?;
    vocab.extend(edges);

    let shacl_span = predicate_span(
        &Sid::new(codes::SHACL, ""),
        &Sid::new(codes::SHACL + 1, ""),
    );
    let shacl_flakes: Vec<Flake> = db
        .raw_range(IndexKind::Post, shacl_span, RangeOpts::live(db.t))
        .try_collect()
        .await?;
    vocab.extend(shacl_flakes);

    let rdf_type = dt::rdf_type();
    let bounds = component_bounds(IndexKind::Post, None, Some(&rdf_type), None);
    let typed: Vec<Flake> = db
        .raw_range(IndexKind::Post, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?;
    vocab.extend(
        typed
            .into_iter()
            .filter(|f| matches!(&f.o, Value::Sid(o) if o.namespace == codes::SHACL)),
    );

    Ok(db::Schema::default().hydrate(db.t, &vocab, &[]))
}
