//! The policy engine: per-identity visibility and modification rules.
//! Policies are ordinary subjects of type `f:Policy`; wrapping a snapshot
//! resolves the identity's roles, compiles the applicable rules, and
//! installs a visibility filter that silently redacts forbidden flakes
//! from queries. Transactions, by contrast, fail hard on a forbidden
//! flake.

use futures::TryStreamExt;
use fxhash::FxHashMap;
use std::sync::{Arc, Mutex};

use db::reads::component_bounds;
use db::{Db, VisibilityFilter};
use flake::{codes, dt, Flake, IndexKind, Sid, Value};
use index::RangeOpts;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("policy prevents modification of {subject}")]
    Violation { subject: String },
    #[error("identity '{0}' is unknown to this ledger")]
    UnknownIdentity(String),
    #[error(transparent)]
    Db(#[from] db::Error),
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::Violation { .. } | Error::UnknownIdentity(_) => 400,
            Error::Db(inner) => inner.status(),
        }
    }
}

/// Ledger-vocabulary identifier.
pub fn f(name: &str) -> Sid {
    Sid::new(codes::LEDGER, name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    View,
    Modify,
}

/// One allow rule: which roles it grants, which actions, and an optional
/// equals clause gating the grant on a path from the acting identity.
#[derive(Debug, Clone)]
pub struct AllowRule {
    pub roles: Vec<Sid>,
    pub actions: Vec<Action>,
    /// Path predicates following the `f:$identity` marker.
    pub equals_path: Option<Vec<Sid>>,
}

impl AllowRule {
    fn grants(&self, roles: &[Sid], action: Action) -> bool {
        let role_ok = self.roles.is_empty() || self.roles.iter().any(|r| roles.contains(r));
        role_ok && self.actions.contains(&action)
    }
}

/// A per-predicate rule within a policy.
#[derive(Debug, Clone)]
pub struct PropertyRule {
    pub predicate: Sid,
    pub allow: Vec<AllowRule>,
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub sid: Sid,
    pub target_class: Vec<Sid>,
    pub target_node: Vec<Sid>,
    pub allow: Vec<AllowRule>,
    pub properties: Vec<PropertyRule>,
}

impl Policy {
    fn unrestricted_target(&self) -> bool {
        self.target_class.is_empty() && self.target_node.is_empty()
    }
}

/// The compiled rule set for one acting identity, carrying a memo of
/// evaluated equals-path results.
#[derive(Debug)]
pub struct Enforcer {
    pub identity: Sid,
    pub roles: Vec<Sid>,
    policies: Vec<Policy>,
    cache: Mutex<FxHashMap<(Sid, Sid, Action), bool>>,
}

#[async_trait::async_trait]
impl VisibilityFilter for Enforcer {
    async fn allow(&self, db: &Db, flake: &Flake) -> bool {
        // Queries never fail on policy: a forbidden flake is filtered.
        self.check(db, flake, Action::View).await.unwrap_or(false)
    }
}

/// Compile the rule set for one acting identity.
pub async fn compile_enforcer(db: &Db, identity_iri: &str) -> Result<Arc<Enforcer>, Error> {
    let identity = db
        .iri_to_sid(identity_iri)
        .map_err(|_| Error::UnknownIdentity(identity_iri.to_string()))?;

    let roles: Vec<Sid> = objects_of(db, &identity, &f("role"))
        .await?
        .into_iter()
        .filter_map(|v| v.as_sid().cloned())
        .collect();

    let mut policies = Vec::new();
    for policy_sid in subjects_of_type(db, &f("Policy")).await? {
        policies.push(compile_policy(db, &policy_sid).await?);
    }
    tracing::debug!(
        identity = identity_iri,
        roles = roles.len(),
        policies = policies.len(),
        "compiled policy enforcer"
    );

    Ok(Arc::new(Enforcer {
        identity,
        roles,
        policies,
        cache: Mutex::new(FxHashMap::default()),
    }))
}

/// Install a policy filter for `identity` on the snapshot: resolve its
/// roles and compile every `f:Policy` subject.
pub async fn wrap_policy(db: &Db, identity_iri: &str) -> Result<Db, Error> {
    let enforcer = compile_enforcer(db, identity_iri).await?;
    Ok(db.with_policy(enforcer))
}

/// Check every staged flake for the acting identity; the first forbidden
/// one aborts the transaction.
pub async fn allowed(db: &Db, enforcer: &Enforcer, staged: &[Flake]) -> Result<(), Error> {
    for flake in staged {
        if !enforcer.check(db, flake, Action::Modify).await? {
            return Err(Error::Violation {
                subject: db
                    .sid_to_iri(&flake.s)
                    .unwrap_or_else(|_| flake.s.to_string()),
            });
        }
    }
    Ok(())
}

/// Whether the current policy permits viewing the subject at all.
pub async fn allow_iri(db: &Db, enforcer: &Enforcer, iri: &str) -> Result<bool, Error> {
    let sid = match db.iri_to_sid(iri) {
        Ok(sid) => sid,
        Err(_) => return Ok(false),
    };
    let probe = Flake::new(
        sid,
        dt::rdf_type(),
        Value::Sid(f("Anything")),
        dt::any_uri(),
        db.t,
        true,
        None,
    );
    enforcer.check(db, &probe, Action::View).await
}

impl Enforcer {
    async fn check(&self, db: &Db, flake: &Flake, action: Action) -> Result<bool, Error> {
        let key = (flake.s.clone(), flake.p.clone(), action);
        if let Some(hit) = self.cache.lock().expect("policy cache poisoned").get(&key) {
            return Ok(*hit);
        }

        let mut allowed = false;
        for policy in &self.policies {
            if !self.applies_to(db, policy, &flake.s).await? {
                continue;
            }
            // A predicate governed by property rules answers only to them;
            // otherwise the policy's node-level allow rules decide.
            let property_rules: Vec<&PropertyRule> = policy
                .properties
                .iter()
                .filter(|rule| rule.predicate == flake.p)
                .collect();
            let rules: Vec<&AllowRule> = if property_rules.is_empty() {
                policy.allow.iter().collect()
            } else {
                property_rules.iter().flat_map(|r| r.allow.iter()).collect()
            };
            for rule in rules {
                if !rule.grants(&self.roles, action) {
                    continue;
                }
                let equals_ok = match &rule.equals_path {
                    None => true,
                    Some(path) => self.equals_path_reaches(db, path, &flake.s).await?,
                };
                if equals_ok {
                    allowed = true;
                    break;
                }
            }
            if allowed {
                break;
            }
        }

        self.cache
            .lock()
            .expect("policy cache poisoned")
            .insert(key, allowed);
        Ok(allowed)
    }

    async fn applies_to(&self, db: &Db, policy: &Policy, subject: &Sid) -> Result<bool, Error> {
        if policy.unrestricted_target() || policy.target_node.contains(subject) {
            return Ok(true);
        }
        if policy.target_class.is_empty() {
            return Ok(false);
        }
        let types = objects_of(db, subject, &dt::rdf_type()).await?;
        Ok(types
            .iter()
            .filter_map(|v| v.as_sid())
            .any(|t| policy.target_class.contains(t)))
    }

    /// Walk the equals path from the acting identity, taking the first
    /// reference object at every hop, and compare the final node against
    /// the flake's subject.
    async fn equals_path_reaches(
        &self,
        db: &Db,
        path: &[Sid],
        subject: &Sid,
    ) -> Result<bool, Error> {
        let mut node = self.identity.clone();
        for predicate in path {
            let objects = objects_of(db, &node, predicate).await?;
            let refs: Vec<&Sid> = objects.iter().filter_map(|v| v.as_sid()).collect();
            if refs.len() > 1 {
                tracing::warn!(
                    predicate = %predicate,
                    count = refs.len(),
                    "equals path hop is multi-valued; taking the first reference"
                );
            }
            match refs.first() {
                Some(next) => node = (*next).clone(),
                None => return Ok(false),
            }
        }
        Ok(&node == subject)
    }
}

async fn objects_of(db: &Db, subject: &Sid, predicate: &Sid) -> Result<Vec<Value>, Error> {
    let bounds = component_bounds(IndexKind::Spot, Some(subject), Some(predicate), None);
    let flakes: Vec<Flake> = db
        .raw_range(IndexKind::Spot, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?;
    Ok(flakes.into_iter().map(|f| f.o).collect())
}

async fn subjects_of_type(db: &Db, class: &Sid) -> Result<Vec<Sid>, Error> {
    let object = Value::Sid(class.clone());
    let any_uri = dt::any_uri();
    let bounds = component_bounds(
        IndexKind::Post,
        None,
        Some(&dt::rdf_type()),
        Some((&object, &any_uri)),
    );
    let flakes: Vec<Flake> = db
        .raw_range(IndexKind::Post, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?;
    let mut subjects: Vec<Sid> = Vec::new();
    for f in flakes {
        if !subjects.contains(&f.s) {
            subjects.push(f.s);
        }
    }
    Ok(subjects)
}

async fn compile_policy(db: &Db, sid: &Sid) -> Result<Policy, Error> {
    let flakes = subject_flakes_raw(db, sid).await?;

    let mut allow = Vec::new();
    for rule_sid in refs_of(&flakes, &f("allow")) {
        allow.push(compile_allow(db, &rule_sid).await?);
    }

    let mut properties = Vec::new();
    for property_sid in refs_of(&flakes, &f("property")) {
        let property_flakes = subject_flakes_raw(db, &property_sid).await?;
        let predicate = match refs_of(&property_flakes, &f("path")).into_iter().next() {
            Some(p) => p,
            None => continue,
        };
        let mut rules = Vec::new();
        for rule_sid in refs_of(&property_flakes, &f("allow")) {
            rules.push(compile_allow(db, &rule_sid).await?);
        }
        properties.push(PropertyRule {
            predicate,
            allow: rules,
        });
    }

    Ok(Policy {
        sid: sid.clone(),
        target_class: refs_of(&flakes, &f("targetClass")),
        target_node: refs_of(&flakes, &f("targetNode")),
        allow,
        properties,
    })
}

async fn compile_allow(db: &Db, sid: &Sid) -> Result<AllowRule, Error> {
    let flakes = subject_flakes_raw(db, sid).await?;

    let actions: Vec<Action> = refs_of(&flakes, &f("action"))
        .into_iter()
        .filter_map(|a| match (a.namespace, a.name.as_str()) {
            (codes::LEDGER, "view") => Some(Action::View),
            (codes::LEDGER, "modify") => Some(Action::Modify),
            _ => None,
        })
        .collect();

    // The equals clause is a list: [f:$identity, p1, p2, ...].
    let mut equals_members: Vec<&Flake> =
        flakes.iter().filter(|flake| flake.p == f("equals")).collect();
    equals_members.sort_by_key(|flake| flake.m.as_ref().and_then(|m| m.i));
    let equals_path = if equals_members.is_empty() {
        None
    } else {
        Some(
            equals_members
                .iter()
                .filter_map(|flake| flake.o.as_sid().cloned())
                .filter(|sid| *sid != f("$identity"))
                .collect(),
        )
    };

    Ok(AllowRule {
        roles: refs_of(&flakes, &f("targetRole")),
        actions,
        equals_path,
    })
}

async fn subject_flakes_raw(db: &Db, sid: &Sid) -> Result<Vec<Flake>, Error> {
    let bounds = component_bounds(IndexKind::Spot, Some(sid), None, None);
    Ok(db
        .raw_range(IndexKind::Spot, bounds, RangeOpts::live(db.t))
        .try_collect()
        .await?)
}

fn refs_of(flakes: &[Flake], predicate: &Sid) -> Vec<Sid> {
    flakes
        .iter()
        .filter(|f| &f.p == predicate)
        .filter_map(|f| f.o.as_sid().cloned())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use store::MemoryStore;

    // Assigned in sorted order by `with_iris` below.
    const DID_KEY: u32 = 8;
    const EX: u32 = 9;

    fn sid(name: &str) -> Sid {
        Sid::new(EX, name)
    }

    fn ref_flake(s: Sid, p: Sid, o: Sid) -> Flake {
        Flake::new(s, p, Value::Sid(o), dt::any_uri(), 1, true, None)
    }

    fn literal(s: Sid, p: Sid, text: &str) -> Flake {
        Flake::new(
            s,
            p,
            Value::String(text.to_string()),
            flake::dt::string(),
            1,
            true,
            None,
        )
    }

    /// A ledger with two users, a role, and a policy that lets the role
    /// view everything but `ssn`, which is visible only to the user the
    /// identity points at.
    async fn fixture() -> Db {
        let alice_did = Sid::new(DID_KEY, "alice");
        let role = sid("userRole");

        let mut flakes = vec![
            // Identity -> role, identity -> user.
            ref_flake(alice_did.clone(), f("role"), role.clone()),
            ref_flake(alice_did.clone(), sid("user"), sid("alice")),
            // Subjects.
            ref_flake(sid("alice"), dt::rdf_type(), sid("User")),
            literal(sid("alice"), sid("name"), "Alice"),
            literal(sid("alice"), sid("ssn"), "111-11-1111"),
            ref_flake(sid("john"), dt::rdf_type(), sid("User")),
            literal(sid("john"), sid("name"), "John"),
            literal(sid("john"), sid("ssn"), "888-88-8888"),
        ];

        // The policy document.
        let policy = sid("defaultPolicy");
        let view_all = Sid::new(codes::BLANK, "allowAll");
        let ssn_rule = Sid::new(codes::BLANK, "ssnProperty");
        let ssn_allow = Sid::new(codes::BLANK, "ssnAllow");
        flakes.extend(vec![
            ref_flake(policy.clone(), dt::rdf_type(), f("Policy")),
            ref_flake(policy.clone(), f("targetClass"), sid("User")),
            ref_flake(policy.clone(), f("allow"), view_all.clone()),
            ref_flake(view_all.clone(), f("targetRole"), role.clone()),
            ref_flake(view_all, f("action"), f("view")),
            ref_flake(policy.clone(), f("property"), ssn_rule.clone()),
            ref_flake(ssn_rule.clone(), f("path"), sid("ssn")),
            ref_flake(ssn_rule, f("allow"), ssn_allow.clone()),
            ref_flake(ssn_allow.clone(), f("targetRole"), role),
            ref_flake(ssn_allow.clone(), f("action"), f("view")),
            Flake::new(
                ssn_allow.clone(),
                f("equals"),
                Value::Sid(f("$identity")),
                dt::any_uri(),
                1,
                true,
                Some(flake::Meta::list_index(0)),
            ),
            Flake::new(
                ssn_allow,
                f("equals"),
                Value::Sid(sid("user")),
                dt::any_uri(),
                1,
                true,
                Some(flake::Meta::list_index(1)),
            ),
        ]);

        let namespaces = flake::Namespaces::bootstrap()
            .with_iris(["did:key:anything", "http://example.org/ns#anything"]);
        assert_eq!(namespaces.code_of("did:key:"), Some(DID_KEY));
        assert_eq!(namespaces.code_of("http://example.org/ns#"), Some(EX));

        Db::genesis("demo", Arc::new(MemoryStore::new()))
            .with_namespaces(namespaces)
            .with_flakes(1, &flakes, &[])
    }

    #[tokio::test]
    async fn test_policy_scopes_ssn_to_own_record() {
        let db = fixture().await;
        let wrapped = wrap_policy(&db, "did:key:alice").await.unwrap();

        let alice_flakes = db::subject_flakes(&wrapped, &sid("alice"), wrapped.t)
            .await
            .unwrap();
        let alice_preds: Vec<&str> = alice_flakes.iter().map(|f| f.p.name.as_str()).collect();
        assert!(alice_preds.contains(&"name"));
        assert!(alice_preds.contains(&"ssn"), "own ssn is visible");

        let john_flakes = db::subject_flakes(&wrapped, &sid("john"), wrapped.t)
            .await
            .unwrap();
        let john_preds: Vec<&str> = john_flakes.iter().map(|f| f.p.name.as_str()).collect();
        assert!(john_preds.contains(&"name"));
        assert!(!john_preds.contains(&"ssn"), "foreign ssn is filtered");
    }

    #[tokio::test]
    async fn test_unwrapped_reads_see_everything() {
        let db = fixture().await;
        let john_flakes = db::subject_flakes(&db, &sid("john"), db.t).await.unwrap();
        assert!(john_flakes.iter().any(|f| f.p.name == "ssn"));
    }

    #[tokio::test]
    async fn test_modification_is_rejected_for_view_only_role() {
        let db = fixture().await;
        let enforcer = compile_enforcer(&db, "did:key:alice").await.unwrap();

        let staged = vec![literal(sid("alice"), sid("name"), "Mallory")];
        let err = allowed(&db, &enforcer, &staged).await.unwrap_err();
        assert!(matches!(err, Error::Violation { .. }));
    }

    #[tokio::test]
    async fn test_allow_iri() {
        let db = fixture().await;
        let enforcer = compile_enforcer(&db, "did:key:alice").await.unwrap();

        assert!(allow_iri(&db, &enforcer, "http://example.org/ns#alice")
            .await
            .unwrap());
        assert!(!allow_iri(&db, &enforcer, "http://nowhere.example/x")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_modify_action_grants_staging() {
        let mut db = fixture().await;
        // Extend the policy with a modify grant for the role.
        let editor = Sid::new(codes::BLANK, "editorAllow");
        let extra = vec![
            ref_flake(sid("defaultPolicy"), f("allow"), editor.clone()),
            ref_flake(editor.clone(), f("targetRole"), sid("userRole")),
            ref_flake(editor, f("action"), f("modify")),
        ];
        db = db.with_flakes(2, &extra, &[]);

        let enforcer = compile_enforcer(&db, "did:key:alice").await.unwrap();
        let staged = vec![literal(sid("alice"), sid("name"), "Alicia")];
        allowed(&db, &enforcer, &staged).await.unwrap();
    }

    #[tokio::test]
    async fn test_equals_path_warns_but_takes_first_on_multivalue() {
        let mut db = fixture().await;
        // A second user edge off the identity: the walk takes the first.
        let extra = vec![ref_flake(
            Sid::new(DID_KEY, "alice"),
            sid("user"),
            sid("zed"),
        )];
        db = db.with_flakes(2, &extra, &[]);

        let enforcer = compile_enforcer(&db, "did:key:alice").await.unwrap();
        let own = db::subject_flakes(&db, &sid("alice"), db.t).await.unwrap();
        let ssn = own.iter().find(|f| f.p.name == "ssn").unwrap();
        // (alice, user) still sorts before (zed, user) in SPOT order, so
        // the first hop keeps resolving to alice.
        assert!(enforcer.check(&db, ssn, Action::View).await.unwrap());
    }
}
