use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec::CodecRegistry;
use crate::normalize::normalize_source;
use crate::serialize::{serialize, Capture, SerializedValue};
use crate::{digest, Version, VersionId};

/// Stable name of a tracked function within one process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LmpKey(String);

impl LmpKey {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LmpKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LmpKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LmpKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A name referenced by an LMP body but defined outside it.
#[derive(Debug, Clone, PartialEq)]
pub enum FreeVariable {
    /// Reference to another tracked function.
    Lmp { name: String, target: LmpKey },
    /// Any other value, snapshotted when the binding was made.
    Value { name: String, value: SerializedValue },
}

impl FreeVariable {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Lmp { name, .. } | Self::Value { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HashingError {
    #[error("source text unavailable for {0}; hashing its structural representation")]
    SourceUnavailable(LmpKey),
    #[error("free variable `{name}` of {key} references unknown LMP {target}")]
    UnresolvedDependency { key: LmpKey, name: String, target: LmpKey },
}

/// Read access to function definitions, as the hasher needs it.
pub trait Introspect: Send + Sync {
    fn get_source(&self, key: &LmpKey) -> Option<String>;
    fn get_free_variables(&self, key: &LmpKey) -> Vec<FreeVariable>;
    fn is_lmp(&self, key: &LmpKey) -> bool;

    fn get_representation(&self, _key: &LmpKey) -> Option<String> {
        None
    }

    /// Changes whenever any definition changes. Sources that cannot tell
    /// return `None`, and every memoized hash is then checked against a
    /// fresh snapshot before reuse.
    fn generation(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LmpDefinition {
    key: LmpKey,
    source: Option<String>,
    representation: Option<String>,
    free_variables: Vec<FreeVariable>,
}

impl LmpDefinition {
    #[must_use]
    pub fn new(key: impl Into<LmpKey>) -> Self {
        Self { key: key.into(), source: None, representation: None, free_variables: Vec::new() }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Structural description hashed when no source text is available.
    #[must_use]
    pub fn with_representation(mut self, representation: impl Into<String>) -> Self {
        self.representation = Some(representation.into());
        self
    }

    #[must_use]
    pub fn bind_lmp(mut self, name: impl Into<String>, target: impl Into<LmpKey>) -> Self {
        self.free_variables.push(FreeVariable::Lmp { name: name.into(), target: target.into() });
        self
    }

    #[must_use]
    pub fn bind_value<T: Capture + ?Sized>(self, name: impl Into<String>, value: &T) -> Self {
        let value = serialize(value, &CodecRegistry::with_builtin_codecs());
        self.bind_serialized(name, value)
    }

    #[must_use]
    pub fn bind_serialized(mut self, name: impl Into<String>, value: SerializedValue) -> Self {
        let name = name.into();
        self.free_variables.retain(|existing| existing.name() != name);
        self.free_variables.push(FreeVariable::Value { name, value });
        self
    }

    #[must_use]
    pub fn key(&self) -> &LmpKey {
        &self.key
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn free_variables(&self) -> &[FreeVariable] {
        &self.free_variables
    }
}

/// Process-wide table of tracked function definitions.
#[derive(Debug, Default)]
pub struct LmpRegistry {
    definitions: RwLock<BTreeMap<LmpKey, LmpDefinition>>,
    generation: AtomicU64,
}

impl LmpRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition. Replacing bumps the generation so
    /// dependents are re-hashed on next use.
    pub fn define(&self, definition: LmpDefinition) -> LmpKey {
        let key = definition.key.clone();
        self.definitions.write().insert(key.clone(), definition);
        self.generation.fetch_add(1, Ordering::SeqCst);
        key
    }

    #[must_use]
    pub fn get(&self, key: &LmpKey) -> Option<LmpDefinition> {
        self.definitions.read().get(key).cloned()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<LmpKey> {
        self.definitions.read().keys().cloned().collect()
    }
}

impl Introspect for LmpRegistry {
    fn get_source(&self, key: &LmpKey) -> Option<String> {
        self.definitions.read().get(key).and_then(|definition| definition.source.clone())
    }

    fn get_free_variables(&self, key: &LmpKey) -> Vec<FreeVariable> {
        self.definitions
            .read()
            .get(key)
            .map(|definition| definition.free_variables.clone())
            .unwrap_or_default()
    }

    fn is_lmp(&self, key: &LmpKey) -> bool {
        self.definitions.read().contains_key(key)
    }

    fn get_representation(&self, key: &LmpKey) -> Option<String> {
        self.definitions.read().get(key).and_then(|definition| definition.representation.clone())
    }

    fn generation(&self) -> Option<u64> {
        Some(self.generation.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    source_text: String,
    best_effort: bool,
    values: BTreeMap<String, SerializedValue>,
    deps: BTreeSet<LmpKey>,
}

#[derive(Debug, Clone)]
struct MemoEntry {
    generation: Option<u64>,
    snapshot: Snapshot,
    external: BTreeSet<VersionId>,
    version: Version,
}

/// Computes content-addressed versions over the dependency closure of an LMP.
///
/// Mutually recursive LMPs are hashed as one strongly connected component:
/// each member's id is derived from a seal over every member's own content
/// plus the member's position in the seal, so the result does not depend on
/// which member was hashed first.
#[derive(Debug, Default)]
pub struct DependencyHasher {
    memo: RwLock<HashMap<LmpKey, MemoEntry>>,
}

impl DependencyHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of `key` with all its dependencies resolved. Never fails;
    /// degraded inputs produce a version flagged `best_effort`.
    #[must_use]
    pub fn hash_lmp(&self, key: &LmpKey, introspect: &dyn Introspect) -> Version {
        let generation = introspect.generation();
        if let Some(version) = generation.and_then(|generation| self.cached(key, generation)) {
            tracing::debug!(lmp = %key, version_id = %version.version_id, "version memo hit");
            return version;
        }
        let mut closure = self.compute(key, introspect, generation);
        closure.remove(key).unwrap_or_else(|| {
            // Only reachable if the root vanished between snapshot and hashing.
            fallback_version(key)
        })
    }

    /// Versions of `key` and every LMP it reaches, dependencies before dependents.
    #[must_use]
    pub fn hash_closure(&self, key: &LmpKey, introspect: &dyn Introspect) -> Vec<Version> {
        let root = self.hash_lmp(key, introspect);
        let generation = introspect.generation();
        let memo = self.memo.read();

        let mut ordered = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![(key.clone(), false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                if let Some(entry) = memo.get(&current).filter(|entry| entry.generation == generation) {
                    ordered.push(entry.version.clone());
                }
                continue;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            stack.push((current.clone(), true));
            for free_variable in introspect.get_free_variables(&current) {
                if let FreeVariable::Lmp { target, .. } = free_variable {
                    if introspect.is_lmp(&target) && !seen.contains(&target) {
                        stack.push((target, false));
                    }
                }
            }
        }
        drop(memo);

        if ordered.last().map(|version| &version.version_id) != Some(&root.version_id) {
            ordered.retain(|version| version.version_id != root.version_id);
            ordered.push(root);
        }
        ordered
    }

    #[must_use]
    pub fn cached(&self, key: &LmpKey, generation: u64) -> Option<Version> {
        self.memo
            .read()
            .get(key)
            .filter(|entry| entry.generation == Some(generation))
            .map(|entry| entry.version.clone())
    }

    pub fn clear(&self) {
        self.memo.write().clear();
    }

    fn compute(
        &self,
        root: &LmpKey,
        introspect: &dyn Introspect,
        generation: Option<u64>,
    ) -> BTreeMap<LmpKey, Version> {
        let mut resolved: BTreeMap<LmpKey, Version> = BTreeMap::new();
        let mut snapshots: BTreeMap<LmpKey, Snapshot> = BTreeMap::new();
        let mut pending = vec![root.clone()];
        while let Some(key) = pending.pop() {
            if snapshots.contains_key(&key) || resolved.contains_key(&key) {
                continue;
            }
            if let Some(version) = generation.and_then(|generation| self.cached(&key, generation)) {
                resolved.insert(key, version);
                continue;
            }
            let snapshot = take_snapshot(&key, introspect);
            pending.extend(snapshot.deps.iter().cloned());
            snapshots.insert(key, snapshot);
        }

        let created_at = OffsetDateTime::now_utc();
        let mut entries = Vec::new();
        for component in strongly_connected_components(&snapshots) {
            let members = component.iter().collect::<BTreeSet<_>>();
            let externals = component
                .iter()
                .filter_map(|key| {
                    let snapshot = snapshots.get(key)?;
                    Some((key, external_ids(snapshot, &members, &resolved)))
                })
                .collect::<BTreeMap<_, _>>();
            let versions = self
                .reusable(&component, &snapshots, &externals)
                .unwrap_or_else(|| hash_component(&component, &snapshots, &resolved, created_at));
            for version in versions {
                let key = LmpKey::new(version.name.clone());
                if let (Some(snapshot), Some(external)) = (snapshots.get(&key), externals.get(&key)) {
                    entries.push(MemoEntry {
                        generation,
                        snapshot: snapshot.clone(),
                        external: external.clone(),
                        version: version.clone(),
                    });
                }
                resolved.insert(key, version);
            }
        }

        let mut memo = self.memo.write();
        for entry in entries {
            memo.insert(LmpKey::new(entry.version.name.clone()), entry);
        }
        drop(memo);

        resolved
    }

    /// Memoized versions of a whole component, if every member still has
    /// the content and external dependency ids it was hashed with.
    fn reusable(
        &self,
        component: &[LmpKey],
        snapshots: &BTreeMap<LmpKey, Snapshot>,
        externals: &BTreeMap<&LmpKey, BTreeSet<VersionId>>,
    ) -> Option<Vec<Version>> {
        let memo = self.memo.read();
        component
            .iter()
            .map(|key| {
                let entry = memo.get(key)?;
                let unchanged = snapshots.get(key) == Some(&entry.snapshot)
                    && externals.get(key) == Some(&entry.external);
                unchanged.then(|| entry.version.clone())
            })
            .collect()
    }
}

fn take_snapshot(key: &LmpKey, introspect: &dyn Introspect) -> Snapshot {
    let (source_text, mut best_effort) = match introspect.get_source(key) {
        Some(source) => (normalize_source(&source), false),
        None => {
            let error = HashingError::SourceUnavailable(key.clone());
            tracing::warn!(lmp = %key, %error, "falling back to structural hashing");
            let representation =
                introspect.get_representation(key).unwrap_or_else(|| key.to_string());
            (format!("<structural> {}", normalize_source(&representation)), true)
        }
    };

    let mut values = BTreeMap::new();
    let mut deps = BTreeSet::new();
    for free_variable in introspect.get_free_variables(key) {
        match free_variable {
            FreeVariable::Lmp { name, target } if introspect.is_lmp(&target) => {
                deps.insert(target);
                values.remove(&name);
            }
            FreeVariable::Lmp { name, target } => {
                let error = HashingError::UnresolvedDependency {
                    key: key.clone(),
                    name: name.clone(),
                    target: target.clone(),
                };
                tracing::warn!(lmp = %key, %error, "recording unresolved dependency as a placeholder");
                values.insert(
                    name,
                    SerializedValue::Unrepresentable {
                        type_name: "lmp".to_string(),
                        repr: target.to_string(),
                    },
                );
                best_effort = true;
            }
            FreeVariable::Value { name, value } => {
                values.insert(name, value);
            }
        }
    }

    Snapshot { source_text, best_effort, values, deps }
}

fn hash_component(
    component: &[LmpKey],
    snapshots: &BTreeMap<LmpKey, Snapshot>,
    resolved: &BTreeMap<LmpKey, Version>,
    created_at: OffsetDateTime,
) -> Vec<Version> {
    let members = component.iter().collect::<BTreeSet<_>>();
    let outside = |snapshot: &Snapshot| external_ids(snapshot, &members, resolved);

    let is_cycle = match component {
        [single] => snapshots.get(single).is_some_and(|snapshot| snapshot.deps.contains(single)),
        _ => true,
    };

    if !is_cycle {
        return component
            .iter()
            .filter_map(|key| {
                let snapshot = snapshots.get(key)?;
                let dependencies = outside(snapshot);
                let version_id =
                    Version::compute_id(&snapshot.source_text, &dependencies, &snapshot.values);
                Some(Version {
                    version_id,
                    name: key.to_string(),
                    source_text: snapshot.source_text.clone(),
                    dependencies,
                    free_variables: snapshot.values.clone(),
                    best_effort: snapshot.best_effort,
                    cycle_seal: None,
                    created_at,
                })
            })
            .collect();
    }

    // Member digests exclude intra-cycle edges; the seal binds them together.
    let member_digests = component
        .iter()
        .filter_map(|key| {
            let snapshot = snapshots.get(key)?;
            let digest = digest::member_digest(
                &snapshot.source_text,
                &outside(snapshot),
                &snapshot.values,
            );
            Some((key.clone(), digest))
        })
        .collect::<BTreeMap<_, _>>();
    let seal = digest::cycle_seal(member_digests.values().cloned().collect());
    let member_ids = member_digests
        .iter()
        .map(|(key, member)| (key.clone(), VersionId::from_digest(digest::sealed_member(&seal, member))))
        .collect::<BTreeMap<_, _>>();

    component
        .iter()
        .filter_map(|key| {
            let snapshot = snapshots.get(key)?;
            let mut dependencies = outside(snapshot);
            for dep in snapshot.deps.iter().filter(|dep| members.contains(dep)) {
                if let Some(id) = member_ids.get(dep) {
                    dependencies.insert(id.clone());
                }
            }
            Some(Version {
                version_id: member_ids.get(key)?.clone(),
                name: key.to_string(),
                source_text: snapshot.source_text.clone(),
                dependencies,
                free_variables: snapshot.values.clone(),
                best_effort: snapshot.best_effort,
                cycle_seal: Some(seal.clone()),
                created_at,
            })
        })
        .collect()
}

/// Version ids of dependencies outside `members`.
fn external_ids(
    snapshot: &Snapshot,
    members: &BTreeSet<&LmpKey>,
    resolved: &BTreeMap<LmpKey, Version>,
) -> BTreeSet<VersionId> {
    snapshot
        .deps
        .iter()
        .filter(|dep| !members.contains(dep))
        .filter_map(|dep| resolved.get(dep).map(|version| version.version_id.clone()))
        .collect()
}

fn fallback_version(key: &LmpKey) -> Version {
    let source_text = format!("<structural> {key}");
    let dependencies = BTreeSet::new();
    let free_variables = BTreeMap::new();
    Version {
        version_id: Version::compute_id(&source_text, &dependencies, &free_variables),
        name: key.to_string(),
        source_text,
        dependencies,
        free_variables,
        best_effort: true,
        cycle_seal: None,
        created_at: OffsetDateTime::now_utc(),
    }
}

/// Tarjan's algorithm; components come out dependencies-first. The walk
/// keeps its own frame stack so chain depth is bounded by memory, not by
/// the thread stack.
fn strongly_connected_components(graph: &BTreeMap<LmpKey, Snapshot>) -> Vec<Vec<LmpKey>> {
    struct Frame<'g> {
        node: &'g LmpKey,
        deps: Vec<&'g LmpKey>,
        cursor: usize,
    }

    struct State<'g> {
        graph: &'g BTreeMap<LmpKey, Snapshot>,
        next_index: usize,
        index: HashMap<&'g LmpKey, usize>,
        lowlink: HashMap<&'g LmpKey, usize>,
        stack: Vec<&'g LmpKey>,
        on_stack: BTreeSet<&'g LmpKey>,
        frames: Vec<Frame<'g>>,
        components: Vec<Vec<LmpKey>>,
    }

    impl<'g> State<'g> {
        fn enter(&mut self, node: &'g LmpKey) {
            self.index.insert(node, self.next_index);
            self.lowlink.insert(node, self.next_index);
            self.next_index += 1;
            self.stack.push(node);
            self.on_stack.insert(node);

            let graph = self.graph;
            // Edges into already-resolved versions leave this graph.
            let deps = graph
                .get(node)
                .map(|snapshot| {
                    snapshot
                        .deps
                        .iter()
                        .filter_map(|dep| graph.get_key_value(dep).map(|(dep, _)| dep))
                        .collect()
                })
                .unwrap_or_default();
            self.frames.push(Frame { node, deps, cursor: 0 });
        }

        fn lower(&mut self, node: &'g LmpKey, candidate: usize) {
            if let Some(low) = self.lowlink.get_mut(node) {
                *low = (*low).min(candidate);
            }
        }

        fn walk(&mut self, root: &'g LmpKey) {
            self.enter(root);
            while let Some(frame) = self.frames.last_mut() {
                let node = frame.node;
                if let Some(&dep) = frame.deps.get(frame.cursor) {
                    frame.cursor += 1;
                    if !self.index.contains_key(dep) {
                        self.enter(dep);
                    } else if self.on_stack.contains(dep) {
                        let dep_index = self.index[dep];
                        self.lower(node, dep_index);
                    }
                    continue;
                }

                self.frames.pop();
                let node_low = self.lowlink[node];
                if let Some(parent) = self.frames.last().map(|frame| frame.node) {
                    self.lower(parent, node_low);
                }
                if node_low == self.index[node] {
                    let mut component = Vec::new();
                    while let Some(member) = self.stack.pop() {
                        self.on_stack.remove(member);
                        component.push(member.clone());
                        if member == node {
                            break;
                        }
                    }
                    component.sort();
                    self.components.push(component);
                }
            }
        }
    }

    let mut state = State {
        graph,
        next_index: 0,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        frames: Vec::new(),
        components: Vec::new(),
    };
    for node in graph.keys() {
        if !state.index.contains_key(node) {
            state.walk(node);
        }
    }
    state.components
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn registry_with(definitions: Vec<LmpDefinition>) -> LmpRegistry {
        let registry = LmpRegistry::new();
        for definition in definitions {
            registry.define(definition);
        }
        registry
    }

    fn helper_and_outer(helper_source: &str) -> LmpRegistry {
        registry_with(vec![
            LmpDefinition::new("helper").with_source(helper_source),
            LmpDefinition::new("outer")
                .with_source("fn outer(x: i64) -> i64 { helper(x) + 1 }")
                .bind_lmp("helper", "helper"),
        ])
    }

    #[test]
    fn identical_definitions_hash_identically() {
        let first = helper_and_outer("fn helper(x: i64) -> i64 { x * 2 }");
        let second = helper_and_outer("fn helper(x: i64) -> i64 {\n    x * 2 // double\n}");

        let a = DependencyHasher::new().hash_lmp(&"outer".into(), &first);
        let b = DependencyHasher::new().hash_lmp(&"outer".into(), &second);
        assert_eq!(a.version_id, b.version_id);
        assert!(!a.best_effort);
    }

    #[test]
    fn dependency_change_propagates_to_dependent() {
        let before = helper_and_outer("fn helper(x: i64) -> i64 { x * 2 }");
        let after = helper_and_outer("fn helper(x: i64) -> i64 { x * 3 }");
        let hasher = DependencyHasher::new();

        let outer_before = hasher.hash_lmp(&"outer".into(), &before);
        let outer_after = DependencyHasher::new().hash_lmp(&"outer".into(), &after);
        assert_ne!(outer_before.version_id, outer_after.version_id);
        assert_eq!(outer_before.source_text, outer_after.source_text);

        let helper_after = DependencyHasher::new().hash_lmp(&"helper".into(), &after);
        assert!(outer_after.dependencies.contains(&helper_after.version_id));
    }

    #[test]
    fn redefinition_invalidates_memo() {
        let registry = helper_and_outer("fn helper(x: i64) -> i64 { x * 2 }");
        let hasher = DependencyHasher::new();
        let before = hasher.hash_lmp(&"outer".into(), &registry);
        assert_eq!(hasher.hash_lmp(&"outer".into(), &registry).version_id, before.version_id);

        registry.define(LmpDefinition::new("helper").with_source("fn helper(x: i64) -> i64 { x - 2 }"));
        let after = hasher.hash_lmp(&"outer".into(), &registry);
        assert_ne!(after.version_id, before.version_id);
    }

    /// Reads a captured constant live, with no generation counter.
    struct LiveConstant {
        factor: std::sync::atomic::AtomicI64,
        helper_source: RwLock<String>,
    }

    impl LiveConstant {
        fn new(factor: i64) -> Self {
            Self {
                factor: std::sync::atomic::AtomicI64::new(factor),
                helper_source: RwLock::new("fn helper(x: i64) -> i64 { x }".to_string()),
            }
        }
    }

    impl Introspect for LiveConstant {
        fn get_source(&self, key: &LmpKey) -> Option<String> {
            match key.as_str() {
                "scaled" => Some("fn scaled(x: i64) -> i64 { helper(x) * FACTOR }".to_string()),
                "helper" => Some(self.helper_source.read().clone()),
                _ => None,
            }
        }

        fn get_free_variables(&self, key: &LmpKey) -> Vec<FreeVariable> {
            if key.as_str() != "scaled" {
                return Vec::new();
            }
            vec![
                FreeVariable::Value {
                    name: "FACTOR".to_string(),
                    value: SerializedValue::int(self.factor.load(Ordering::SeqCst)),
                },
                FreeVariable::Lmp { name: "helper".to_string(), target: "helper".into() },
            ]
        }

        fn is_lmp(&self, key: &LmpKey) -> bool {
            matches!(key.as_str(), "scaled" | "helper")
        }
    }

    #[test]
    fn live_constant_mutation_is_seen_by_the_same_hasher() {
        let live = LiveConstant::new(1);
        let hasher = DependencyHasher::new();
        let before = hasher.hash_lmp(&"scaled".into(), &live);
        let again = hasher.hash_lmp(&"scaled".into(), &live);
        assert_eq!(again.version_id, before.version_id);
        assert_eq!(again.created_at, before.created_at);

        live.factor.store(2, Ordering::SeqCst);
        let after = hasher.hash_lmp(&"scaled".into(), &live);
        assert_ne!(after.version_id, before.version_id);
        assert_eq!(after.version_id, DependencyHasher::new().hash_lmp(&"scaled".into(), &live).version_id);

        live.factor.store(1, Ordering::SeqCst);
        assert_eq!(hasher.hash_lmp(&"scaled".into(), &live).version_id, before.version_id);
    }

    #[test]
    fn live_dependency_change_reaches_dependent_through_memo() {
        let live = LiveConstant::new(3);
        let hasher = DependencyHasher::new();
        let helper_before = hasher.hash_lmp(&"helper".into(), &live);
        let before = hasher.hash_lmp(&"scaled".into(), &live);

        *live.helper_source.write() = "fn helper(x: i64) -> i64 { x + 1 }".to_string();
        let helper_after = hasher.hash_lmp(&"helper".into(), &live);
        assert_ne!(helper_after.version_id, helper_before.version_id);

        let after = hasher.hash_lmp(&"scaled".into(), &live);
        assert_ne!(after.version_id, before.version_id);
        assert!(after.dependencies.contains(&helper_after.version_id));
    }

    #[test]
    fn registry_memo_does_not_reuse_dependent_hashed_against_old_dependency() {
        let registry = helper_and_outer("fn helper(x: i64) -> i64 { x * 2 }");
        let hasher = DependencyHasher::new();
        let before = hasher.hash_lmp(&"outer".into(), &registry);

        registry.define(LmpDefinition::new("helper").with_source("fn helper(x: i64) -> i64 { x * 4 }"));
        let helper = hasher.hash_lmp(&"helper".into(), &registry);
        let after = hasher.hash_lmp(&"outer".into(), &registry);
        assert_ne!(after.version_id, before.version_id);
        assert!(after.dependencies.contains(&helper.version_id));
    }

    #[test]
    fn long_dependency_chain_hashes_without_exhausting_the_stack() {
        let depth = 20_000_usize;
        let registry = LmpRegistry::new();
        for step in 0..depth {
            let mut definition =
                LmpDefinition::new(format!("step_{step}")).with_source(format!("fn step_{step}() {{ next() }}"));
            if step + 1 < depth {
                definition = definition.bind_lmp("next", format!("step_{}", step + 1));
            }
            registry.define(definition);
        }

        let hasher = DependencyHasher::new();
        let root = hasher.hash_lmp(&"step_0".into(), &registry);
        assert!(!root.best_effort);
        assert_eq!(root.dependencies.len(), 1);
        assert!(root.cycle_seal.is_none());

        let closure = hasher.hash_closure(&"step_0".into(), &registry);
        assert_eq!(closure.len(), depth);
        assert_eq!(closure.last().map(|version| &version.version_id), Some(&root.version_id));
    }

    #[test]
    fn long_cycle_is_one_component() {
        let size = 5_000_usize;
        let registry = LmpRegistry::new();
        for step in 0..size {
            registry.define(
                LmpDefinition::new(format!("ring_{step}"))
                    .with_source(format!("fn ring_{step}() {{ next() }}"))
                    .bind_lmp("next", format!("ring_{}", (step + 1) % size)),
            );
        }

        let root = DependencyHasher::new().hash_lmp(&"ring_0".into(), &registry);
        assert!(root.cycle_seal.is_some());
        assert!(!root.best_effort);
    }

    #[test]
    fn free_value_changes_the_version() {
        let with_prompt = |prompt: &str| {
            registry_with(vec![LmpDefinition::new("ask")
                .with_source("fn ask(q: &str) -> String { format!(\"{PROMPT} {q}\") }")
                .bind_value("PROMPT", prompt)])
        };
        let a = DependencyHasher::new().hash_lmp(&"ask".into(), &with_prompt("Be terse."));
        let b = DependencyHasher::new().hash_lmp(&"ask".into(), &with_prompt("Be verbose."));
        assert_ne!(a.version_id, b.version_id);
        assert_eq!(a.free_variables.get("PROMPT"), Some(&SerializedValue::text("Be terse.")));
    }

    #[test]
    fn acyclic_versions_validate() {
        let registry = helper_and_outer("fn helper(x: i64) -> i64 { x * 2 }");
        for version in DependencyHasher::new().hash_closure(&"outer".into(), &registry) {
            assert_eq!(version.validate(), Ok(()));
            assert!(version.cycle_seal.is_none());
        }
    }

    #[test]
    fn closure_lists_dependencies_before_root() {
        let registry = helper_and_outer("fn helper(x: i64) -> i64 { x * 2 }");
        let closure = DependencyHasher::new().hash_closure(&"outer".into(), &registry);
        let names = closure.iter().map(|version| version.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["helper", "outer"]);
    }

    fn mutual_recursion() -> LmpRegistry {
        registry_with(vec![
            LmpDefinition::new("is_even")
                .with_source("fn is_even(n: u64) -> bool { n == 0 || is_odd(n - 1) }")
                .bind_lmp("is_odd", "is_odd"),
            LmpDefinition::new("is_odd")
                .with_source("fn is_odd(n: u64) -> bool { n != 0 && is_even(n - 1) }")
                .bind_lmp("is_even", "is_even"),
        ])
    }

    #[test]
    fn cycles_hash_independently_of_entry_point() {
        let registry = mutual_recursion();
        let from_even = DependencyHasher::new();
        let from_odd = DependencyHasher::new();

        let even_first = from_even.hash_lmp(&"is_even".into(), &registry);
        let odd_second = from_even.hash_lmp(&"is_odd".into(), &registry);
        let odd_first = from_odd.hash_lmp(&"is_odd".into(), &registry);
        let even_second = from_odd.hash_lmp(&"is_even".into(), &registry);

        assert_eq!(even_first.version_id, even_second.version_id);
        assert_eq!(odd_first.version_id, odd_second.version_id);
        assert_ne!(even_first.version_id, odd_first.version_id);
        assert!(even_first.cycle_seal.is_some());
        assert_eq!(even_first.cycle_seal, odd_first.cycle_seal);
        assert!(even_first.dependencies.contains(&odd_first.version_id));
        assert!(odd_first.dependencies.contains(&even_first.version_id));
    }

    #[test]
    fn self_recursion_is_sealed() {
        let registry = registry_with(vec![LmpDefinition::new("fact")
            .with_source("fn fact(n: u64) -> u64 { if n == 0 { 1 } else { n * fact(n - 1) } }")
            .bind_lmp("fact", "fact")]);
        let version = DependencyHasher::new().hash_lmp(&"fact".into(), &registry);
        assert!(version.cycle_seal.is_some());
        assert!(version.dependencies.contains(&version.version_id));
        assert_eq!(version.validate(), Ok(()));
    }

    #[test]
    fn cycle_member_change_changes_every_member() {
        let registry = mutual_recursion();
        let before_odd = DependencyHasher::new().hash_lmp(&"is_odd".into(), &registry);
        registry.define(
            LmpDefinition::new("is_even")
                .with_source("fn is_even(n: u64) -> bool { n % 2 == 0 || is_odd(n - 1) }")
                .bind_lmp("is_odd", "is_odd"),
        );
        let after_odd = DependencyHasher::new().hash_lmp(&"is_odd".into(), &registry);
        assert_ne!(before_odd.version_id, after_odd.version_id);
    }

    #[test]
    fn missing_source_is_best_effort() {
        let registry = registry_with(vec![
            LmpDefinition::new("native").with_representation("extern fn native(len: usize)")
        ]);
        let version = DependencyHasher::new().hash_lmp(&"native".into(), &registry);
        assert!(version.best_effort);
        assert!(version.source_text.contains("native"));
    }

    #[test]
    fn unresolved_dependency_is_best_effort_placeholder() {
        let registry = registry_with(vec![LmpDefinition::new("caller")
            .with_source("fn caller() { ghost() }")
            .bind_lmp("ghost", "ghost")]);
        let version = DependencyHasher::new().hash_lmp(&"caller".into(), &registry);
        assert!(version.best_effort);
        assert!(version.dependencies.is_empty());
        assert!(matches!(
            version.free_variables.get("ghost"),
            Some(SerializedValue::Unrepresentable { .. })
        ));
    }

    #[test]
    fn unknown_root_still_yields_a_version() {
        let version = DependencyHasher::new().hash_lmp(&"nowhere".into(), &LmpRegistry::new());
        assert!(version.best_effort);
        assert_eq!(version.name, "nowhere");
    }

    proptest! {
        #[test]
        fn property_definition_order_does_not_change_ids(ring in 2_usize..6, rotate in 0_usize..6) {
            let names = (0..ring).map(|index| format!("node_{index}")).collect::<Vec<_>>();
            let definitions = names
                .iter()
                .enumerate()
                .map(|(index, name)| {
                    let next = &names[(index + 1) % ring];
                    LmpDefinition::new(name.as_str())
                        .with_source(format!("fn {name}() {{ {next}() }}"))
                        .bind_lmp(next.as_str(), next.as_str())
                })
                .collect::<Vec<_>>();
            let mut rotated = definitions.clone();
            rotated.rotate_left(rotate % ring);

            let first = registry_with(definitions);
            let second = registry_with(rotated);
            let entry_a = LmpKey::new(names[0].clone());
            let entry_b = LmpKey::new(names[rotate % ring].clone());

            let from_a = DependencyHasher::new().hash_closure(&entry_a, &first);
            let from_b = DependencyHasher::new().hash_closure(&entry_b, &second);
            let ids_a = from_a.iter().map(|v| (v.name.clone(), v.version_id.clone())).collect::<BTreeMap<_, _>>();
            let ids_b = from_b.iter().map(|v| (v.name.clone(), v.version_id.clone())).collect::<BTreeMap<_, _>>();
            prop_assert_eq!(ids_a, ids_b);
        }

        #[test]
        fn property_whitespace_between_tokens_is_ignored(
            gaps in proptest::collection::vec(prop::sample::select(vec![" ", "  ", "\n", "\t", " \n    "]), 12)
        ) {
            let tokens = ["fn", "classify", "(", "text", ")", "{", "render", "(", "PROMPT", ",", "text", ")", "}"];
            let mut spaced = String::new();
            for (index, token) in tokens.iter().enumerate() {
                spaced.push_str(token);
                if let Some(gap) = gaps.get(index) {
                    spaced.push_str(gap);
                }
            }

            let version_of = |source: String| {
                let registry = LmpRegistry::new();
                registry.define(LmpDefinition::new("classify").with_source(source));
                DependencyHasher::new().hash_lmp(&LmpKey::new("classify"), &registry).version_id
            };
            prop_assert_eq!(version_of(spaced), version_of(tokens.join(" ")));
        }

        #[test]
        fn property_binding_order_is_irrelevant(rotate in 0_usize..4) {
            let mut bindings = vec![("PROMPT", 1_i64), ("TEMPERATURE", 2), ("MAX_TOKENS", 3), ("SEED", 4)];
            let version_of = |bindings: &[(&str, i64)]| {
                let registry = LmpRegistry::new();
                let definition = bindings.iter().fold(
                    LmpDefinition::new("classify").with_source("return call(PROMPT)"),
                    |definition, (name, value)| definition.bind_value(*name, value),
                );
                registry.define(definition);
                DependencyHasher::new().hash_lmp(&LmpKey::new("classify"), &registry).version_id
            };
            let original = version_of(&bindings);
            bindings.rotate_left(rotate);
            prop_assert_eq!(original, version_of(&bindings));
        }
    }
}
