//! In-memory snapshot store
//!
//! Every snapshot keeps its nodes in a primary map by node id plus
//! secondary indices by ref key, parent key, entity key, OS identity value
//! and present hash. All index maintenance goes through
//! [`SnapshotState::put_node`], which unindexes the previous version of a
//! node before indexing the new one.

use super::session::{PatchTarget, StoreSession};
use super::{
    hash_index_key, paginate, scope_base_key, scope_contains, DerivedKeys, PatchSession, SnapshotStore, NODE_ID_PREFIX,
    NODE_ID_WIDTH, SNAPSHOT_ID_PREFIX,
};
use crate::clock::{Clock, IdGenerator, SystemClock, UuidIdGenerator};
use crate::collections::{HashMap, HashMapExt, HashSet};
use crate::error::{Result, TreesnapError};
use crate::node;
use crate::root::resolve_case_policy;
use crate::types::{
    CasePolicy, Coverage, FileIdentity, NodeFilter, NodeKind, NodeMeta, NodePage, NodeQuery, NodeRef, NodeSort,
    NodeSortKey, ObservedNode, Page, RootDescriptor, ScanRun, ScopeCompleteness, Snapshot, SnapshotStats, SortOrder,
};
use crate::utils::incremental_id;
use crate::vpath;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A committed node with its derived index keys
#[derive(Debug, Clone)]
struct StoredNode {
    meta: NodeMeta,
    keys: DerivedKeys,
}

impl StoredNode {
    fn ref_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.meta.node_ref.root_id, self.keys.layers_sig, self.keys.vpath_key
        )
    }
}

fn index_insert(index: &mut HashMap<String, HashSet<String>>, key: &str, node_id: &str) {
    index
        .entry(key.to_string())
        .or_default()
        .insert(node_id.to_string());
}

fn index_remove(index: &mut HashMap<String, HashSet<String>>, key: &str, node_id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(node_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// One snapshot and its indices
struct SnapshotState {
    snapshot: Snapshot,
    nodes_by_id: HashMap<String, StoredNode>,
    by_ref_key: HashMap<String, String>,
    by_parent_key: HashMap<String, HashSet<String>>,
    by_entity_key: HashMap<String, HashSet<String>>,
    by_identity: HashMap<String, HashSet<String>>,
    by_hash: HashMap<String, HashSet<String>>,
    entity_first_seen: HashMap<String, DateTime<Utc>>,
    node_counter: u64,
}

impl SnapshotState {
    fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            nodes_by_id: HashMap::new(),
            by_ref_key: HashMap::new(),
            by_parent_key: HashMap::new(),
            by_entity_key: HashMap::new(),
            by_identity: HashMap::new(),
            by_hash: HashMap::new(),
            entity_first_seen: HashMap::new(),
            node_counter: 0,
        }
    }

    /// Store `node`, replacing any previous version and its index entries
    fn put_node(&mut self, node: StoredNode) {
        if let Some(previous) = self.nodes_by_id.remove(&node.meta.node_id) {
            self.unindex(&previous);
        }
        self.index(&node);
        self.nodes_by_id.insert(node.meta.node_id.clone(), node);
    }

    fn index(&mut self, node: &StoredNode) {
        let id = node.meta.node_id.as_str();
        self.by_ref_key.insert(node.ref_key(), id.to_string());
        index_insert(&mut self.by_parent_key, &node.keys.parent_key, id);
        index_insert(&mut self.by_entity_key, &node.meta.entity_key, id);
        if let Some(identity) = &node.keys.identity_value {
            index_insert(&mut self.by_identity, identity, id);
        }
        for hash_key in &node.keys.hash_keys {
            index_insert(&mut self.by_hash, hash_key, id);
        }
    }

    fn unindex(&mut self, node: &StoredNode) {
        let id = node.meta.node_id.as_str();
        let ref_key = node.ref_key();
        if self.by_ref_key.get(&ref_key).map(String::as_str) == Some(id) {
            self.by_ref_key.remove(&ref_key);
        }
        index_remove(&mut self.by_parent_key, &node.keys.parent_key, id);
        index_remove(&mut self.by_entity_key, &node.meta.entity_key, id);
        if let Some(identity) = &node.keys.identity_value {
            index_remove(&mut self.by_identity, identity, id);
        }
        for hash_key in &node.keys.hash_keys {
            index_remove(&mut self.by_hash, hash_key, id);
        }
    }

    fn upsert(&mut self, observed: &ObservedNode, keys: DerivedKeys, policy: CasePolicy) {
        let entity_key = node::entity_key(&observed.identity, &observed.node_ref, policy);
        let first_seen_at = *self
            .entity_first_seen
            .entry(entity_key.clone())
            .or_insert(observed.last_observed_at);

        let ref_key = format!("{}:{}:{}", observed.node_ref.root_id, keys.layers_sig, keys.vpath_key);
        let node_id = match self.by_ref_key.get(&ref_key) {
            Some(existing) => existing.clone(),
            None => {
                self.node_counter += 1;
                incremental_id(NODE_ID_PREFIX, self.node_counter, NODE_ID_WIDTH)
            }
        };

        let meta = NodeMeta {
            node_id,
            node_ref: observed.node_ref.clone(),
            kind: observed.kind,
            name: observed.name.clone(),
            size: observed.size,
            mtime: observed.mtime,
            ctime: observed.ctime,
            birthtime: observed.birthtime,
            identity: observed.identity.clone(),
            entity_key,
            first_seen_at,
            is_deleted: false,
            deleted_at: None,
            hashes: observed.hashes.clone(),
            extras: observed.extras.clone(),
            observed_in_run_id: observed.observed_in_run_id.clone(),
            last_observed_at: observed.last_observed_at,
            errors: observed.errors.clone(),
        };
        self.put_node(StoredNode { meta, keys });
    }

    fn recompute_stats(&mut self) {
        let mut stats = SnapshotStats::default();
        for node in self.nodes_by_id.values().filter(|n| !n.meta.is_deleted) {
            stats.node_count += 1;
            match node.meta.kind {
                NodeKind::Dir => stats.dir_count += 1,
                NodeKind::File => stats.file_count += 1,
                NodeKind::Symlink | NodeKind::Special => {}
            }
        }
        self.snapshot.stats = stats;
    }

    fn nodes_for<'a>(&'a self, ids: Option<&'a HashSet<String>>) -> Box<dyn Iterator<Item = &'a StoredNode> + 'a> {
        match ids {
            Some(ids) => Box::new(ids.iter().filter_map(move |id| self.nodes_by_id.get(id))),
            None => Box::new(std::iter::empty()),
        }
    }
}

fn compare_stored(a: &StoredNode, b: &StoredNode, sort: NodeSort) -> Ordering {
    let primary = match sort.key {
        NodeSortKey::Name => a.keys.name_key.cmp(&b.keys.name_key),
        NodeSortKey::Vpath => a.keys.vpath_key.cmp(&b.keys.vpath_key),
        NodeSortKey::Size => a.meta.size.cmp(&b.meta.size),
        NodeSortKey::Mtime => a.meta.mtime.cmp(&b.meta.mtime),
        NodeSortKey::FirstSeenAt => a.meta.first_seen_at.cmp(&b.meta.first_seen_at),
        NodeSortKey::LastObservedAt => a.meta.last_observed_at.cmp(&b.meta.last_observed_at),
    };
    let primary = match sort.order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    primary
        .then_with(|| a.keys.canonical.cmp(&b.keys.canonical))
        .then_with(|| a.meta.node_id.cmp(&b.meta.node_id))
}

fn matches_filter(node: &StoredNode, filter: &NodeFilter, prefix_key: Option<&str>) -> bool {
    let meta = &node.meta;
    if let Some(kinds) = &filter.kinds {
        if !kinds.is_empty() && !kinds.contains(&meta.kind) {
            return false;
        }
    }
    if let Some(run_id) = &filter.observed_in_run_id {
        if &meta.observed_in_run_id != run_id {
            return false;
        }
    }
    if let Some(has_errors) = filter.has_errors {
        if has_errors == meta.errors.is_empty() {
            return false;
        }
    }
    if let Some(min) = filter.min_size {
        if meta.size.map_or(true, |size| size < min) {
            return false;
        }
    }
    if let Some(max) = filter.max_size {
        if meta.size.map_or(true, |size| size > max) {
            return false;
        }
    }
    if let Some(hash) = &filter.hash {
        let wanted = hash_index_key(&hash.algo, &hash.value);
        if !node.keys.hash_keys.contains(&wanted) {
            return false;
        }
    }
    if let Some(entity_key) = &filter.entity_key {
        if &meta.entity_key != entity_key {
            return false;
        }
    }
    if let Some(prefix) = prefix_key {
        if !vpath::has_prefix(&node.keys.vpath_key, prefix) {
            return false;
        }
    }
    true
}

fn into_page<'a>(
    nodes: impl Iterator<Item = &'a StoredNode>,
    include_deleted: bool,
    sort: NodeSort,
    page: Option<&Page>,
) -> Result<NodePage> {
    let mut selected: Vec<&StoredNode> = nodes.filter(|n| include_deleted || !n.meta.is_deleted).collect();
    selected.sort_by(|a, b| compare_stored(a, b, sort));
    let (selected, next_cursor) = paginate(selected, page)?;
    Ok(NodePage {
        nodes: selected.into_iter().map(|n| n.meta.clone()).collect(),
        next_cursor,
    })
}

#[derive(Default)]
struct MemoryState {
    roots: HashMap<String, RootDescriptor>,
    root_ids_by_key: HashMap<String, String>,
    snapshots: HashMap<String, SnapshotState>,
}

impl MemoryState {
    fn root(&self, root_id: &str) -> Result<&RootDescriptor> {
        self.roots
            .get(root_id)
            .ok_or_else(|| TreesnapError::RootNotFound(root_id.to_string()))
    }

    fn snapshot(&self, snapshot_id: &str) -> Result<&SnapshotState> {
        self.snapshots
            .get(snapshot_id)
            .ok_or_else(|| TreesnapError::SnapshotNotFound(snapshot_id.to_string()))
    }

    fn case_policy(&self, snapshot_id: &str) -> Result<CasePolicy> {
        let state = self.snapshot(snapshot_id)?;
        let root = self.root(&state.snapshot.root_id)?;
        Ok(resolve_case_policy(root.case_policy, &root.capabilities))
    }
}

/// Snapshot store that keeps everything in process memory
///
/// Cheap to create and fast; suited to tests and to short-lived comparisons
/// where persistence is not needed.
pub struct MemorySnapshotStore {
    state: RwLock<MemoryState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl MemorySnapshotStore {
    /// Store using the system clock and UUID snapshot ids
    pub fn new() -> Self {
        Self::with_dependencies(Arc::new(SystemClock), Arc::new(UuidIdGenerator))
    }

    /// Store with an injected clock and id generator
    pub fn with_dependencies(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            clock,
            ids,
        }
    }

    fn read_page<F>(&self, snapshot_id: &str, f: F) -> Result<NodePage>
    where
        F: FnOnce(&SnapshotState, CasePolicy) -> Result<NodePage>,
    {
        let state = self.state.read();
        let policy = state.case_policy(snapshot_id)?;
        f(state.snapshot(snapshot_id)?, policy)
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchTarget for MemorySnapshotStore {
    fn apply_upserts(&self, snapshot_id: &str, _run: &ScanRun, nodes: &[ObservedNode]) -> Result<()> {
        let mut guard = self.state.write();
        let policy = guard.case_policy(snapshot_id)?;
        let keys = nodes
            .iter()
            .map(|n| DerivedKeys::of_observed(n, policy))
            .collect::<Result<Vec<_>>>()?;

        let state = guard
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| TreesnapError::SnapshotNotFound(snapshot_id.to_string()))?;
        for (observed, keys) in nodes.iter().zip(keys) {
            state.upsert(observed, keys, policy);
        }
        Ok(())
    }

    fn apply_commit(&self, snapshot_id: &str, run: &ScanRun, coverage: &Coverage) -> Result<()> {
        let now = self.clock.now();
        let mut guard = self.state.write();
        let policy = guard.case_policy(snapshot_id)?;
        let state = guard
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| TreesnapError::SnapshotNotFound(snapshot_id.to_string()))?;

        let mut tombstoned = 0usize;
        for scope in coverage
            .scopes
            .iter()
            .filter(|s| s.completeness == ScopeCompleteness::Complete)
        {
            let base_key = scope_base_key(&scope.scope, policy);
            for node in state.nodes_by_id.values_mut() {
                if node.meta.is_deleted || node.meta.observed_in_run_id == run.run_id {
                    continue;
                }
                if scope_contains(scope.scope.mode, &base_key, &node.keys.os_vpath_key) {
                    node.meta.is_deleted = true;
                    node.meta.deleted_at = Some(now);
                    tombstoned += 1;
                }
            }
        }

        state.snapshot.last_patched_at = now;
        state.snapshot.last_run_id = run.run_id.clone();
        state.snapshot.last_coverage = coverage.clone();
        state.recompute_stats();
        info!(
            "Committed run {} to {}: {} live nodes, {} tombstoned",
            run.run_id, snapshot_id, state.snapshot.stats.node_count, tombstoned
        );
        Ok(())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    #[instrument(skip(self, desc), fields(root_id = %desc.root_id))]
    fn register_root(&self, desc: RootDescriptor) -> Result<RootDescriptor> {
        let mut state = self.state.write();
        if let Some(existing_id) = state.root_ids_by_key.get(&desc.root_key) {
            debug!("Root key {} already registered as {}", desc.root_key, existing_id);
            return state.root(existing_id).cloned();
        }
        if state.roots.contains_key(&desc.root_id) {
            return Err(TreesnapError::RootIdConflict {
                root_id: desc.root_id,
                root_key: desc.root_key,
            });
        }
        state.root_ids_by_key.insert(desc.root_key.clone(), desc.root_id.clone());
        state.roots.insert(desc.root_id.clone(), desc.clone());
        info!("Registered root {} at {:?}", desc.root_id, desc.os_path);
        Ok(desc)
    }

    fn get_root(&self, root_id: &str) -> Result<RootDescriptor> {
        self.state.read().root(root_id).cloned()
    }

    fn find_root_by_key(&self, root_key: &str) -> Result<Option<RootDescriptor>> {
        let state = self.state.read();
        Ok(state
            .root_ids_by_key
            .get(root_key)
            .and_then(|id| state.roots.get(id))
            .cloned())
    }

    fn list_roots(&self) -> Result<Vec<RootDescriptor>> {
        let mut roots: Vec<RootDescriptor> = self.state.read().roots.values().cloned().collect();
        roots.sort_by(|a, b| a.root_id.cmp(&b.root_id));
        Ok(roots)
    }

    #[instrument(skip(self))]
    fn create_snapshot(&self, root_id: &str) -> Result<Snapshot> {
        let mut state = self.state.write();
        state.root(root_id)?;
        let created_at = self.clock.now();
        let snapshot = Snapshot {
            snapshot_id: self.ids.next_id(SNAPSHOT_ID_PREFIX),
            root_id: root_id.to_string(),
            created_at,
            last_patched_at: created_at,
            last_run_id: String::new(),
            last_coverage: Coverage::default(),
            stats: SnapshotStats::default(),
        };
        state
            .snapshots
            .insert(snapshot.snapshot_id.clone(), SnapshotState::new(snapshot.clone()));
        info!("Created snapshot {} of root {}", snapshot.snapshot_id, root_id);
        Ok(snapshot)
    }

    fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        Ok(self.state.read().snapshot(snapshot_id)?.snapshot.clone())
    }

    fn list_snapshots(&self, root_id: &str) -> Result<Vec<Snapshot>> {
        let state = self.state.read();
        state.root(root_id)?;
        let mut snapshots: Vec<Snapshot> = state
            .snapshots
            .values()
            .filter(|s| s.snapshot.root_id == root_id)
            .map(|s| s.snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });
        Ok(snapshots)
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    fn begin_patch(&self, snapshot_id: &str, run: ScanRun) -> Result<Box<dyn PatchSession + '_>> {
        self.state.read().snapshot(snapshot_id)?;
        Ok(Box::new(StoreSession::new(self, snapshot_id, run)))
    }

    fn get_node_by_id(&self, snapshot_id: &str, node_id: &str) -> Result<Option<NodeMeta>> {
        let state = self.state.read();
        Ok(state
            .snapshot(snapshot_id)?
            .nodes_by_id
            .get(node_id)
            .map(|n| n.meta.clone()))
    }

    fn get_node_by_ref(&self, snapshot_id: &str, node_ref: &NodeRef, include_deleted: bool) -> Result<Option<NodeMeta>> {
        let state = self.state.read();
        let policy = state.case_policy(snapshot_id)?;
        let snapshot = state.snapshot(snapshot_id)?;
        let ref_key = node::node_ref_key(node_ref, policy);
        Ok(snapshot
            .by_ref_key
            .get(&ref_key)
            .and_then(|id| snapshot.nodes_by_id.get(id))
            .filter(|n| include_deleted || !n.meta.is_deleted)
            .map(|n| n.meta.clone()))
    }

    fn list_children(
        &self,
        snapshot_id: &str,
        parent_ref: &NodeRef,
        sort: Option<NodeSort>,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        let parent_key = node::parent_key_for(parent_ref)?;
        self.read_page(snapshot_id, |state, _| {
            let children = state
                .nodes_for(state.by_parent_key.get(&parent_key))
                .filter(|n| n.meta.node_ref.vpath != parent_ref.vpath);
            into_page(
                children,
                include_deleted,
                sort.unwrap_or(NodeSort::asc(NodeSortKey::Name)),
                page,
            )
        })
    }

    fn find_by_entity_key(
        &self,
        snapshot_id: &str,
        entity_key: &str,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        self.read_page(snapshot_id, |state, _| {
            into_page(
                state.nodes_for(state.by_entity_key.get(entity_key)),
                include_deleted,
                NodeSort::asc(NodeSortKey::Vpath),
                page,
            )
        })
    }

    fn find_by_os_identity(
        &self,
        snapshot_id: &str,
        identity: &FileIdentity,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        let identity_value = node::identity_value(identity);
        self.read_page(snapshot_id, |state, _| {
            let ids = identity_value.as_ref().and_then(|v| state.by_identity.get(v));
            into_page(
                state.nodes_for(ids),
                include_deleted,
                NodeSort::asc(NodeSortKey::Vpath),
                page,
            )
        })
    }

    fn find_by_hash(
        &self,
        snapshot_id: &str,
        algo: &str,
        value: &str,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        let hash_key = hash_index_key(algo, value);
        self.read_page(snapshot_id, |state, _| {
            into_page(
                state.nodes_for(state.by_hash.get(&hash_key)),
                include_deleted,
                NodeSort::asc(NodeSortKey::Vpath),
                page,
            )
        })
    }

    fn range_by_size(
        &self,
        snapshot_id: &str,
        min: u64,
        max: u64,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        self.read_page(snapshot_id, |state, _| {
            let in_range = state
                .nodes_by_id
                .values()
                .filter(|n| n.meta.size.is_some_and(|size| size >= min && size <= max));
            into_page(in_range, include_deleted, NodeSort::asc(NodeSortKey::Size), page)
        })
    }

    #[instrument(skip(self, query))]
    fn query_nodes(&self, snapshot_id: &str, query: &NodeQuery) -> Result<NodePage> {
        self.read_page(snapshot_id, |state, policy| {
            let default_filter = NodeFilter::default();
            let filter = query.filter.as_ref().unwrap_or(&default_filter);
            let prefix_key = filter
                .vpath_prefix
                .as_ref()
                .map(|prefix| vpath::key(prefix, policy).into_owned());
            let matching = state
                .nodes_by_id
                .values()
                .filter(|n| matches_filter(n, filter, prefix_key.as_deref()));
            into_page(
                matching,
                filter.include_deleted,
                query.sort.unwrap_or(NodeSort::asc(NodeSortKey::Vpath)),
                query.page.as_ref(),
            )
        })
    }
}
