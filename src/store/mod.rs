//! Snapshot storage
//!
//! A snapshot holds the latest observed state of one root: every node a
//! scanner has reported, live or tombstoned, plus the coverage of the last
//! committed patch. Snapshots are updated through a [`PatchSession`]:
//!
//! 1. [`SnapshotStore::begin_patch`] opens a session for one [`ScanRun`].
//! 2. [`PatchSession::upsert_nodes`] inserts or updates nodes, matching
//!    existing ones by their ref key and keeping their node id and the
//!    entity's first-seen time.
//! 3. [`PatchSession::record_coverage`] stores the run's coverage report.
//! 4. [`PatchSession::commit`] tombstones every live node inside a
//!    COMPLETE scope that this run did not observe, then refreshes the
//!    snapshot's stats.
//!
//! Two backends implement [`SnapshotStore`] with identical observable
//! behavior: [`MemorySnapshotStore`] and [`SqliteSnapshotStore`]. Use
//! [`StoreBuilder`] to create either with an injected clock and id
//! generator.
//!
//! ## Example
//!
//! ```rust
//! use treesnap::store::{SnapshotStore, StoreBuilder};
//! use treesnap::types::*;
//! use chrono::Utc;
//!
//! # fn main() -> treesnap::Result<()> {
//! let store = StoreBuilder::new().build_memory();
//! let root = store.register_root(RootDescriptor::new("r:1", "/data", OsKind::Posix, Utc::now())?)?;
//! let snapshot = store.create_snapshot(&root.root_id)?;
//!
//! let run = ScanRun::new("run:1", "r:1", Utc::now());
//! let mut session = store.begin_patch(&snapshot.snapshot_id, run)?;
//! session.upsert_nodes(&[ObservedNode::new(NodeRef::os("r:1", "/"), NodeKind::Dir, "", "run:1", Utc::now())])?;
//! session.record_coverage(Coverage {
//!     run_id: "run:1".to_string(),
//!     scopes: vec![CoverageScope::complete(ScanScope::whole_tree())],
//! })?;
//! session.commit()?;
//!
//! assert_eq!(store.get_snapshot(&snapshot.snapshot_id)?.stats.dir_count, 1);
//! # Ok(())
//! # }
//! ```

mod memory;
mod session;
mod sqlite;

pub use memory::MemorySnapshotStore;
pub use sqlite::SqliteSnapshotStore;

use crate::clock::{Clock, IdGenerator, SystemClock, UuidIdGenerator};
use crate::error::{Result, TreesnapError};
use crate::node;
use crate::types::{
    CasePolicy, Coverage, FileIdentity, Hashes, NodeMeta, NodePage, NodeQuery, NodeRef, NodeSort, ObservedNode, Page,
    RootDescriptor, ScanRun, ScanScope, ScopeMode, Snapshot,
};
use crate::vpath;
use std::path::Path;
use std::sync::Arc;

/// Prefix of generated snapshot ids
pub const SNAPSHOT_ID_PREFIX: &str = "s:";
/// Prefix of per-snapshot node ids
pub const NODE_ID_PREFIX: &str = "n:";
/// Digits of the per-snapshot node counter
pub const NODE_ID_WIDTH: usize = 12;
/// Largest node size either backend stores (SQLite integers are signed 64-bit)
pub const MAX_STORABLE_SIZE: u64 = i64::MAX as u64;

/// Persistent or in-memory home of roots, snapshots and their nodes
///
/// All methods take `&self`; implementations synchronize internally and are
/// safe to share across threads. Patch sessions against the same snapshot
/// must still be serialized by the caller.
pub trait SnapshotStore: Send + Sync {
    /// Register a root, or return the descriptor already registered under its root key
    ///
    /// # Errors
    ///
    /// [`TreesnapError::RootIdConflict`] if `desc.root_id` is already used by
    /// a root with a different root key.
    fn register_root(&self, desc: RootDescriptor) -> Result<RootDescriptor>;

    /// Look up a root by id
    fn get_root(&self, root_id: &str) -> Result<RootDescriptor>;

    /// Look up a root by its normalized root key
    fn find_root_by_key(&self, root_key: &str) -> Result<Option<RootDescriptor>>;

    /// All registered roots ordered by root id
    fn list_roots(&self) -> Result<Vec<RootDescriptor>>;

    /// Create an empty snapshot of a registered root
    fn create_snapshot(&self, root_id: &str) -> Result<Snapshot>;

    /// Look up a snapshot by id
    fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;

    /// Snapshots of one root ordered by creation time, then id
    fn list_snapshots(&self, root_id: &str) -> Result<Vec<Snapshot>>;

    /// Open a single-use patch session for `run`
    fn begin_patch(&self, snapshot_id: &str, run: ScanRun) -> Result<Box<dyn PatchSession + '_>>;

    /// Node by id, live or tombstoned
    fn get_node_by_id(&self, snapshot_id: &str, node_id: &str) -> Result<Option<NodeMeta>>;

    /// Node occupying `node_ref` under the root's case policy
    fn get_node_by_ref(&self, snapshot_id: &str, node_ref: &NodeRef, include_deleted: bool) -> Result<Option<NodeMeta>>;

    /// Immediate children of `parent_ref` within the same layer (default sort: name ascending)
    fn list_children(
        &self,
        snapshot_id: &str,
        parent_ref: &NodeRef,
        sort: Option<NodeSort>,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage>;

    /// Nodes carrying `entity_key`, by vpath
    fn find_by_entity_key(
        &self,
        snapshot_id: &str,
        entity_key: &str,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage>;

    /// Nodes with the given OS identity, by vpath (empty for an unavailable identity)
    fn find_by_os_identity(
        &self,
        snapshot_id: &str,
        identity: &FileIdentity,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage>;

    /// Nodes with a present hash `algo` equal to `value`, by vpath
    fn find_by_hash(
        &self,
        snapshot_id: &str,
        algo: &str,
        value: &str,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage>;

    /// Nodes whose size lies in `min..=max`, by size
    fn range_by_size(
        &self,
        snapshot_id: &str,
        min: u64,
        max: u64,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage>;

    /// General filtered, sorted, paginated query (default sort: vpath ascending)
    fn query_nodes(&self, snapshot_id: &str, query: &NodeQuery) -> Result<NodePage>;
}

/// Single-use unit of work that applies one run's observations to a snapshot
///
/// Once [`commit`](PatchSession::commit) succeeds or
/// [`abort`](PatchSession::abort) is called, every further call except
/// `abort` fails with [`TreesnapError::SessionClosed`]. Aborting does not
/// undo batches that were already upserted; it only skips reconciliation.
pub trait PatchSession {
    /// Insert or update a batch of observed nodes
    ///
    /// The batch is applied atomically: if any node has an invalid layer
    /// stack, none of the batch is stored.
    fn upsert_nodes(&mut self, nodes: &[ObservedNode]) -> Result<()>;

    /// Record the run's coverage report (its run id must match the session's run)
    fn record_coverage(&mut self, coverage: Coverage) -> Result<()>;

    /// Reconcile COMPLETE scopes, refresh stats and close the session
    fn commit(&mut self) -> Result<()>;

    /// Close the session without reconciling
    ///
    /// Idempotent: aborting a committed or already aborted session is a no-op.
    fn abort(&mut self) -> Result<()>;
}

/// Builder for snapshot stores
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use treesnap::clock::SequentialIdGenerator;
/// use treesnap::store::{SnapshotStore, StoreBuilder};
///
/// # fn main() -> treesnap::Result<()> {
/// let store = StoreBuilder::new()
///     .id_generator(Arc::new(SequentialIdGenerator::new()))
///     .in_memory_sqlite()?;
/// assert!(store.list_roots()?.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StoreBuilder {
    clock: Arc<dyn Clock>,
    id_generator: Arc<dyn IdGenerator>,
}

impl StoreBuilder {
    /// Builder with the system clock and UUID snapshot ids
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            id_generator: Arc::new(UuidIdGenerator),
        }
    }

    /// Set the clock used for commit and tombstone times
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the generator of snapshot ids
    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Build an in-memory store
    pub fn build_memory(self) -> MemorySnapshotStore {
        MemorySnapshotStore::with_dependencies(self.clock, self.id_generator)
    }

    /// Open (or create) a SQLite store at `path`
    pub fn open_sqlite(self, path: impl AsRef<Path>) -> Result<SqliteSnapshotStore> {
        SqliteSnapshotStore::open_with(path.as_ref(), self.clock, self.id_generator)
    }

    /// Open a SQLite store that lives only in memory
    pub fn in_memory_sqlite(self) -> Result<SqliteSnapshotStore> {
        SqliteSnapshotStore::open_in_memory_with(self.clock, self.id_generator)
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys computed once per stored node and indexed by both backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DerivedKeys {
    pub layers_json: String,
    pub layers_sig: String,
    pub vpath_key: String,
    pub parent_key: String,
    pub name_key: String,
    pub identity_value: Option<String>,
    pub canonical: String,
    pub os_vpath: String,
    pub os_vpath_key: String,
    /// [`hash_index_key`] of each present hash
    pub hash_keys: Vec<String>,
}

impl DerivedKeys {
    /// Derive all index keys of a node
    pub fn derive(
        node_ref: &NodeRef,
        name: &str,
        identity: &FileIdentity,
        hashes: &Hashes,
        policy: CasePolicy,
    ) -> Result<Self> {
        let canonical = node::canonical_string(node_ref)?;
        let os_vpath = node::os_layer_vpath(node_ref).to_string();
        Ok(Self {
            layers_json: serde_json::to_string(&node_ref.layers)?,
            layers_sig: node::layers_signature(&node_ref.layers),
            vpath_key: vpath::key(&node_ref.vpath, policy).into_owned(),
            parent_key: node::parent_key_of(node_ref)?,
            name_key: node::name_key(name, policy),
            identity_value: node::identity_value(identity),
            canonical,
            os_vpath_key: vpath::key(&os_vpath, policy).into_owned(),
            os_vpath,
            hash_keys: present_hash_keys(hashes),
        })
    }

    /// Derive the keys of an incoming observation
    ///
    /// Both backends call this on a whole batch before touching any state,
    /// so an observation neither can hold rejects the batch everywhere alike.
    pub fn of_observed(node: &ObservedNode, policy: CasePolicy) -> Result<Self> {
        if let Some(size) = node.size.filter(|size| *size > MAX_STORABLE_SIZE) {
            return Err(TreesnapError::SizeOutOfRange {
                vpath: node.node_ref.vpath.clone(),
                size,
            });
        }
        Self::derive(&node.node_ref, &node.name, &node.identity, &node.hashes, policy)
    }
}

/// Index key of one hash
///
/// Algorithm and value are joined with U+001F, which neither contains, so
/// `("a:b", "c")` and `("a", "b:c")` stay distinct.
pub(crate) fn hash_index_key(algo: &str, value: &str) -> String {
    format!("{}\u{1f}{}", algo, value)
}

/// Index keys of the present hashes
pub(crate) fn present_hash_keys(hashes: &Hashes) -> Vec<String> {
    hashes
        .values()
        .filter_map(|hash| hash.present_value().map(|value| hash_index_key(&hash.algo, value)))
        .collect()
}

/// Whether an OS-layer vpath key falls inside a reconciliation scope
///
/// `base_key` and `candidate_key` must both be case-normalized with the
/// same policy.
pub(crate) fn scope_contains(mode: ScopeMode, base_key: &str, candidate_key: &str) -> bool {
    match mode {
        ScopeMode::FullSubtree => vpath::has_prefix(candidate_key, base_key),
        ScopeMode::ChildrenOnly => vpath::is_immediate_child(base_key, candidate_key),
        ScopeMode::SingleNode => candidate_key == base_key,
    }
}

/// Reconciliation scope with its base already normalized
pub(crate) fn scope_base_key(scope: &ScanScope, policy: CasePolicy) -> String {
    vpath::key(&scope.base_vpath, policy).into_owned()
}

/// Offset encoded in a page cursor (`0` when absent)
pub(crate) fn cursor_offset(page: Option<&Page>) -> Result<usize> {
    match page.and_then(|p| p.cursor.as_deref()) {
        None => Ok(0),
        Some(cursor) => cursor
            .trim()
            .parse::<usize>()
            .map_err(|_| TreesnapError::InvalidCursor(cursor.to_string())),
    }
}

/// Slice a fully sorted result list down to one page
pub(crate) fn paginate<T>(items: Vec<T>, page: Option<&Page>) -> Result<(Vec<T>, Option<String>)> {
    let Some(page) = page else {
        return Ok((items, None));
    };
    let offset = cursor_offset(Some(page))?;
    let total = items.len();
    let end = offset.saturating_add(page.limit);
    let next_cursor = if end < total { Some(end.to_string()) } else { None };
    let sliced = items.into_iter().skip(offset).take(page.limit).collect();
    Ok((sliced, next_cursor))
}
