//! Core data types used throughout the treesnap library
//!
//! This module contains the data model shared by the store backends, the
//! comparison engine and the aligner.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Addressing**: [`Layer`], [`NodeRef`] - where a node lives, through zero or
//!   more nested archive layers
//! - **Roots**: [`RootDescriptor`], [`RootCapabilities`] - a scanned OS directory
//! - **Nodes**: [`ObservedNode`] (incoming from a scanner), [`NodeMeta`] (committed)
//! - **Runs and coverage**: [`ScanRun`], [`Coverage`], [`CoverageScope`]
//! - **Snapshots**: [`Snapshot`], [`SnapshotStats`]
//! - **Queries**: [`NodeQuery`], [`NodeFilter`], [`NodeSort`], [`Page`], [`NodePage`]
//!
//! All types serialize with camelCase field names and SCREAMING_SNAKE_CASE
//! enum values, which is also the form persisted by the SQL backend.
//!
//! ## Examples
//!
//! ```rust
//! use treesnap::types::{NodeKind, NodeRef, ObservedNode};
//! use chrono::Utc;
//!
//! let node = ObservedNode::new(NodeRef::os("r:1", "/docs/readme.md"), NodeKind::File, "readme.md", "run:1", Utc::now())
//!     .with_size(1024);
//! assert_eq!(node.size, Some(1024));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Kind of a filesystem or archive node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    /// Directory (or archive directory entry)
    Dir,
    /// Regular file
    File,
    /// Symbolic link
    Symlink,
    /// Device, socket, fifo or anything else
    Special,
}

impl NodeKind {
    /// Stable string form, identical to the serialized value
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Dir => "DIR",
            NodeKind::File => "FILE",
            NodeKind::Symlink => "SYMLINK",
            NodeKind::Special => "SPECIAL",
        }
    }

    /// Parse the serialized form
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DIR" => Some(NodeKind::Dir),
            "FILE" => Some(NodeKind::File),
            "SYMLINK" => Some(NodeKind::Symlink),
            "SPECIAL" => Some(NodeKind::Special),
            _ => None,
        }
    }
}

/// Operating system family of a root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OsKind {
    /// Unix-like systems
    Posix,
    /// Windows
    Windows,
}

impl OsKind {
    /// OS family of the running process
    pub fn current() -> Self {
        if cfg!(windows) {
            OsKind::Windows
        } else {
            OsKind::Posix
        }
    }
}

/// How path names are compared under a root
///
/// `Auto` is never resolved at registration time; it is resolved from the
/// root's capabilities on every operation (see
/// [`resolve_case_policy`](crate::root::resolve_case_policy)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CasePolicy {
    /// Follow the root's `case_sensitive` capability
    Auto,
    /// Byte-exact comparison
    Sensitive,
    /// ASCII-folded comparison
    Insensitive,
}

/// Platform an OS file identity was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityPlatform {
    /// Volume serial + file index
    Windows,
    /// Device + inode
    Posix,
    /// No usable identity
    Unknown,
}

/// State of one content hash on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HashStatus {
    /// Hash computed; `value` is set
    Present,
    /// Not computed yet
    Missing,
    /// Hashing was attempted and failed; `error` is set
    Failed,
    /// Hashing was skipped by policy
    Skipped,
}

/// Classification of an observation-time fault or a path parse fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Path vanished between listing and stat
    NotFound,
    /// Access refused by the OS
    PermissionDenied,
    /// Path exceeds OS limits
    PathTooLong,
    /// Any other I/O failure
    IoError,
    /// Name bytes are not valid UTF-8
    EncodingError,
    /// VPath is malformed
    InvalidVpathFormat,
    /// VPath contains a `..` segment
    InvalidVpathParentSegment,
    /// Unclassified
    Unknown,
}

/// Phase of the scan in which a fault occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStage {
    /// Directory listing
    List,
    /// Metadata lookup
    Stat,
    /// Opening a file or archive
    Open,
    /// Reading content
    Read,
    /// Listing archive entries
    ArchiveList,
    /// Executing a planned file operation
    Execute,
}

/// Fault attached to a node or a coverage scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeError {
    /// Classification
    pub code: ErrorCode,
    /// Scan phase
    pub stage: ErrorStage,
    /// Human readable detail
    pub message: String,
    /// Whether a later scan may succeed
    pub retryable: bool,
    /// Raw OS error code, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_code: Option<String>,
    /// When the fault was observed
    pub at: DateTime<Utc>,
}

/// One content hash of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashValue {
    /// Algorithm label, e.g. `sha256`
    pub algo: String,
    /// Hex digest when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Hash state
    pub status: HashStatus,
    /// Failure detail when `status` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

impl HashValue {
    /// A present hash with the given digest
    pub fn present(algo: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            algo: algo.into(),
            value: Some(value.into()),
            status: HashStatus::Present,
            error: None,
        }
    }

    /// The digest, only when the hash is present and non-empty
    pub fn present_value(&self) -> Option<&str> {
        match (&self.status, &self.value) {
            (HashStatus::Present, Some(value)) if !value.is_empty() => Some(value.as_str()),
            _ => None,
        }
    }
}

/// Content hashes keyed by algorithm
pub type Hashes = BTreeMap<String, HashValue>;

/// Windows file identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsFileId {
    /// Volume serial number (hex)
    pub volume_id: String,
    /// File index (hex)
    pub file_id: String,
}

/// POSIX file identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PosixFileId {
    /// Device number
    pub dev: u64,
    /// Inode number
    pub inode: u64,
}

/// OS-level identity of a file, platform tagged
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIdentity {
    /// Source platform
    pub platform: IdentityPlatform,
    /// Windows identity, when `platform` is `Windows`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<WindowsFileId>,
    /// POSIX identity, when `platform` is `Posix`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posix: Option<PosixFileId>,
    /// Whether the identity may be used for matching
    pub is_available: bool,
}

impl FileIdentity {
    /// No identity available
    pub fn unavailable() -> Self {
        Self {
            platform: IdentityPlatform::Unknown,
            windows: None,
            posix: None,
            is_available: false,
        }
    }

    /// POSIX device/inode identity
    pub fn posix(dev: u64, inode: u64) -> Self {
        Self {
            platform: IdentityPlatform::Posix,
            windows: None,
            posix: Some(PosixFileId { dev, inode }),
            is_available: true,
        }
    }

    /// Windows volume/file-index identity
    pub fn windows(volume_id: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            platform: IdentityPlatform::Windows,
            windows: Some(WindowsFileId {
                volume_id: volume_id.into(),
                file_id: file_id.into(),
            }),
            posix: None,
            is_available: true,
        }
    }
}

impl Default for FileIdentity {
    fn default() -> Self {
        Self::unavailable()
    }
}

/// One level of an addressing stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Layer {
    /// The OS directory of a root
    Os {
        /// Root this layer is tied to
        #[serde(rename = "rootId")]
        root_id: String,
    },
    /// An archive opened from a container file in the layer below
    Archive {
        /// Archive format label, e.g. `zip`
        format: String,
        /// VPath of the container file within the layer below
        #[serde(rename = "containerVPath")]
        container_vpath: String,
    },
}

impl Layer {
    /// Whether this is the OS layer
    pub fn is_os(&self) -> bool {
        matches!(self, Layer::Os { .. })
    }
}

/// Fully qualified virtual location: root, layer stack, vpath
///
/// Equality is structural. Two refs that traverse the same layer stack
/// compare equal through their canonical string and layer signature (see
/// [`node`](crate::node)).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    /// Root the location belongs to
    pub root_id: String,
    /// Layer stack; the first layer is always `Layer::Os`
    pub layers: Vec<Layer>,
    /// Normalized vpath within the innermost layer
    pub vpath: String,
}

impl NodeRef {
    /// A ref on the OS layer of `root_id`
    pub fn os(root_id: impl Into<String>, vpath: impl Into<String>) -> Self {
        let root_id = root_id.into();
        Self {
            layers: vec![Layer::Os { root_id: root_id.clone() }],
            root_id,
            vpath: vpath.into(),
        }
    }

    /// A ref inside an archive nested in this ref's layer stack
    ///
    /// `container_vpath` is the archive file's vpath within the current
    /// innermost layer, and `vpath` the location inside the archive.
    pub fn within_archive(
        &self,
        format: impl Into<String>,
        container_vpath: impl Into<String>,
        vpath: impl Into<String>,
    ) -> Self {
        let mut layers = self.layers.clone();
        layers.push(Layer::Archive {
            format: format.into(),
            container_vpath: container_vpath.into(),
        });
        Self {
            root_id: self.root_id.clone(),
            layers,
            vpath: vpath.into(),
        }
    }

    /// Same root and layers, different vpath
    pub fn with_vpath(&self, vpath: impl Into<String>) -> Self {
        Self {
            root_id: self.root_id.clone(),
            layers: self.layers.clone(),
            vpath: vpath.into(),
        }
    }
}

/// Capabilities detected for a root's filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCapabilities {
    /// Filesystem distinguishes names by case
    pub case_sensitive: bool,
    /// Filesystem exposes stable file ids
    pub supports_file_id: bool,
}

/// A registered OS directory that snapshots are taken of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootDescriptor {
    /// Stable id of the root
    pub root_id: String,
    /// Normalized absolute path string used to deduplicate registrations
    pub root_key: String,
    /// OS family
    pub os: OsKind,
    /// Path as given by the user
    pub os_path: PathBuf,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Configured (unresolved) case policy
    pub case_policy: CasePolicy,
    /// Detected filesystem capabilities
    pub capabilities: RootCapabilities,
}

/// A node as reported by a scanner for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedNode {
    /// Location
    #[serde(rename = "ref")]
    pub node_ref: NodeRef,
    /// Node kind
    pub kind: NodeKind,
    /// Decoded file name (empty for a root)
    pub name: String,
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
    /// Status change time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTime<Utc>>,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthtime: Option<DateTime<Utc>>,
    /// OS identity
    #[serde(default)]
    pub identity: FileIdentity,
    /// Content hashes merged in by post-processing
    #[serde(default)]
    pub hashes: Hashes,
    /// Scanner-specific extra attributes
    #[serde(default)]
    pub extras: serde_json::Value,
    /// Run that observed this node
    pub observed_in_run_id: String,
    /// Observation time
    pub last_observed_at: DateTime<Utc>,
    /// Faults hit while observing this node
    #[serde(default)]
    pub errors: Vec<NodeError>,
}

impl ObservedNode {
    /// Create an observation with no size, times, identity or hashes
    pub fn new(
        node_ref: NodeRef,
        kind: NodeKind,
        name: impl Into<String>,
        run_id: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            node_ref,
            kind,
            name: name.into(),
            size: None,
            mtime: None,
            ctime: None,
            birthtime: None,
            identity: FileIdentity::unavailable(),
            hashes: Hashes::new(),
            extras: serde_json::Value::Object(Default::default()),
            observed_in_run_id: run_id.into(),
            last_observed_at: observed_at,
            errors: Vec::new(),
        }
    }

    /// Set the size
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the modification time
    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.mtime = Some(mtime);
        self
    }

    /// Set the OS identity
    pub fn with_identity(mut self, identity: FileIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Add a present content hash
    pub fn with_hash(mut self, algo: &str, value: &str) -> Self {
        self.hashes.insert(algo.to_string(), HashValue::present(algo, value));
        self
    }

    /// Attach an observation fault
    pub fn with_error(mut self, error: NodeError) -> Self {
        self.errors.push(error);
        self
    }
}

/// A committed node in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    /// Per-snapshot stable id
    pub node_id: String,
    /// Location
    #[serde(rename = "ref")]
    pub node_ref: NodeRef,
    /// Node kind
    pub kind: NodeKind,
    /// Decoded file name
    pub name: String,
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
    /// Status change time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTime<Utc>>,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthtime: Option<DateTime<Utc>>,
    /// OS identity
    pub identity: FileIdentity,
    /// Identity of the real-world object across observations
    pub entity_key: String,
    /// First observation of `entity_key` in this snapshot
    pub first_seen_at: DateTime<Utc>,
    /// Tombstone flag
    pub is_deleted: bool,
    /// Start of the current deletion episode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Content hashes
    pub hashes: Hashes,
    /// Scanner-specific extra attributes
    pub extras: serde_json::Value,
    /// Run that last observed this node
    pub observed_in_run_id: String,
    /// Last observation time
    pub last_observed_at: DateTime<Utc>,
    /// Faults from the last observation
    pub errors: Vec<NodeError>,
}

/// Shape of a scan or comparison scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeMode {
    /// Only the base node
    SingleNode,
    /// Immediate children of the base
    ChildrenOnly,
    /// Base and everything under it
    FullSubtree,
}

/// Region of a tree: base vpath and mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanScope {
    /// Base vpath
    #[serde(rename = "baseVPath")]
    pub base_vpath: String,
    /// Mode
    pub mode: ScopeMode,
}

impl ScanScope {
    /// Create a scope
    pub fn new(base_vpath: impl Into<String>, mode: ScopeMode) -> Self {
        Self {
            base_vpath: base_vpath.into(),
            mode,
        }
    }

    /// Whole tree from `/`
    pub fn whole_tree() -> Self {
        Self::new("/", ScopeMode::FullSubtree)
    }
}

/// Whether a scope was fully observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeCompleteness {
    /// Every node in the scope was observed
    Complete,
    /// Some of the scope could not be observed
    Partial,
}

/// Coverage outcome for one scope of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageScope {
    /// The scope
    pub scope: ScanScope,
    /// Outcome
    pub completeness: ScopeCompleteness,
    /// Representative faults (capped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<NodeError>>,
}

impl CoverageScope {
    /// A fully observed scope
    pub fn complete(scope: ScanScope) -> Self {
        Self {
            scope,
            completeness: ScopeCompleteness::Complete,
            errors: None,
        }
    }

    /// A partially observed scope
    pub fn partial(scope: ScanScope) -> Self {
        Self {
            scope,
            completeness: ScopeCompleteness::Partial,
            errors: None,
        }
    }
}

/// Coverage report of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    /// Run the report belongs to
    pub run_id: String,
    /// Per-scope outcomes
    pub scopes: Vec<CoverageScope>,
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// In progress
    Running,
    /// Completed
    Finished,
    /// Stopped by the caller
    Canceled,
    /// Stopped by a fault
    Failed,
}

/// One scan pass over a root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRun {
    /// Run id
    pub run_id: String,
    /// Root being scanned
    pub root_id: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Scopes the scanner was asked to cover
    pub requested_scopes: Vec<ScanScope>,
    /// Status
    pub status: RunStatus,
}

impl ScanRun {
    /// A running scan of the whole tree
    pub fn new(run_id: impl Into<String>, root_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            root_id: root_id.into(),
            started_at,
            finished_at: None,
            requested_scopes: vec![ScanScope::whole_tree()],
            status: RunStatus::Running,
        }
    }
}

/// Aggregate counts of live nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    /// All live nodes
    pub node_count: u64,
    /// Live directories
    pub dir_count: u64,
    /// Live files
    pub file_count: u64,
}

/// Latest observed state of one root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Snapshot id
    pub snapshot_id: String,
    /// Root this snapshot observes
    pub root_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last committed patch
    pub last_patched_at: DateTime<Utc>,
    /// Run of the last committed patch (empty before the first)
    pub last_run_id: String,
    /// Coverage of the last committed patch
    pub last_coverage: Coverage,
    /// Live node counts
    pub stats: SnapshotStats,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortOrder {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// Primary sort key of a node listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeSortKey {
    /// Case-normalized name
    Name,
    /// Case-normalized vpath
    Vpath,
    /// Size, absent values first when ascending
    Size,
    /// Modification time, absent values first when ascending
    Mtime,
    /// First observation of the entity
    FirstSeenAt,
    /// Last observation
    LastObservedAt,
}

/// Sort specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSort {
    /// Primary key
    pub key: NodeSortKey,
    /// Direction of the primary key
    pub order: SortOrder,
}

impl NodeSort {
    /// Ascending by `key`
    pub fn asc(key: NodeSortKey) -> Self {
        Self { key, order: SortOrder::Asc }
    }

    /// Descending by `key`
    pub fn desc(key: NodeSortKey) -> Self {
        Self { key, order: SortOrder::Desc }
    }
}

/// Page request: at most `limit` rows starting at `cursor`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Maximum rows returned
    pub limit: usize,
    /// Opaque cursor from a previous page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl Page {
    /// First page
    pub fn first(limit: usize) -> Self {
        Self { limit, cursor: None }
    }

    /// Page following `cursor`
    pub fn after(limit: usize, cursor: impl Into<String>) -> Self {
        Self {
            limit,
            cursor: Some(cursor.into()),
        }
    }
}

/// Exact hash filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashFilter {
    /// Algorithm label
    pub algo: String,
    /// Digest
    pub value: String,
}

/// Node filter for [`NodeQuery`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFilter {
    /// Allowed kinds (an empty list does not restrict)
    pub kinds: Option<Vec<NodeKind>>,
    /// Subtree (compared on case-normalized keys)
    pub vpath_prefix: Option<String>,
    /// Last observed in this run
    pub observed_in_run_id: Option<String>,
    /// With or without observation faults
    pub has_errors: Option<bool>,
    /// Inclusive lower size bound
    pub min_size: Option<u64>,
    /// Inclusive upper size bound
    pub max_size: Option<u64>,
    /// Present hash with this value
    pub hash: Option<HashFilter>,
    /// Exact entity key
    pub entity_key: Option<String>,
    /// Include tombstoned nodes
    #[serde(default)]
    pub include_deleted: bool,
}

/// General node query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeQuery {
    /// Filter (none matches all live nodes)
    pub filter: Option<NodeFilter>,
    /// Sort (defaults to vpath ascending)
    pub sort: Option<NodeSort>,
    /// Page (defaults to everything)
    pub page: Option<Page>,
}

/// One page of query results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePage {
    /// Nodes in sort order
    pub nodes: Vec<NodeMeta>,
    /// Cursor of the next page, if more rows follow
    pub next_cursor: Option<String>,
}
