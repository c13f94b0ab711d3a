//! # Treesnap - Coverage-aware file tree snapshots
//!
//! Treesnap records what a scanner observed about a directory tree (and the
//! archives nested inside it) as point-in-time snapshots, then answers
//! questions about them: what changed between two snapshots, where a file
//! went after a rename, and how the same tree looks across many snapshots.
//!
//! The library never claims more than was observed. Every scan run reports
//! which scopes it covered completely, and only those scopes can mark nodes
//! as deleted or produce definite diff entries.
//!
//! ## Quick Start
//!
//! ```rust
//! use treesnap::{Comparer, CompareOptions, SnapshotStore, StoreBuilder};
//! use treesnap::types::*;
//! use chrono::Utc;
//!
//! # fn main() -> treesnap::Result<()> {
//! let store = StoreBuilder::new().build_memory();
//! store.register_root(RootDescriptor::new("r:1", "/srv/data", OsKind::Posix, Utc::now())?)?;
//!
//! // First scan: the whole tree, completely observed
//! let before = store.create_snapshot("r:1")?;
//! let run = ScanRun::new("run:1", "r:1", Utc::now());
//! let mut session = store.begin_patch(&before.snapshot_id, run)?;
//! session.upsert_nodes(&[
//!     ObservedNode::new(NodeRef::os("r:1", "/"), NodeKind::Dir, "", "run:1", Utc::now()),
//!     ObservedNode::new(NodeRef::os("r:1", "/a.txt"), NodeKind::File, "a.txt", "run:1", Utc::now())
//!         .with_size(3),
//! ])?;
//! session.record_coverage(Coverage {
//!     run_id: "run:1".to_string(),
//!     scopes: vec![CoverageScope::complete(ScanScope::whole_tree())],
//! })?;
//! session.commit()?;
//!
//! // Second scan: the file grew
//! let after = store.create_snapshot("r:1")?;
//! let run = ScanRun::new("run:2", "r:1", Utc::now());
//! let mut session = store.begin_patch(&after.snapshot_id, run)?;
//! session.upsert_nodes(&[
//!     ObservedNode::new(NodeRef::os("r:1", "/"), NodeKind::Dir, "", "run:2", Utc::now()),
//!     ObservedNode::new(NodeRef::os("r:1", "/a.txt"), NodeKind::File, "a.txt", "run:2", Utc::now())
//!         .with_size(5),
//! ])?;
//! session.record_coverage(Coverage {
//!     run_id: "run:2".to_string(),
//!     scopes: vec![CoverageScope::complete(ScanScope::whole_tree())],
//! })?;
//! session.commit()?;
//!
//! let diff = Comparer::new(&store).compare(&before.snapshot_id, &after.snapshot_id, &CompareOptions::default())?;
//! assert_eq!(diff.summary.modified, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### VPaths and Node References
//!
//! Locations are slash-separated virtual paths ([`vpath`]) with percent
//! escaping for names that contain `/` or `%`. A [`NodeRef`](types::NodeRef)
//! pairs a root id with a stack of layers: the OS layer, then one layer per
//! archive the node sits inside. [`node`] derives the canonical string and
//! the lookup keys (ref key, parent key, entity key) from a reference.
//!
//! ### Snapshots and Patch Sessions
//!
//! A snapshot is filled by one or more scan runs. Each run opens a
//! [`PatchSession`], upserts observed nodes in batches, records its
//! coverage report and commits. On commit every COMPLETE scope marks the
//! live nodes it did not see as deleted; PARTIAL scopes delete nothing.
//!
//! ### Comparison
//!
//! [`Comparer`] weighs evidence (path, name, size, mtime, OS file id,
//! content hash) under an [`IdentityPolicy`](compare::IdentityPolicy) and
//! produces verdicts with a confidence. Removed and added nodes can be
//! paired into moves. Regions without complete coverage come back as
//! `NOT_COVERED` or `UNKNOWN` rather than as invented changes.
//!
//! ### Alignment
//!
//! [`Aligner`] lines up N snapshots row by row under a key strategy (path,
//! OS identity, content hash, or a composite) and reports a per-cell state
//! with a fingerprint of the node found there.
//!
//! ## Storage Backends
//!
//! - [`MemorySnapshotStore`]: indexed in-memory maps behind a lock, useful
//!   for tests and short-lived tools
//! - [`SqliteSnapshotStore`]: a single SQLite database file (or an
//!   in-memory database) with the same observable behavior
//!
//! Both take an injectable [`Clock`](clock::Clock) and
//! [`IdGenerator`](clock::IdGenerator) so results are reproducible.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, TreesnapError>`. Faults met while
//! scanning (permission denied, unreadable archive entries) are not errors:
//! they are carried as [`NodeError`](types::NodeError) values on the node
//! or on the coverage scope they affected.
//!
//! ## Module Organization
//!
//! - [`types`]: shared data structures
//! - [`vpath`]: path normalization and escaping
//! - [`node`]: canonical strings and derived keys
//! - [`root`]: root descriptors, case policy and OS identity
//! - [`coverage`]: coverage tracking for scanners
//! - [`store`]: the snapshot store trait and its backends
//! - [`compare`]: evidence matching, diffing and move detection
//! - [`align`]: N-way alignment
//! - [`clock`]: time and id sources
//! - [`error`]: error types and handling

// Public API modules
pub mod align;
pub mod clock;
pub mod compare;
pub mod coverage;
pub mod error;
pub mod node;
pub mod root;
pub mod store;
pub mod types;
pub mod utils;
pub mod vpath;

// Internal modules (not part of public API)
mod collections;

// Re-export main types for convenience
pub use align::{AlignKeyStrategy, AlignKeyType, Aligner, AlignmentResult};
pub use clock::{Clock, IdGenerator, ManualClock, SequentialIdGenerator, SystemClock, UuidIdGenerator};
pub use compare::{CompareMode, CompareOptions, Comparer, DiffEntryType, DiffResult, Verdict};
pub use error::{Result, TreesnapError};
pub use store::{MemorySnapshotStore, PatchSession, SnapshotStore, SqliteSnapshotStore, StoreBuilder};
