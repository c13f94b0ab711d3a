//! Integration tests for Treesnap
//!
//! Every scenario runs against both store backends through the same
//! harness, so the two implementations are held to identical behavior:
//! coverage-gated tombstoning, node identity across runs, patch session
//! rules, queries, comparison and alignment.

use ::treesnap::align::{AlignKeyStrategy, AlignKeyType, CellState};
use ::treesnap::compare::{Confidence, EvidenceType};
use ::treesnap::types::*;
use ::treesnap::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// Fixed start of every harness clock
pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Directory observation (run id and time are filled in by the harness)
pub fn dir(vpath: &str) -> ObservedNode {
    ObservedNode::new(NodeRef::os("r:test", vpath), NodeKind::Dir, last_name(vpath), "", t0())
}

/// File observation (run id and time are filled in by the harness)
pub fn file(vpath: &str, size: u64) -> ObservedNode {
    ObservedNode::new(NodeRef::os("r:test", vpath), NodeKind::File, last_name(vpath), "", t0()).with_size(size)
}

fn last_name(vpath: &str) -> String {
    vpath::last_segment(vpath).to_string()
}

/// Store implementation under test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
}

impl Backend {
    pub fn all() -> [Backend; 2] {
        [Backend::Memory, Backend::Sqlite]
    }
}

/// Store plus one registered root and a run counter
pub struct TreesnapTestHarness {
    pub store: Box<dyn SnapshotStore>,
    pub root_id: String,
    pub clock: Arc<ManualClock>,
    pub backend: Backend,
    runs: u64,
    _dir: Option<TempDir>,
}

impl TreesnapTestHarness {
    /// Harness over a case-sensitive POSIX root
    pub fn new(backend: Backend) -> Self {
        Self::with_case_policy(backend, CasePolicy::Auto)
    }

    /// Harness whose root uses `policy`
    pub fn with_case_policy(backend: Backend, policy: CasePolicy) -> Self {
        let clock = Arc::new(ManualClock::stepping(t0(), Duration::seconds(1)));
        let builder = StoreBuilder::new()
            .clock(clock.clone())
            .id_generator(Arc::new(SequentialIdGenerator::new()));
        let (store, dir): (Box<dyn SnapshotStore>, Option<TempDir>) = match backend {
            Backend::Memory => (Box::new(builder.build_memory()), None),
            Backend::Sqlite => {
                let dir = TempDir::new().unwrap();
                let store = builder.open_sqlite(dir.path().join("treesnap.db")).unwrap();
                (Box::new(store), Some(dir))
            }
        };
        let desc = RootDescriptor::new("r:test", "/fixture", OsKind::Posix, t0())
            .unwrap()
            .with_case_policy(policy);
        store.register_root(desc).unwrap();
        Self {
            store,
            root_id: "r:test".to_string(),
            clock,
            backend,
            runs: 0,
            _dir: dir,
        }
    }

    /// Create an empty snapshot of the root
    pub fn snapshot(&self) -> String {
        self.store.create_snapshot(&self.root_id).unwrap().snapshot_id
    }

    /// Apply one run of `nodes` with the given coverage and commit it
    pub fn scan(&mut self, snapshot_id: &str, nodes: &[ObservedNode], scopes: Vec<CoverageScope>) -> anyhow::Result<String> {
        self.runs += 1;
        let run_id = format!("run:{}", self.runs);
        let observed_at = t0() + Duration::minutes(self.runs as i64);
        let nodes: Vec<ObservedNode> = nodes
            .iter()
            .cloned()
            .map(|mut n| {
                n.observed_in_run_id = run_id.clone();
                n.last_observed_at = observed_at;
                n
            })
            .collect();

        let mut run = ScanRun::new(run_id.clone(), self.root_id.clone(), observed_at);
        run.requested_scopes = scopes.iter().map(|s| s.scope.clone()).collect();
        let mut session = self.store.begin_patch(snapshot_id, run)?;
        for batch in nodes.chunks(3) {
            session.upsert_nodes(batch)?;
        }
        session.record_coverage(Coverage {
            run_id: run_id.clone(),
            scopes,
        })?;
        session.commit()?;
        info!("{:?}: committed {} with {} nodes", self.backend, run_id, nodes.len());
        Ok(run_id)
    }

    /// Apply one run that completely covers the whole tree
    pub fn scan_complete(&mut self, snapshot_id: &str, nodes: &[ObservedNode]) -> anyhow::Result<String> {
        self.scan(snapshot_id, nodes, vec![CoverageScope::complete(ScanScope::whole_tree())])
    }

    /// Node at `vpath` on the OS layer
    pub fn node(&self, snapshot_id: &str, vpath: &str, include_deleted: bool) -> Option<NodeMeta> {
        self.store
            .get_node_by_ref(snapshot_id, &NodeRef::os(&self.root_id, vpath), include_deleted)
            .unwrap()
    }

    /// Vpaths of all live nodes, in vpath order
    pub fn live_vpaths(&self, snapshot_id: &str) -> Vec<String> {
        self.store
            .query_nodes(snapshot_id, &NodeQuery::default())
            .unwrap()
            .nodes
            .into_iter()
            .map(|n| n.node_ref.vpath)
            .collect()
    }
}

fn base_tree() -> Vec<ObservedNode> {
    vec![
        dir("/"),
        dir("/docs"),
        file("/docs/a.txt", 10),
        file("/docs/b.txt", 20),
        dir("/docs/deep"),
        file("/docs/deep/c.txt", 30),
        file("/top.bin", 40),
    ]
}

fn without(nodes: &[ObservedNode], vpaths: &[&str]) -> Vec<ObservedNode> {
    nodes
        .iter()
        .filter(|n| !vpaths.contains(&n.node_ref.vpath.as_str()))
        .cloned()
        .collect()
}

#[test]
fn test_complete_rescan_tombstones_and_revives() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &base_tree()).unwrap();
        let stats = h.store.get_snapshot(&snapshot).unwrap().stats;
        assert_eq!((stats.node_count, stats.dir_count, stats.file_count), (7, 3, 4), "{:?}", backend);

        let before = h.node(&snapshot, "/docs/b.txt", false).unwrap();
        h.scan_complete(&snapshot, &without(&base_tree(), &["/docs/b.txt"])).unwrap();

        assert!(h.node(&snapshot, "/docs/b.txt", false).is_none(), "{:?}", backend);
        let tombstone = h.node(&snapshot, "/docs/b.txt", true).unwrap();
        assert!(tombstone.is_deleted);
        assert!(tombstone.deleted_at.is_some());
        assert_eq!(tombstone.node_id, before.node_id);
        assert_eq!(tombstone.observed_in_run_id, "run:1");
        assert_eq!(h.store.get_snapshot(&snapshot).unwrap().stats.node_count, 6);

        h.scan_complete(&snapshot, &base_tree()).unwrap();
        let revived = h.node(&snapshot, "/docs/b.txt", false).unwrap();
        assert!(!revived.is_deleted);
        assert_eq!(revived.deleted_at, None);
        assert_eq!(revived.node_id, before.node_id, "{:?}", backend);
        assert_eq!(revived.first_seen_at, before.first_seen_at);
        assert_eq!(revived.observed_in_run_id, "run:3");
    }
}

#[test]
fn test_tombstone_time_comes_from_store_clock() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &base_tree()).unwrap();
        h.clock.set(t0() + Duration::days(3));
        h.scan_complete(&snapshot, &without(&base_tree(), &["/top.bin"])).unwrap();

        let tombstone = h.node(&snapshot, "/top.bin", true).unwrap();
        assert_eq!(tombstone.deleted_at, Some(t0() + Duration::days(3)), "{:?}", backend);
        assert_eq!(h.store.get_snapshot(&snapshot).unwrap().last_patched_at, t0() + Duration::days(3));
    }
}

#[test]
fn test_partial_scope_never_tombstones() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &base_tree()).unwrap();
        h.scan(&snapshot, &[dir("/")], vec![CoverageScope::partial(ScanScope::whole_tree())])
            .unwrap();

        assert_eq!(h.live_vpaths(&snapshot).len(), 7, "{:?}", backend);
        let stored = h.store.get_snapshot(&snapshot).unwrap();
        assert_eq!(stored.last_run_id, "run:2");
        assert_eq!(stored.last_coverage.scopes[0].completeness, ScopeCompleteness::Partial);
    }
}

#[test]
fn test_children_only_scope_limits_reconciliation() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &base_tree()).unwrap();
        h.scan(
            &snapshot,
            &[dir("/docs/deep")],
            vec![CoverageScope::complete(ScanScope::new("/docs", ScopeMode::ChildrenOnly))],
        )
        .unwrap();

        assert_eq!(
            h.live_vpaths(&snapshot),
            vec!["/", "/docs", "/docs/deep", "/docs/deep/c.txt", "/top.bin"],
            "{:?}",
            backend
        );
    }
}

#[test]
fn test_single_node_scope_reconciles_only_its_base() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &base_tree()).unwrap();
        h.scan(
            &snapshot,
            &[],
            vec![CoverageScope::complete(ScanScope::new("/docs/a.txt", ScopeMode::SingleNode))],
        )
        .unwrap();

        assert!(h.node(&snapshot, "/docs/a.txt", false).is_none(), "{:?}", backend);
        assert_eq!(h.live_vpaths(&snapshot).len(), 6);
    }
}

#[test]
fn test_subtree_scope_does_not_leak_into_siblings() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        let mut tree = base_tree();
        tree.push(dir("/docs2"));
        tree.push(file("/docs2/keep.txt", 1));
        h.scan_complete(&snapshot, &tree).unwrap();
        h.scan(
            &snapshot,
            &[dir("/docs")],
            vec![CoverageScope::complete(ScanScope::new("/docs", ScopeMode::FullSubtree))],
        )
        .unwrap();

        assert_eq!(
            h.live_vpaths(&snapshot),
            vec!["/", "/docs", "/docs2", "/docs2/keep.txt", "/top.bin"],
            "{:?}",
            backend
        );
    }
}

#[test]
fn test_reupsert_keeps_a_single_node() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &[dir("/"), file("/a.txt", 1), file("/a.txt", 2), file("/a.txt", 3)])
            .unwrap();

        let files = h
            .store
            .query_nodes(
                &snapshot,
                &NodeQuery {
                    filter: Some(NodeFilter {
                        kinds: Some(vec![NodeKind::File]),
                        ..NodeFilter::default()
                    }),
                    ..NodeQuery::default()
                },
            )
            .unwrap()
            .nodes;
        assert_eq!(files.len(), 1, "{:?}", backend);
        assert_eq!(files[0].size, Some(3));
        assert_eq!(files[0].node_id, "n:000000000002");
    }
}

#[test]
fn test_case_insensitive_root_merges_case_variants() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::with_case_policy(backend, CasePolicy::Insensitive);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &[dir("/"), file("/Readme.MD", 1)]).unwrap();
        let first = h.node(&snapshot, "/readme.md", false).unwrap();
        h.scan_complete(&snapshot, &[dir("/"), file("/README.md", 2)]).unwrap();

        let live = h.store.query_nodes(&snapshot, &NodeQuery::default()).unwrap().nodes;
        assert_eq!(live.len(), 2, "{:?}", backend);
        let node = h.node(&snapshot, "/README.MD", false).unwrap();
        assert_eq!(node.node_id, first.node_id);
        assert_eq!(node.node_ref.vpath, "/README.md");
        assert_eq!(node.size, Some(2));
    }
}

#[test]
fn test_session_lifecycle_errors() {
    for backend in Backend::all() {
        let h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();

        let mut session = h.store.begin_patch(&snapshot, ScanRun::new("run:a", "r:test", t0())).unwrap();
        assert!(matches!(session.commit(), Err(TreesnapError::CoverageNotRecorded)));
        let wrong = Coverage {
            run_id: "run:other".to_string(),
            scopes: vec![],
        };
        assert!(matches!(
            session.record_coverage(wrong),
            Err(TreesnapError::CoverageRunMismatch { .. })
        ));
        session
            .record_coverage(Coverage {
                run_id: "run:a".to_string(),
                scopes: vec![CoverageScope::complete(ScanScope::whole_tree())],
            })
            .unwrap();
        session.commit().unwrap();
        assert!(matches!(session.upsert_nodes(&[dir("/")]), Err(TreesnapError::SessionClosed)));
        assert!(matches!(session.commit(), Err(TreesnapError::SessionClosed)));
        session.abort().unwrap();
        assert!(matches!(session.commit(), Err(TreesnapError::SessionClosed)));

        let mut aborted = h.store.begin_patch(&snapshot, ScanRun::new("run:b", "r:test", t0())).unwrap();
        aborted.abort().unwrap();
        aborted.abort().unwrap();
        assert!(matches!(aborted.upsert_nodes(&[dir("/")]), Err(TreesnapError::SessionClosed)), "{:?}", backend);
        assert!(matches!(
            h.store.begin_patch("s:missing", ScanRun::new("run:c", "r:test", t0())),
            Err(TreesnapError::SnapshotNotFound(_))
        ));
    }
}

#[test]
fn test_abort_keeps_upserts_but_skips_reconciliation() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &base_tree()).unwrap();

        let mut session = h.store.begin_patch(&snapshot, ScanRun::new("run:x", "r:test", t0())).unwrap();
        let mut extra = file("/new.txt", 5);
        extra.observed_in_run_id = "run:x".to_string();
        session.upsert_nodes(&[extra]).unwrap();
        session
            .record_coverage(Coverage {
                run_id: "run:x".to_string(),
                scopes: vec![CoverageScope::complete(ScanScope::whole_tree())],
            })
            .unwrap();
        session.abort().unwrap();

        assert_eq!(h.live_vpaths(&snapshot).len(), 8, "{:?}", backend);
        assert_eq!(h.store.get_snapshot(&snapshot).unwrap().last_run_id, "run:1");
    }
}

#[test]
fn test_invalid_layer_batch_is_atomic() {
    for backend in Backend::all() {
        let h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        let mut broken = file("/broken.txt", 1);
        broken.node_ref.layers.clear();

        let mut session = h.store.begin_patch(&snapshot, ScanRun::new("run:a", "r:test", t0())).unwrap();
        let result = session.upsert_nodes(&[file("/ok.txt", 1), broken]);
        assert!(matches!(result, Err(TreesnapError::InvalidLayers(_))), "{:?}", backend);
        assert!(h.node(&snapshot, "/ok.txt", true).is_none());
    }
}

#[test]
fn test_root_registration_is_idempotent_by_key() {
    for backend in Backend::all() {
        let h = TreesnapTestHarness::new(backend);
        let again = RootDescriptor::new("r:alias", "/fixture/", OsKind::Posix, t0()).unwrap();
        assert_eq!(h.store.register_root(again).unwrap().root_id, "r:test", "{:?}", backend);

        let conflicting = RootDescriptor::new("r:test", "/elsewhere", OsKind::Posix, t0()).unwrap();
        assert!(matches!(
            h.store.register_root(conflicting),
            Err(TreesnapError::RootIdConflict { .. })
        ));
        let found = h.store.find_root_by_key(&h.store.get_root("r:test").unwrap().root_key).unwrap();
        assert_eq!(found.map(|r| r.root_id), Some("r:test".to_string()));
        assert_eq!(h.store.list_roots().unwrap().len(), 1);
    }
}

#[test]
fn test_archive_members_follow_their_container() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        let os_root = NodeRef::os("r:test", "/");
        let inner = |vpath: &str, kind: NodeKind| {
            ObservedNode::new(os_root.within_archive("zip", "/bundle.zip", vpath), kind, last_name(vpath), "", t0())
        };
        h.scan_complete(
            &snapshot,
            &[
                dir("/"),
                file("/bundle.zip", 100),
                inner("/", NodeKind::Dir),
                inner("/inside.txt", NodeKind::File).with_size(7),
            ],
        )
        .unwrap();

        let children = h.store.list_children(&snapshot, &os_root, None, None, false).unwrap();
        let names: Vec<String> = children.nodes.iter().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec!["bundle.zip"], "{:?}", backend);

        let archive_root = os_root.within_archive("zip", "/bundle.zip", "/");
        let members = h.store.list_children(&snapshot, &archive_root, None, None, false).unwrap();
        assert_eq!(members.nodes.len(), 1);
        assert_eq!(members.nodes[0].node_ref.vpath, "/inside.txt");

        // Re-scan without opening the archive: its members fall under the container's path.
        h.scan_complete(&snapshot, &[dir("/"), file("/bundle.zip", 100)]).unwrap();
        let member_ref = os_root.within_archive("zip", "/bundle.zip", "/inside.txt");
        let tombstone = h.store.get_node_by_ref(&snapshot, &member_ref, true).unwrap().unwrap();
        assert!(tombstone.is_deleted, "{:?}", backend);
    }
}

#[test]
fn test_lookup_queries() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(
            &snapshot,
            &[
                dir("/"),
                file("/a", 5).with_hash("sha256", "aaaa").with_identity(FileIdentity::posix(1, 11)),
                file("/b", 15).with_hash("sha256", "aaaa"),
                file("/c", 25).with_hash("sha256", "cccc"),
            ],
        )
        .unwrap();

        let by_hash = h.store.find_by_hash(&snapshot, "sha256", "aaaa", None, false).unwrap();
        let vpaths: Vec<&str> = by_hash.nodes.iter().map(|n| n.node_ref.vpath.as_str()).collect();
        assert_eq!(vpaths, vec!["/a", "/b"], "{:?}", backend);

        let by_identity = h
            .store
            .find_by_os_identity(&snapshot, &FileIdentity::posix(1, 11), None, false)
            .unwrap();
        assert_eq!(by_identity.nodes.len(), 1);
        assert_eq!(by_identity.nodes[0].entity_key, "posix:1:11");
        assert!(h
            .store
            .find_by_os_identity(&snapshot, &FileIdentity::unavailable(), None, false)
            .unwrap()
            .nodes
            .is_empty());

        let by_entity = h.store.find_by_entity_key(&snapshot, "posix:1:11", None, false).unwrap();
        assert_eq!(by_entity.nodes[0].node_ref.vpath, "/a");

        let sized = h.store.range_by_size(&snapshot, 10, 30, None, false).unwrap();
        let sizes: Vec<Option<u64>> = sized.nodes.iter().map(|n| n.size).collect();
        assert_eq!(sizes, vec![Some(15), Some(25)]);
        assert!(h.store.range_by_size(&snapshot, 30, 10, None, false).unwrap().nodes.is_empty());
    }
}

#[test]
fn test_pagination_walks_every_node_once() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &base_tree()).unwrap();

        let mut query = NodeQuery {
            filter: None,
            sort: Some(NodeSort::desc(NodeSortKey::Size)),
            page: Some(Page::first(3)),
        };
        let mut seen = Vec::new();
        loop {
            let page = h.store.query_nodes(&snapshot, &query).unwrap();
            assert!(page.nodes.len() <= 3);
            seen.extend(page.nodes.into_iter().map(|n| n.size));
            match page.next_cursor {
                Some(cursor) => query.page = Some(Page::after(3, cursor)),
                None => break,
            }
        }
        assert_eq!(
            seen,
            vec![Some(40), Some(30), Some(20), Some(10), None, None, None],
            "{:?}",
            backend
        );

        query.page = Some(Page::after(3, "not-a-cursor"));
        assert!(matches!(
            h.store.query_nodes(&snapshot, &query),
            Err(TreesnapError::InvalidCursor(_))
        ));
    }
}

#[test]
fn test_filters_on_errors_and_runs() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let snapshot = h.snapshot();
        let fault = NodeError {
            code: ErrorCode::PermissionDenied,
            stage: ErrorStage::Stat,
            message: "denied".to_string(),
            retryable: false,
            os_code: Some("13".to_string()),
            at: t0(),
        };
        h.scan_complete(&snapshot, &[dir("/"), file("/ok", 1), file("/locked", 0).with_error(fault)])
            .unwrap();

        let query = |filter: NodeFilter| {
            h.store
                .query_nodes(
                    &snapshot,
                    &NodeQuery {
                        filter: Some(filter),
                        ..NodeQuery::default()
                    },
                )
                .unwrap()
                .nodes
        };
        let faulty = query(NodeFilter {
            has_errors: Some(true),
            ..NodeFilter::default()
        });
        assert_eq!(faulty.len(), 1, "{:?}", backend);
        assert_eq!(faulty[0].errors[0].code, ErrorCode::PermissionDenied);
        assert_eq!(
            query(NodeFilter {
                observed_in_run_id: Some("run:1".to_string()),
                kinds: Some(vec![]),
                ..NodeFilter::default()
            })
            .len(),
            3
        );
    }
}

#[test]
fn test_compare_reports_changes() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let left = h.snapshot();
        let right = h.snapshot();
        h.scan_complete(&left, &base_tree()).unwrap();
        let mut changed = without(&base_tree(), &["/docs/b.txt"]);
        changed.push(file("/docs/new.txt", 1));
        changed.retain(|n| n.node_ref.vpath != "/top.bin");
        changed.push(file("/top.bin", 41));
        h.scan_complete(&right, &changed).unwrap();

        let diff = Comparer::new(h.store.as_ref())
            .compare(&left, &right, &CompareOptions::default())
            .unwrap();
        assert_eq!(diff.summary.added, 1, "{:?}", backend);
        assert_eq!(diff.summary.removed, 1);
        assert_eq!(diff.summary.modified, 1);
        let paths: Vec<(&str, DiffEntryType)> = diff.entries.iter().map(|e| (e.path.as_str(), e.entry_type)).collect();
        assert_eq!(
            paths,
            vec![
                ("/docs/b.txt", DiffEntryType::Removed),
                ("/docs/new.txt", DiffEntryType::Added),
                ("/top.bin", DiffEntryType::Modified),
            ]
        );
    }
}

#[test]
fn test_compare_requires_coverage() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let left = h.snapshot();
        let right = h.snapshot();
        h.scan_complete(&left, &base_tree()).unwrap();
        h.scan(
            &right,
            &without(&base_tree(), &["/top.bin"]),
            vec![CoverageScope::partial(ScanScope::whole_tree())],
        )
        .unwrap();

        let comparer = Comparer::new(h.store.as_ref());
        let strict = comparer.compare(&left, &right, &CompareOptions::default()).unwrap();
        assert_eq!(strict.entries.len(), 1, "{:?}", backend);
        assert_eq!(strict.entries[0].entry_type, DiffEntryType::NotCovered);
        assert_eq!(strict.entries[0].path, "/");

        let lenient = comparer
            .compare(
                &left,
                &right,
                &CompareOptions::default()
                    .with_mode(CompareMode::Lenient)
                    .with_required_coverage(false),
            )
            .unwrap();
        assert_eq!(lenient.summary.unknown, 1);
        assert_eq!(lenient.summary.removed, 0);
        assert_eq!(lenient.entries[0].path, "/top.bin");

        // A covered subtree of the partial snapshot is still not enough.
        let docs = CompareOptions::default().with_scope(ScanScope::new("/docs", ScopeMode::FullSubtree));
        assert_eq!(comparer.compare(&left, &right, &docs).unwrap().summary.not_covered, 1);
    }
}

#[test]
fn test_moves_are_detected_and_stable() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let left = h.snapshot();
        let right = h.snapshot();
        h.scan_complete(
            &left,
            &[dir("/"), file("/a.txt", 3).with_hash("sha256", "ab"), file("/x.txt", 9).with_hash("sha256", "ff")],
        )
        .unwrap();
        h.scan_complete(
            &right,
            &[dir("/"), file("/renamed.txt", 3).with_hash("sha256", "ab"), file("/y.txt", 9).with_hash("sha256", "ee")],
        )
        .unwrap();

        let options = CompareOptions::default().with_moves(vec![EvidenceType::ContentHash], Confidence::Likely);
        let comparer = Comparer::new(h.store.as_ref());
        let first = comparer.compare(&left, &right, &options).unwrap();
        let second = comparer.compare(&left, &right, &options).unwrap();
        assert_eq!(first, second, "{:?}", backend);

        assert_eq!(first.summary.moved, 1);
        assert_eq!(first.summary.added, 1);
        assert_eq!(first.summary.removed, 1);
        let moved = first
            .entries
            .iter()
            .find(|e| e.entry_type == DiffEntryType::Moved)
            .unwrap();
        assert_eq!(moved.path, "/renamed.txt");
        assert_eq!(moved.left.as_ref().unwrap().node_ref.as_ref().unwrap().vpath, "/a.txt");
        assert_eq!(moved.match_result.as_ref().unwrap().verdict, Verdict::Same);
    }
}

#[test]
fn test_align_three_snapshots() {
    for backend in Backend::all() {
        let mut h = TreesnapTestHarness::new(backend);
        let a = h.snapshot();
        let b = h.snapshot();
        let c = h.snapshot();
        h.scan_complete(&a, &[dir("/"), file("/f", 1), file("/g", 2)]).unwrap();
        h.scan_complete(&b, &[dir("/"), file("/f", 10)]).unwrap();
        h.scan(&c, &[dir("/"), file("/g", 2)], vec![CoverageScope::partial(ScanScope::whole_tree())])
            .unwrap();

        let ids = vec![a.clone(), b.clone(), c.clone()];
        let result = Aligner::new(h.store.as_ref())
            .align(&ids, &ScanScope::whole_tree(), &AlignKeyStrategy::new(AlignKeyType::Vpath), CompareMode::Strict)
            .unwrap();
        assert_eq!(result.rows.len(), 3, "{:?}", backend);

        let row = |key: &str| result.rows.iter().find(|r| r.display_key == key).unwrap();
        let states = |key: &str| row(key).cells.iter().map(|c| c.state).collect::<Vec<_>>();
        assert_eq!(states("/f"), vec![CellState::Present, CellState::Present, CellState::NotCovered]);
        assert_eq!(states("/g"), vec![CellState::Present, CellState::Missing, CellState::NotCovered]);
        assert_eq!(row("/f").cells[1].fingerprint.as_ref().unwrap().size, Some(10));
    }
}

#[test]
#[tracing_test::traced_test]
fn test_commit_is_logged() {
    let mut h = TreesnapTestHarness::new(Backend::Memory);
    let snapshot = h.snapshot();
    h.scan_complete(&snapshot, &base_tree()).unwrap();
    h.scan_complete(&snapshot, &[dir("/")]).unwrap();
    assert!(logs_contain("Memory: committed run:1 with 7 nodes"));
    assert!(logs_contain("Memory: committed run:2 with 1 nodes"));
    assert_eq!(h.live_vpaths(&snapshot), vec!["/"]);
}
