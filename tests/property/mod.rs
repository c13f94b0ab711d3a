//! Property-based testing for Treesnap
//!
//! Uses proptest to check invariants over randomly generated trees, scan
//! sequences and move candidates: backend parity, coverage gating, self
//! comparison and greedy move uniqueness.

use super::integration::{dir, file, t0, Backend, TreesnapTestHarness};
use ::treesnap::compare::{detect_moves, Confidence, EvidenceType, IdentityPolicy, MovePolicy};
use ::treesnap::types::*;
use ::treesnap::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Fixed universe of paths scans draw from (parents listed before children)
const UNIVERSE: &[(&str, bool)] = &[
    ("/a", true),
    ("/a/one.txt", false),
    ("/a/One.txt", false),
    ("/a/two.txt", false),
    ("/a/sub", true),
    ("/a/sub/three.txt", false),
    ("/b", true),
    ("/b/four.txt", false),
    ("/five.txt", false),
    ("/Five.txt", false),
];

/// How a generated scan reports its coverage
#[derive(Debug, Clone)]
enum CoverageChoice {
    CompleteTree,
    PartialTree,
    CompleteChildren(usize),
    CompleteSubtree(usize),
    CompleteSingle(usize),
}

impl CoverageChoice {
    fn scopes(&self) -> Vec<CoverageScope> {
        let base = |i: usize| UNIVERSE[i % UNIVERSE.len()].0;
        match self {
            CoverageChoice::CompleteTree => vec![CoverageScope::complete(ScanScope::whole_tree())],
            CoverageChoice::PartialTree => vec![CoverageScope::partial(ScanScope::whole_tree())],
            CoverageChoice::CompleteChildren(i) => {
                vec![CoverageScope::complete(ScanScope::new(base(*i), ScopeMode::ChildrenOnly))]
            }
            CoverageChoice::CompleteSubtree(i) => {
                vec![CoverageScope::complete(ScanScope::new(base(*i), ScopeMode::FullSubtree))]
            }
            CoverageChoice::CompleteSingle(i) => {
                vec![CoverageScope::complete(ScanScope::new(base(*i), ScopeMode::SingleNode))]
            }
        }
    }
}

/// One generated scan: which universe entries were seen, with which sizes
#[derive(Debug, Clone)]
struct ScanPlan {
    present: Vec<Option<u64>>,
    coverage: CoverageChoice,
}

impl ScanPlan {
    fn nodes(&self) -> Vec<ObservedNode> {
        let mut nodes = vec![dir("/")];
        for ((vpath, is_dir), size) in UNIVERSE.iter().zip(&self.present) {
            match (is_dir, size) {
                (_, None) => {}
                (true, Some(_)) => nodes.push(dir(vpath)),
                (false, Some(size)) => nodes.push(file(vpath, *size).with_hash("sha256", &format!("{:x}", size))),
            }
        }
        nodes
    }
}

fn coverage_strategy() -> impl Strategy<Value = CoverageChoice> {
    prop_oneof![
        3 => Just(CoverageChoice::CompleteTree),
        2 => Just(CoverageChoice::PartialTree),
        1 => (0..UNIVERSE.len()).prop_map(CoverageChoice::CompleteChildren),
        1 => (0..UNIVERSE.len()).prop_map(CoverageChoice::CompleteSubtree),
        1 => (0..UNIVERSE.len()).prop_map(CoverageChoice::CompleteSingle),
    ]
}

fn scan_strategy() -> impl Strategy<Value = ScanPlan> {
    (
        prop::collection::vec(prop::option::weighted(0.7, 0u64..4), UNIVERSE.len()),
        coverage_strategy(),
    )
        .prop_map(|(present, coverage)| ScanPlan { present, coverage })
}

fn all_nodes(h: &TreesnapTestHarness, snapshot: &str) -> Vec<NodeMeta> {
    let query = NodeQuery {
        filter: Some(NodeFilter {
            include_deleted: true,
            ..NodeFilter::default()
        }),
        ..NodeQuery::default()
    };
    h.store.query_nodes(snapshot, &query).unwrap().nodes
}

fn live_set(h: &TreesnapTestHarness, snapshot: &str) -> BTreeSet<String> {
    h.live_vpaths(snapshot).into_iter().collect()
}

fn candidate(id: &str, vpath: &str, hash: u8) -> NodeMeta {
    NodeMeta {
        node_id: id.to_string(),
        node_ref: NodeRef::os("r:test", vpath),
        kind: NodeKind::File,
        name: vpath::last_segment(vpath).to_string(),
        size: Some(1),
        mtime: None,
        ctime: None,
        birthtime: None,
        identity: FileIdentity::unavailable(),
        entity_key: format!("path:{}", vpath),
        first_seen_at: t0(),
        is_deleted: false,
        deleted_at: None,
        hashes: [("sha256".to_string(), HashValue::present("sha256", format!("{:02x}", hash)))]
            .into_iter()
            .collect(),
        extras: serde_json::Value::Null,
        observed_in_run_id: "run:1".to_string(),
        last_observed_at: t0(),
        errors: Vec::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Both backends end up with identical nodes and stats after any scan sequence
    #[test]
    fn backend_parity(plans in prop::collection::vec(scan_strategy(), 1..5)) {
        let mut memory = TreesnapTestHarness::new(Backend::Memory);
        let mut sqlite = TreesnapTestHarness::new(Backend::Sqlite);
        let memory_snapshot = memory.snapshot();
        let sqlite_snapshot = sqlite.snapshot();
        prop_assert_eq!(&memory_snapshot, &sqlite_snapshot);

        for plan in &plans {
            memory.scan(&memory_snapshot, &plan.nodes(), plan.coverage.scopes()).unwrap();
            sqlite.scan(&sqlite_snapshot, &plan.nodes(), plan.coverage.scopes()).unwrap();
        }

        prop_assert_eq!(all_nodes(&memory, &memory_snapshot), all_nodes(&sqlite, &sqlite_snapshot));
        let memory_stats = memory.store.get_snapshot(&memory_snapshot).unwrap();
        let sqlite_stats = sqlite.store.get_snapshot(&sqlite_snapshot).unwrap();
        prop_assert_eq!(memory_stats.stats, sqlite_stats.stats);
        prop_assert_eq!(memory_stats.last_coverage, sqlite_stats.last_coverage);
    }

    /// A scan without COMPLETE coverage never removes a live node
    #[test]
    fn partial_scan_only_adds(first in scan_strategy(), second in scan_strategy()) {
        let mut h = TreesnapTestHarness::new(Backend::Memory);
        let snapshot = h.snapshot();
        h.scan(&snapshot, &first.nodes(), first.coverage.scopes()).unwrap();
        let before = live_set(&h, &snapshot);

        h.scan(&snapshot, &second.nodes(), CoverageChoice::PartialTree.scopes()).unwrap();
        let after = live_set(&h, &snapshot);
        prop_assert!(before.is_subset(&after));
        for node in second.nodes() {
            prop_assert!(after.contains(&node.node_ref.vpath));
        }
    }

    /// After a complete whole-tree scan the live set is exactly what that scan saw
    #[test]
    fn complete_scan_defines_live_set(first in scan_strategy(), second in scan_strategy()) {
        let mut h = TreesnapTestHarness::new(Backend::Memory);
        let snapshot = h.snapshot();
        h.scan(&snapshot, &first.nodes(), first.coverage.scopes()).unwrap();
        h.scan_complete(&snapshot, &second.nodes()).unwrap();

        let expected: BTreeSet<String> = second.nodes().into_iter().map(|n| n.node_ref.vpath).collect();
        prop_assert_eq!(live_set(&h, &snapshot), expected);
        for node in all_nodes(&h, &snapshot) {
            prop_assert_eq!(node.is_deleted, node.deleted_at.is_some());
        }
    }

    /// Node ids never change once assigned, whatever the later scans do
    #[test]
    fn node_ids_are_stable(plans in prop::collection::vec(scan_strategy(), 2..5)) {
        let mut h = TreesnapTestHarness::new(Backend::Memory);
        let snapshot = h.snapshot();
        let mut assigned = std::collections::BTreeMap::new();
        for plan in &plans {
            h.scan(&snapshot, &plan.nodes(), plan.coverage.scopes()).unwrap();
            for node in all_nodes(&h, &snapshot) {
                let id = assigned.entry(node.node_ref.vpath.clone()).or_insert_with(|| node.node_id.clone());
                prop_assert_eq!(id.as_str(), node.node_id.as_str());
            }
        }
    }

    /// A completely covered snapshot compared with itself reports nothing
    #[test]
    fn self_comparison_is_empty(plan in scan_strategy()) {
        let mut h = TreesnapTestHarness::new(Backend::Memory);
        let snapshot = h.snapshot();
        h.scan_complete(&snapshot, &plan.nodes()).unwrap();

        for case in [CasePolicy::Sensitive, CasePolicy::Insensitive] {
            let options = CompareOptions::default()
                .with_case_policy(case)
                .with_moves(vec![EvidenceType::ContentHash], Confidence::Likely);
            let diff = Comparer::new(h.store.as_ref()).compare(&snapshot, &snapshot, &options).unwrap();
            prop_assert!(diff.summary.is_empty(), "{:?}: unexpected entries: {:?}", case, diff.entries);
        }
    }

    /// Case variants of one name are paired as far as possible and the rest reported
    #[test]
    fn case_variants_are_accounted_for(
        left_names in prop::collection::btree_set("[aAbB]{1,2}", 0..6),
        right_names in prop::collection::btree_set("[aAbB]{1,2}", 0..6),
    ) {
        let mut h = TreesnapTestHarness::new(Backend::Memory);
        let left = h.snapshot();
        let right = h.snapshot();
        let nodes = |names: &BTreeSet<String>| -> Vec<ObservedNode> {
            std::iter::once(dir("/"))
                .chain(names.iter().map(|n| file(&vpath::append(vpath::ROOT, n), 1)))
                .collect()
        };
        h.scan_complete(&left, &nodes(&left_names)).unwrap();
        h.scan_complete(&right, &nodes(&right_names)).unwrap();

        let options = CompareOptions::default().with_case_policy(CasePolicy::Insensitive);
        let diff = Comparer::new(h.store.as_ref()).compare(&left, &right, &options).unwrap();

        let folded = |names: &BTreeSet<String>| {
            let mut counts = std::collections::BTreeMap::new();
            for name in names {
                *counts.entry(name.to_ascii_lowercase()).or_insert(0usize) += 1;
            }
            counts
        };
        let (lc, rc) = (folded(&left_names), folded(&right_names));
        let keys: BTreeSet<&String> = lc.keys().chain(rc.keys()).collect();
        let count = |m: &std::collections::BTreeMap<String, usize>, k: &String| m.get(k).copied().unwrap_or(0);
        let removed: usize = keys.iter().map(|k| count(&lc, k).saturating_sub(count(&rc, k))).sum();
        let added: usize = keys.iter().map(|k| count(&rc, k).saturating_sub(count(&lc, k))).sum();

        prop_assert_eq!(diff.summary.removed, removed, "{:?}", diff.entries);
        prop_assert_eq!(diff.summary.added, added, "{:?}", diff.entries);
        prop_assert_eq!(diff.summary.modified, 0);
        for entry in &diff.entries {
            match entry.entry_type {
                DiffEntryType::Removed => prop_assert!(left_names.contains(&entry.path[1..])),
                DiffEntryType::Added => prop_assert!(right_names.contains(&entry.path[1..])),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
    }

    /// Greedy moves claim every node at most once and only pair equal content
    #[test]
    fn moves_claim_each_node_once(
        left_hashes in prop::collection::vec(0u8..4, 1..8),
        right_hashes in prop::collection::vec(0u8..4, 1..8),
    ) {
        let removed: Vec<NodeMeta> = left_hashes
            .iter()
            .enumerate()
            .map(|(i, h)| candidate(&format!("n:l{}", i), &format!("/old/{}", i), *h))
            .collect();
        let added: Vec<NodeMeta> = right_hashes
            .iter()
            .enumerate()
            .map(|(i, h)| candidate(&format!("n:r{}", i), &format!("/new/{}", i), *h))
            .collect();
        let policy = MovePolicy {
            enabled: true,
            strategies: vec![EvidenceType::ContentHash],
            min_confidence: Confidence::Likely,
        };

        let moves = detect_moves(&removed, &added, &IdentityPolicy::default(), &policy, CasePolicy::Sensitive).unwrap();
        let again = detect_moves(&removed, &added, &IdentityPolicy::default(), &policy, CasePolicy::Sensitive).unwrap();
        prop_assert_eq!(&moves, &again);

        let lefts: BTreeSet<&str> = moves.iter().map(|m| m.left.node_id.as_str()).collect();
        let rights: BTreeSet<&str> = moves.iter().map(|m| m.right.node_id.as_str()).collect();
        prop_assert_eq!(lefts.len(), moves.len());
        prop_assert_eq!(rights.len(), moves.len());
        for m in &moves {
            prop_assert_eq!(&m.left.hashes, &m.right.hashes);
        }

        // Maximal: every hash value pairs min(left count, right count) times
        for value in 0u8..4 {
            let l = left_hashes.iter().filter(|h| **h == value).count();
            let r = right_hashes.iter().filter(|h| **h == value).count();
            let paired = moves
                .iter()
                .filter(|m| m.left.hashes["sha256"].value.as_deref() == Some(format!("{:02x}", value).as_str()))
                .count();
            prop_assert_eq!(paired, l.min(r));
        }
    }

    /// Normalization is idempotent and never yields empty or parent segments
    #[test]
    fn vpath_normalize_idempotent(segments in prop::collection::vec("[a-z.]{1,4}", 0..6)) {
        let raw = format!("/{}", segments.join("/"));
        match vpath::normalize(&raw) {
            Ok(normalized) => {
                prop_assert_eq!(vpath::normalize(&normalized).unwrap(), normalized.clone());
                prop_assert!(!normalized.contains("//"));
                prop_assert!(normalized.split('/').all(|s| s != ".." && s != "."));
            }
            Err(err) => prop_assert!(segments.iter().any(|s| s == "..")
                || err.vpath_code() == Some(ErrorCode::InvalidVpathFormat)),
        }
    }

    /// Any name survives encoding into a segment
    #[test]
    fn segment_encoding_preserves_names(name in "\\PC{1,12}") {
        let encoded = vpath::encode_segment(&name);
        prop_assert!(!encoded.contains('/'));
        prop_assert_eq!(vpath::decode_segment(&encoded).unwrap(), name);
    }
}
