//! Main test module for Treesnap
//!
//! This module includes all test suites:
//! - Integration tests that run every scenario against both store backends
//! - Property-based tests for store, comparison and move invariants
//! - Edge cases around paths, archives and ids

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use super::integration::{dir, file, Backend, TreesnapTestHarness};
    use ::treesnap::types::*;
    use ::treesnap::store::MAX_STORABLE_SIZE;
    use ::treesnap::*;

    #[test]
    fn test_escaped_names_round_trip_through_both_backends() {
        let names = ["with space.txt", "100%.txt", "slash/inside.txt", "файл.txt", "🚀.bin"];
        for backend in Backend::all() {
            let mut h = TreesnapTestHarness::new(backend);
            let snapshot = h.snapshot();
            let mut nodes = vec![dir("/")];
            for name in names {
                let mut node = file(&vpath::append(vpath::ROOT, name), 1);
                node.name = name.to_string();
                nodes.push(node);
            }
            h.scan_complete(&snapshot, &nodes).unwrap();

            for name in names {
                let encoded = vpath::append(vpath::ROOT, name);
                assert_eq!(vpath::decode_segments(&encoded).unwrap(), vec![name.to_string()]);
                let node = h
                    .node(&snapshot, &encoded, false)
                    .unwrap_or_else(|| panic!("{:?}: {} not stored", backend, encoded));
                assert_eq!(node.name, name);
            }
            let children = h
                .store
                .list_children(&snapshot, &NodeRef::os(&h.root_id, vpath::ROOT), None, None, false)
                .unwrap();
            assert_eq!(children.nodes.len(), names.len(), "{:?}", backend);
        }
    }

    #[test]
    fn test_empty_snapshot_has_no_nodes() {
        for backend in Backend::all() {
            let h = TreesnapTestHarness::new(backend);
            let snapshot = h.snapshot();
            let page = h.store.query_nodes(&snapshot, &NodeQuery::default()).unwrap();
            assert!(page.nodes.is_empty());
            assert!(page.next_cursor.is_none());
            let stored = h.store.get_snapshot(&snapshot).unwrap();
            assert_eq!(stored.last_run_id, "");
            assert!(stored.last_coverage.scopes.is_empty());
        }
    }

    #[test]
    fn test_wildcard_characters_are_literal_in_prefix_queries() {
        for backend in Backend::all() {
            let mut h = TreesnapTestHarness::new(backend);
            let snapshot = h.snapshot();
            h.scan_complete(
                &snapshot,
                &[dir("/"), dir("/a_b"), file("/a_b/x", 1), dir("/axb"), file("/axb/y", 1), dir("/a%25"), file("/a%25/z", 1)],
            )
            .unwrap();

            let under = |prefix: &str| -> Vec<String> {
                let query = NodeQuery {
                    filter: Some(NodeFilter {
                        vpath_prefix: Some(prefix.to_string()),
                        ..NodeFilter::default()
                    }),
                    ..NodeQuery::default()
                };
                h.store
                    .query_nodes(&snapshot, &query)
                    .unwrap()
                    .nodes
                    .into_iter()
                    .map(|n| n.node_ref.vpath)
                    .collect()
            };
            assert_eq!(under("/a_b"), vec!["/a_b", "/a_b/x"], "{:?}", backend);
            assert_eq!(under("/a%25"), vec!["/a%25", "/a%25/z"], "{:?}", backend);
        }
    }

    #[test]
    fn test_hash_lookups_keep_algorithm_and_value_apart() {
        for backend in Backend::all() {
            let mut h = TreesnapTestHarness::new(backend);
            let snapshot = h.snapshot();
            h.scan_complete(&snapshot, &[dir("/"), file("/x", 1).with_hash("a:b", "c")])
                .unwrap();

            let hits = |algo: &str, value: &str| {
                h.store
                    .find_by_hash(&snapshot, algo, value, None, false)
                    .unwrap()
                    .nodes
                    .len()
            };
            assert_eq!(hits("a", "b:c"), 0, "{:?}", backend);
            assert_eq!(hits("a:b", "c"), 1, "{:?}", backend);

            let filtered = |algo: &str, value: &str| {
                let query = NodeQuery {
                    filter: Some(NodeFilter {
                        hash: Some(HashFilter {
                            algo: algo.to_string(),
                            value: value.to_string(),
                        }),
                        ..NodeFilter::default()
                    }),
                    ..NodeQuery::default()
                };
                h.store.query_nodes(&snapshot, &query).unwrap().nodes.len()
            };
            assert_eq!(filtered("a", "b:c"), 0, "{:?}", backend);
            assert_eq!(filtered("a:b", "c"), 1, "{:?}", backend);
        }
    }

    #[test]
    fn test_oversized_files_are_rejected_by_both_backends() {
        for backend in Backend::all() {
            let mut h = TreesnapTestHarness::new(backend);
            let snapshot = h.snapshot();
            let err = h
                .scan_complete(&snapshot, &[dir("/"), file("/big", u64::MAX)])
                .unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<TreesnapError>(),
                    Some(TreesnapError::SizeOutOfRange { size, .. }) if *size == u64::MAX
                ),
                "{:?}: {}",
                backend,
                err
            );
            assert!(h.live_vpaths(&snapshot).is_empty(), "{:?}", backend);

            // The largest storable size goes through unchanged
            h.scan_complete(&snapshot, &[dir("/"), file("/big", MAX_STORABLE_SIZE)])
                .unwrap();
            let node = h.node(&snapshot, "/big", false).unwrap();
            assert_eq!(node.size, Some(MAX_STORABLE_SIZE), "{:?}", backend);
        }
    }

    #[test]
    fn test_node_ids_are_per_snapshot_counters() {
        for backend in Backend::all() {
            let mut h = TreesnapTestHarness::new(backend);
            let first = h.snapshot();
            let second = h.snapshot();
            h.scan_complete(&first, &[dir("/"), file("/a", 1)]).unwrap();
            h.scan_complete(&second, &[dir("/"), file("/b", 1)]).unwrap();

            for snapshot in [&first, &second] {
                let ids: Vec<String> = h
                    .store
                    .query_nodes(snapshot, &NodeQuery::default())
                    .unwrap()
                    .nodes
                    .into_iter()
                    .map(|n| n.node_id)
                    .collect();
                assert_eq!(ids, vec!["n:000000000001", "n:000000000002"], "{:?}", backend);
            }
        }
    }

    #[test]
    fn test_unknown_ids_are_reported() {
        for backend in Backend::all() {
            let h = TreesnapTestHarness::new(backend);
            assert!(matches!(
                h.store.get_snapshot("s:missing"),
                Err(TreesnapError::SnapshotNotFound(_))
            ));
            assert!(matches!(h.store.create_snapshot("r:nope"), Err(TreesnapError::RootNotFound(_))));
            assert!(matches!(
                h.store.list_snapshots("r:nope"),
                Err(TreesnapError::RootNotFound(_))
            ));
            assert!(h.store.get_node_by_id(&h.snapshot(), "n:000000000042").unwrap().is_none());
        }
    }
}
