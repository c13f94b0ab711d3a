//! N-way alignment of snapshots
//!
//! An alignment lays several snapshots side by side: one row per distinct
//! key found in any covered snapshot, one cell per snapshot. The key is
//! chosen by an [`AlignKeyStrategy`] (vpath, entity key, OS file id,
//! content hash, or a composite of these) and hashed into a stable row key.
//!
//! Cells are `NOT_COVERED` (or `UNKNOWN` in lenient mode) for snapshots
//! whose last coverage does not completely cover the scope, regardless of
//! what nodes they physically hold.
//!
//! The display key of a row is the vpath of the first node that produced it.
//! Rows keyed by entity or hash may therefore share a display key.

use crate::compare::{is_scope_covered, preferred_hash, CompareMode, DiffNodePtr};
use crate::error::Result;
use crate::node;
use crate::store::SnapshotStore;
use crate::types::{
    CasePolicy, NodeFilter, NodeMeta, NodeQuery, NodeRef, NodeSort, NodeSortKey, ScanScope, ScopeMode,
};
use crate::utils::hash_str;
use crate::vpath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Separator between row key parts
const PART_SEPARATOR: char = '\u{1f}';

/// Row key ingredient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlignKeyType {
    Vpath,
    EntityKey,
    OsFileId,
    ContentHash,
    Composite,
}

impl AlignKeyType {
    /// Name hashed into row keys
    pub fn as_str(&self) -> &'static str {
        match self {
            AlignKeyType::Vpath => "VPATH",
            AlignKeyType::EntityKey => "ENTITY_KEY",
            AlignKeyType::OsFileId => "OS_FILE_ID",
            AlignKeyType::ContentHash => "CONTENT_HASH",
            AlignKeyType::Composite => "COMPOSITE",
        }
    }
}

/// How rows are keyed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignKeyStrategy {
    #[serde(rename = "type")]
    pub key_type: AlignKeyType,
    /// Parts of a composite key (default: entity key, then vpath)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<AlignKeyType>>,
}

impl AlignKeyStrategy {
    /// Single-part strategy
    pub fn new(key_type: AlignKeyType) -> Self {
        Self { key_type, parts: None }
    }

    /// Composite strategy over `parts`
    pub fn composite(parts: Vec<AlignKeyType>) -> Self {
        Self {
            key_type: AlignKeyType::Composite,
            parts: Some(parts),
        }
    }

    /// Row key and display key of `node`
    pub fn row_key(&self, node: &NodeMeta, case: CasePolicy) -> (String, String) {
        let input = match self.key_type {
            AlignKeyType::Composite => {
                let default_parts = [AlignKeyType::EntityKey, AlignKeyType::Vpath];
                let parts = self.parts.as_deref().unwrap_or(&default_parts);
                parts
                    .iter()
                    .map(|part| part_value(node, *part, case))
                    .collect::<Vec<_>>()
                    .join(&PART_SEPARATOR.to_string())
            }
            single => part_value(node, single, case),
        };
        let digest = hash_str(&format!("align:{}{}{}", self.key_type.as_str(), PART_SEPARATOR, input));
        (format!("rk:{}", digest), node.node_ref.vpath.clone())
    }
}

fn part_value(node: &NodeMeta, part: AlignKeyType, case: CasePolicy) -> String {
    match part {
        AlignKeyType::Vpath => vpath::key(&node.node_ref.vpath, case).into_owned(),
        AlignKeyType::EntityKey => node.entity_key.clone(),
        AlignKeyType::OsFileId => node::identity_value(&node.identity).unwrap_or_default(),
        AlignKeyType::ContentHash => preferred_hash(&node.hashes)
            .map(|(algo, value)| format!("hash:{}:{}", algo, value))
            .unwrap_or_default(),
        AlignKeyType::Composite => String::new(),
    }
}

/// State of one snapshot in one row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CellState {
    Present,
    Missing,
    Unknown,
    NotCovered,
}

/// Quick-look attributes of a cell's representative node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
    /// Preferred present content hash value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// One snapshot's column in a row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentCell {
    pub state: CellState,
    /// Matching nodes, representative first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<DiffNodePtr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl AlignmentCell {
    fn empty(state: CellState) -> Self {
        Self {
            state,
            nodes: Vec::new(),
            fingerprint: None,
        }
    }
}

/// One key across all snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentRow {
    pub row_key: String,
    pub display_key: String,
    /// One cell per input snapshot, in input order
    pub cells: Vec<AlignmentCell>,
}

/// Result of [`Aligner::align`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentResult {
    pub snapshot_ids: Vec<String>,
    pub scope: ScanScope,
    pub strategy: AlignKeyStrategy,
    pub rows: Vec<AlignmentRow>,
}

struct PendingRow {
    display_key: String,
    nodes: BTreeMap<usize, Vec<NodeMeta>>,
}

/// Aligns snapshots held by a [`SnapshotStore`]
pub struct Aligner<'a> {
    store: &'a dyn SnapshotStore,
}

impl<'a> Aligner<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self { store }
    }

    /// Align `snapshot_ids` over `scope` (an OS-layer scope of each snapshot's root)
    #[instrument(skip(self, scope, strategy), fields(scope = %scope.base_vpath, snapshots = snapshot_ids.len()))]
    pub fn align(
        &self,
        snapshot_ids: &[String],
        scope: &ScanScope,
        strategy: &AlignKeyStrategy,
        mode: CompareMode,
    ) -> Result<AlignmentResult> {
        let mut covered = Vec::with_capacity(snapshot_ids.len());
        let mut rows: BTreeMap<String, PendingRow> = BTreeMap::new();

        for (column, snapshot_id) in snapshot_ids.iter().enumerate() {
            let snapshot = self.store.get_snapshot(snapshot_id)?;
            let is_covered = is_scope_covered(&snapshot.last_coverage.scopes, scope);
            covered.push(is_covered);
            if !is_covered {
                debug!("Snapshot {} does not cover {}", snapshot_id, scope.base_vpath);
                continue;
            }
            let case = self.store.get_root(&snapshot.root_id)?.effective_case_policy();
            for node in self.collect(snapshot_id, &snapshot.root_id, scope)? {
                let (row_key, display_key) = strategy.row_key(&node, case);
                rows.entry(row_key)
                    .or_insert_with(|| PendingRow {
                        display_key,
                        nodes: BTreeMap::new(),
                    })
                    .nodes
                    .entry(column)
                    .or_default()
                    .push(node);
            }
        }

        let mut output = Vec::with_capacity(rows.len());
        for (row_key, mut row) in rows {
            let mut cells = Vec::with_capacity(snapshot_ids.len());
            for (column, snapshot_id) in snapshot_ids.iter().enumerate() {
                let cell = if !covered[column] {
                    AlignmentCell::empty(match mode {
                        CompareMode::Strict => CellState::NotCovered,
                        CompareMode::Lenient => CellState::Unknown,
                    })
                } else {
                    match row.nodes.remove(&column) {
                        Some(nodes) => present_cell(snapshot_id, nodes)?,
                        None => AlignmentCell::empty(CellState::Missing),
                    }
                };
                cells.push(cell);
            }
            output.push(AlignmentRow {
                row_key,
                display_key: row.display_key,
                cells,
            });
        }
        output.sort_by(|a, b| a.row_key.cmp(&b.row_key).then_with(|| a.display_key.cmp(&b.display_key)));

        info!(
            "Aligned {} snapshots into {} rows ({} covered)",
            snapshot_ids.len(),
            output.len(),
            covered.iter().filter(|c| **c).count()
        );
        Ok(AlignmentResult {
            snapshot_ids: snapshot_ids.to_vec(),
            scope: scope.clone(),
            strategy: strategy.clone(),
            rows: output,
        })
    }

    /// Live OS-layer nodes of `scope` in one snapshot
    fn collect(&self, snapshot_id: &str, root_id: &str, scope: &ScanScope) -> Result<Vec<NodeMeta>> {
        let base = NodeRef::os(root_id, scope.base_vpath.clone());
        let nodes = match scope.mode {
            ScopeMode::SingleNode => self.store.get_node_by_ref(snapshot_id, &base, false)?.into_iter().collect(),
            ScopeMode::ChildrenOnly => self.store.list_children(snapshot_id, &base, None, None, false)?.nodes,
            ScopeMode::FullSubtree => {
                let query = NodeQuery {
                    filter: Some(NodeFilter {
                        vpath_prefix: Some(scope.base_vpath.clone()),
                        ..NodeFilter::default()
                    }),
                    sort: Some(NodeSort::asc(NodeSortKey::Vpath)),
                    page: None,
                };
                self.store.query_nodes(snapshot_id, &query)?.nodes
            }
        };
        let os_sig = node::layers_signature(&base.layers);
        Ok(nodes
            .into_iter()
            .filter(|n| node::layers_signature(&n.node_ref.layers) == os_sig)
            .collect())
    }
}

/// PRESENT cell: nodes by layer depth then canonical string, first one fingerprinted
fn present_cell(snapshot_id: &str, nodes: Vec<NodeMeta>) -> Result<AlignmentCell> {
    let mut keyed = nodes
        .into_iter()
        .map(|n| Ok((n.node_ref.layers.len(), node::canonical_string(&n.node_ref)?, n)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let fingerprint = keyed.first().map(|(_, _, representative)| Fingerprint {
        size: representative.size,
        mtime: representative.mtime,
        content_hash: preferred_hash(&representative.hashes).map(|(_, value)| value.to_string()),
    });
    Ok(AlignmentCell {
        state: CellState::Present,
        nodes: keyed
            .iter()
            .map(|(_, _, n)| DiffNodePtr::to_node(snapshot_id, n))
            .collect(),
        fingerprint,
    })
}
