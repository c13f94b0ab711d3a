//! Snapshot comparison
//!
//! The comparer reads two committed snapshots through a [`SnapshotStore`]
//! and reports what changed between them. It never guesses: regions that
//! were not completely observed come back as `NOT_COVERED` or `UNKNOWN`
//! entries, and contradicting evidence can be surfaced as `CONFLICT`.
//!
//! ## Algorithm
//!
//! 1. Both scope bases are resolved against their base refs and checked
//!    against each snapshot's last coverage. With
//!    [`CompareOptions::require_observed_coverage`] an uncovered side
//!    short-circuits to a single `NOT_COVERED` entry.
//! 2. Live nodes inside the scope and on the base ref's layer stack are
//!    collected on both sides, keyed by their path relative to the base.
//! 3. Paths present on both sides are matched with [`match_nodes`]; one-sided
//!    paths become `REMOVED` or `ADDED` (or `UNKNOWN` in lenient mode when
//!    either side is partially covered).
//! 4. With move detection enabled, [`detect_moves`] pairs removed and added
//!    nodes; pairs are reported as `MOVED` and their one-sided entries are
//!    dropped.
//!
//! ## Example
//!
//! ```rust
//! use treesnap::compare::{CompareOptions, Comparer};
//! use treesnap::store::{SnapshotStore, StoreBuilder};
//! use treesnap::types::*;
//! use chrono::Utc;
//!
//! # fn main() -> treesnap::Result<()> {
//! let store = StoreBuilder::new().build_memory();
//! store.register_root(RootDescriptor::new("r:1", "/data", OsKind::Posix, Utc::now())?)?;
//! let left = store.create_snapshot("r:1")?;
//! let right = store.create_snapshot("r:1")?;
//!
//! // Neither snapshot has been committed with coverage yet
//! let diff = Comparer::new(&store).compare(&left.snapshot_id, &right.snapshot_id, &CompareOptions::default())?;
//! assert_eq!(diff.summary.not_covered, 1);
//! # Ok(())
//! # }
//! ```

mod matching;
mod moves;
mod scope;

pub use matching::{match_nodes, preferred_hash, PREFERRED_HASH_ALGO};
pub use moves::{detect_moves, effective_move_policy, MoveCandidate};
pub use scope::{covers, is_scope_covered};

use crate::collections::HashSet;
use crate::error::Result;
use crate::node;
use crate::store::SnapshotStore;
use crate::types::{
    CasePolicy, NodeFilter, NodeMeta, NodeQuery, NodeRef, NodeSort, NodeSortKey, ScanScope, ScopeMode,
};
use crate::vpath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

/// Kind of evidence a strategy contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceType {
    /// Normalized OS file identity
    OsFileId,
    /// Case-policy key of the vpath
    Vpath,
    /// Node name
    Name,
    /// Size in bytes
    Size,
    /// Modification time
    Mtime,
    /// Preferred present content hash
    ContentHash,
    /// First present hash whose algorithm starts with `p`
    PerceptualHash,
}

/// Result of comparing one piece of evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceOutcome {
    Match,
    Mismatch,
    /// The left node has no value
    MissingLeft,
    /// The right node has no value
    MissingRight,
    NotApplicable,
}

/// One weighed comparison between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    pub outcome: EvidenceOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_value: Option<String>,
    pub weight: f64,
}

/// Identity decision for a node pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Same,
    Different,
    PossiblySame,
    Unknown,
    Moved,
}

/// Trust level of a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Certain,
    Likely,
    Possible,
}

impl Confidence {
    /// Ordering weight: `Certain` 3, `Likely` 2, `Possible` 1
    pub fn rank(self) -> u8 {
        match self {
            Confidence::Certain => 3,
            Confidence::Likely => 2,
            Confidence::Possible => 1,
        }
    }
}

/// Verdict, confidence and the evidence behind them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub verdict: Verdict,
    pub confidence: Confidence,
    pub evidence: Vec<Evidence>,
}

impl MatchResult {
    /// Sum of weights of matching evidence
    pub fn match_score(&self) -> f64 {
        matching::score(&self.evidence, EvidenceOutcome::Match)
    }

    /// Sum of weights of mismatching evidence
    pub fn mismatch_score(&self) -> f64 {
        matching::score(&self.evidence, EvidenceOutcome::Mismatch)
    }
}

/// An evidence type with its weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedStrategy {
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    pub weight: f64,
}

impl WeightedStrategy {
    pub fn new(evidence_type: EvidenceType, weight: f64) -> Self {
        Self { evidence_type, weight }
    }
}

/// What to do when evidence strongly agrees and disagrees at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictHandling {
    /// Let the verdict rules decide
    PreferStrongerEvidence,
    /// Report the pair as a conflict
    MarkConflict,
}

/// Score thresholds of the verdict rules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreThresholds {
    pub same_certain: f64,
    pub same_likely: f64,
    pub different_certain: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            same_certain: 1.0,
            same_likely: 0.5,
            different_certain: 1.0,
        }
    }
}

/// How node pairs are judged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPolicy {
    pub strategies: Vec<WeightedStrategy>,
    pub conflict_handling: ConflictHandling,
    pub thresholds: ScoreThresholds,
    /// `Auto` follows the left root's resolved case policy
    pub case_policy: CasePolicy,
}

impl Default for IdentityPolicy {
    /// VPATH and SIZE with weight 1 each
    fn default() -> Self {
        Self {
            strategies: vec![
                WeightedStrategy::new(EvidenceType::Vpath, 1.0),
                WeightedStrategy::new(EvidenceType::Size, 1.0),
            ],
            conflict_handling: ConflictHandling::PreferStrongerEvidence,
            thresholds: ScoreThresholds::default(),
            case_policy: CasePolicy::Auto,
        }
    }
}

/// Move detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePolicy {
    pub enabled: bool,
    pub strategies: Vec<EvidenceType>,
    pub min_confidence: Confidence,
}

impl Default for MovePolicy {
    /// Disabled; when enabled, pairs by OS identity and content hash
    fn default() -> Self {
        Self {
            enabled: false,
            strategies: vec![EvidenceType::OsFileId, EvidenceType::ContentHash],
            min_confidence: Confidence::Likely,
        }
    }
}

/// Treatment of partially covered regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompareMode {
    /// One-sided paths are always ADDED/REMOVED
    Strict,
    /// One-sided paths are UNKNOWN when either side is partially covered
    Lenient,
}

/// Options of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareOptions {
    pub mode: CompareMode,
    /// Scope relative to each side's base ref
    pub scope: ScanScope,
    pub identity: IdentityPolicy,
    #[serde(rename = "move")]
    pub move_policy: MovePolicy,
    /// Return a single NOT_COVERED entry unless both sides are completely covered
    pub require_observed_coverage: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            mode: CompareMode::Strict,
            scope: ScanScope::whole_tree(),
            identity: IdentityPolicy::default(),
            move_policy: MovePolicy::default(),
            require_observed_coverage: true,
        }
    }
}

impl CompareOptions {
    pub fn with_mode(mut self, mode: CompareMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_scope(mut self, scope: ScanScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_identity(mut self, identity: IdentityPolicy) -> Self {
        self.identity = identity;
        self
    }

    /// Replace the identity strategies
    pub fn with_strategies(mut self, strategies: Vec<WeightedStrategy>) -> Self {
        self.identity.strategies = strategies;
        self
    }

    pub fn with_thresholds(mut self, thresholds: ScoreThresholds) -> Self {
        self.identity.thresholds = thresholds;
        self
    }

    pub fn with_conflict_handling(mut self, handling: ConflictHandling) -> Self {
        self.identity.conflict_handling = handling;
        self
    }

    pub fn with_case_policy(mut self, policy: CasePolicy) -> Self {
        self.identity.case_policy = policy;
        self
    }

    /// Enable move detection with the given strategies and minimum confidence
    pub fn with_moves(mut self, strategies: Vec<EvidenceType>, min_confidence: Confidence) -> Self {
        self.move_policy = MovePolicy {
            enabled: true,
            strategies,
            min_confidence,
        };
        self
    }

    pub fn with_required_coverage(mut self, required: bool) -> Self {
        self.require_observed_coverage = required;
        self
    }
}

/// Kind of difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffEntryType {
    Added,
    Removed,
    Modified,
    Moved,
    TypeChanged,
    Conflict,
    Unknown,
    NotCovered,
}

/// Pointer to a node in one of the compared snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffNodePtr {
    pub snapshot_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeRef>,
}

impl DiffNodePtr {
    /// Pointer to a stored node
    pub fn to_node(snapshot_id: &str, node: &NodeMeta) -> Self {
        Self {
            snapshot_id: snapshot_id.to_string(),
            node_id: Some(node.node_id.clone()),
            node_ref: Some(node.node_ref.clone()),
        }
    }
}

/// One reported difference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    /// Path relative to the base (right vpath for MOVED entries)
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: DiffEntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<DiffNodePtr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<DiffNodePtr>,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_result: Option<MatchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl DiffEntry {
    fn new(path: impl Into<String>, entry_type: DiffEntryType) -> Self {
        Self {
            path: path.into(),
            entry_type,
            left: None,
            right: None,
            match_result: None,
            notes: None,
        }
    }

    fn with_left(mut self, snapshot_id: &str, node: &NodeMeta) -> Self {
        self.left = Some(DiffNodePtr::to_node(snapshot_id, node));
        self
    }

    fn with_right(mut self, snapshot_id: &str, node: &NodeMeta) -> Self {
        self.right = Some(DiffNodePtr::to_node(snapshot_id, node));
        self
    }

    fn with_match(mut self, result: MatchResult) -> Self {
        self.match_result = Some(result);
        self
    }
}

/// Entry counts by type
///
/// TYPE_CHANGED and CONFLICT entries count as modified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub moved: usize,
    pub unknown: usize,
    pub not_covered: usize,
}

impl DiffSummary {
    /// Count entries by type
    pub fn from_entries(entries: &[DiffEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            match entry.entry_type {
                DiffEntryType::Added => summary.added += 1,
                DiffEntryType::Removed => summary.removed += 1,
                DiffEntryType::Modified | DiffEntryType::TypeChanged | DiffEntryType::Conflict => {
                    summary.modified += 1
                }
                DiffEntryType::Moved => summary.moved += 1,
                DiffEntryType::Unknown => summary.unknown += 1,
                DiffEntryType::NotCovered => summary.not_covered += 1,
            }
        }
        summary
    }

    /// Whether no change of any kind was reported
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub summary: DiffSummary,
    pub entries: Vec<DiffEntry>,
}

impl DiffResult {
    fn from_entries(entries: Vec<DiffEntry>) -> Self {
        Self {
            summary: DiffSummary::from_entries(&entries),
            entries,
        }
    }
}

/// Path of `target` relative to `base`, where `target` is known to lie under `base`
fn relative_vpath(base: &str, target: &str) -> String {
    if base == vpath::ROOT {
        return target.to_string();
    }
    if target.len() == base.len() {
        return vpath::ROOT.to_string();
    }
    match target.get(base.len()..) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => target.to_string(),
    }
}

/// Entry for a path present on both sides, if the pair differs
#[allow(clippy::too_many_arguments)]
fn pair_entry(
    path: &str,
    left: &NodeMeta,
    right: &NodeMeta,
    left_snapshot_id: &str,
    right_snapshot_id: &str,
    options: &CompareOptions,
    case: CasePolicy,
) -> Option<DiffEntry> {
    let base = |entry_type| {
        DiffEntry::new(path, entry_type)
            .with_left(left_snapshot_id, left)
            .with_right(right_snapshot_id, right)
    };
    if left.kind != right.kind {
        return Some(base(DiffEntryType::TypeChanged));
    }
    let result = match_nodes(left, right, &options.identity, case);
    let thresholds = &options.identity.thresholds;
    let strong_conflict =
        result.match_score() >= thresholds.same_likely && result.mismatch_score() >= thresholds.different_certain;
    if strong_conflict && options.identity.conflict_handling == ConflictHandling::MarkConflict {
        return Some(base(DiffEntryType::Conflict).with_match(result));
    }
    if result.verdict != Verdict::Same {
        return Some(base(DiffEntryType::Modified).with_match(result));
    }
    None
}

/// A collected node with its path relative to the scope base
type Collected = (String, NodeMeta);

/// Collected nodes by case-normalized relative path; case variants share a key
type Side = BTreeMap<String, Vec<Collected>>;

/// Nodes paired across sides, then the left-only and right-only leftovers
type Pairing<'n> = (Vec<(&'n Collected, &'n Collected)>, Vec<&'n Collected>, Vec<&'n Collected>);

/// Pair the case variants sharing one normalized key
///
/// Identical raw paths pair first; the remaining variants pair in path
/// order and whatever is left stays one-sided, so no node is dropped.
fn pair_variants<'n>(lefts: &'n [Collected], rights: &'n [Collected]) -> Pairing<'n> {
    let mut taken = vec![false; rights.len()];
    let mut pairs = Vec::new();
    let mut unmatched = Vec::new();
    for left in lefts {
        let exact = rights
            .iter()
            .enumerate()
            .position(|(i, right)| !taken[i] && right.0 == left.0);
        match exact {
            Some(i) => {
                taken[i] = true;
                pairs.push((left, &rights[i]));
            }
            None => unmatched.push(left),
        }
    }

    let mut rest = rights.iter().enumerate().filter(|(i, _)| !taken[*i]).map(|(_, right)| right);
    let mut left_only = Vec::new();
    for left in unmatched {
        match rest.next() {
            Some(right) => pairs.push((left, right)),
            None => left_only.push(left),
        }
    }
    let right_only = rest.collect();
    (pairs, left_only, right_only)
}

/// Compares snapshots held by a [`SnapshotStore`]
pub struct Comparer<'a> {
    store: &'a dyn SnapshotStore,
}

impl<'a> Comparer<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self { store }
    }

    /// Compare two snapshots from the OS root of each
    pub fn compare(&self, left_snapshot_id: &str, right_snapshot_id: &str, options: &CompareOptions) -> Result<DiffResult> {
        let left_root = self.store.get_snapshot(left_snapshot_id)?.root_id;
        let right_root = self.store.get_snapshot(right_snapshot_id)?.root_id;
        self.compare_subtree(
            left_snapshot_id,
            &NodeRef::os(left_root, vpath::ROOT),
            right_snapshot_id,
            &NodeRef::os(right_root, vpath::ROOT),
            options,
        )
    }

    /// Compare the scope under `left_base` with the same scope under `right_base`
    ///
    /// The bases may sit on different roots or layer stacks; only nodes on
    /// each base's own layer stack are collected.
    #[instrument(skip(self, left_base, right_base, options), fields(scope = %options.scope.base_vpath))]
    pub fn compare_subtree(
        &self,
        left_snapshot_id: &str,
        left_base: &NodeRef,
        right_snapshot_id: &str,
        right_base: &NodeRef,
        options: &CompareOptions,
    ) -> Result<DiffResult> {
        let left_snapshot = self.store.get_snapshot(left_snapshot_id)?;
        let right_snapshot = self.store.get_snapshot(right_snapshot_id)?;

        let left_scope = ScanScope::new(vpath::join(&left_base.vpath, &options.scope.base_vpath), options.scope.mode);
        let right_scope = ScanScope::new(vpath::join(&right_base.vpath, &options.scope.base_vpath), options.scope.mode);
        let left_covered = is_scope_covered(&left_snapshot.last_coverage.scopes, &left_scope);
        let right_covered = is_scope_covered(&right_snapshot.last_coverage.scopes, &right_scope);

        if options.require_observed_coverage && !(left_covered && right_covered) {
            info!(
                "Scope {} not covered (left: {}, right: {})",
                options.scope.base_vpath, left_covered, right_covered
            );
            return Ok(DiffResult::from_entries(vec![DiffEntry::new(
                options.scope.base_vpath.clone(),
                DiffEntryType::NotCovered,
            )]));
        }

        let left_root = self.store.get_root(&left_snapshot.root_id)?;
        let case = match options.identity.case_policy {
            CasePolicy::Auto => left_root.effective_case_policy(),
            explicit => explicit,
        };
        let left_nodes = self.collect(left_snapshot_id, left_base, &left_scope, case)?;
        let right_nodes = self.collect(right_snapshot_id, right_base, &right_scope, case)?;
        debug!("Collected {} left and {} right nodes", left_nodes.len(), right_nodes.len());

        let lenient_unknown = options.mode == CompareMode::Lenient && !(left_covered && right_covered);
        let mut entries = Vec::new();
        let mut removed = Vec::new();
        let mut added = Vec::new();

        let keys: BTreeSet<&String> = left_nodes.keys().chain(right_nodes.keys()).collect();
        for key in keys {
            let lefts = left_nodes.get(key).map(Vec::as_slice).unwrap_or_default();
            let rights = right_nodes.get(key).map(Vec::as_slice).unwrap_or_default();
            let (pairs, left_only, right_only) = pair_variants(lefts, rights);

            let mut keyed = Vec::new();
            for ((path, left), (_, right)) in pairs {
                if let Some(entry) = pair_entry(path, left, right, left_snapshot_id, right_snapshot_id, options, case) {
                    keyed.push(entry);
                }
            }
            for (path, left) in left_only {
                let entry_type = if lenient_unknown { DiffEntryType::Unknown } else { DiffEntryType::Removed };
                keyed.push(DiffEntry::new(path.clone(), entry_type).with_left(left_snapshot_id, left));
                if entry_type == DiffEntryType::Removed {
                    removed.push(left.clone());
                }
            }
            for (path, right) in right_only {
                let entry_type = if lenient_unknown { DiffEntryType::Unknown } else { DiffEntryType::Added };
                keyed.push(DiffEntry::new(path.clone(), entry_type).with_right(right_snapshot_id, right));
                if entry_type == DiffEntryType::Added {
                    added.push(right.clone());
                }
            }
            keyed.sort_by(|a, b| a.path.cmp(&b.path));
            entries.extend(keyed);
        }

        if options.move_policy.enabled && !removed.is_empty() && !added.is_empty() {
            let moves = detect_moves(&removed, &added, &options.identity, &options.move_policy, case)?;
            let moved_left: HashSet<&str> = moves.iter().map(|m| m.left.node_id.as_str()).collect();
            let moved_right: HashSet<&str> = moves.iter().map(|m| m.right.node_id.as_str()).collect();
            entries.retain(|entry| {
                let claimed = |ptr: &Option<DiffNodePtr>, set: &HashSet<&str>| {
                    ptr.as_ref()
                        .and_then(|p| p.node_id.as_deref())
                        .is_some_and(|id| set.contains(id))
                };
                match entry.entry_type {
                    DiffEntryType::Removed => !claimed(&entry.left, &moved_left),
                    DiffEntryType::Added => !claimed(&entry.right, &moved_right),
                    _ => true,
                }
            });
            for candidate in &moves {
                if candidate.left.node_ref.vpath == candidate.right.node_ref.vpath {
                    continue;
                }
                entries.push(
                    DiffEntry::new(candidate.right.node_ref.vpath.clone(), DiffEntryType::Moved)
                        .with_left(left_snapshot_id, &candidate.left)
                        .with_right(right_snapshot_id, &candidate.right)
                        .with_match(candidate.match_result.clone()),
                );
            }
        }

        let result = DiffResult::from_entries(entries);
        info!(
            "Compared {} with {}: {} added, {} removed, {} modified, {} moved, {} unknown",
            left_snapshot_id,
            right_snapshot_id,
            result.summary.added,
            result.summary.removed,
            result.summary.modified,
            result.summary.moved,
            result.summary.unknown
        );
        Ok(result)
    }

    /// Live nodes of `scope` on the layer stack of `base`, keyed under `case`
    fn collect(&self, snapshot_id: &str, base: &NodeRef, scope: &ScanScope, case: CasePolicy) -> Result<Side> {
        let base_sig = node::layers_signature(&base.layers);
        let base_ref = base.with_vpath(scope.base_vpath.clone());
        let nodes: Vec<NodeMeta> = match scope.mode {
            ScopeMode::SingleNode => self
                .store
                .get_node_by_ref(snapshot_id, &base_ref, false)?
                .into_iter()
                .collect(),
            ScopeMode::ChildrenOnly => self.store.list_children(snapshot_id, &base_ref, None, None, false)?.nodes,
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

        let mut side = Side::new();
        for node in nodes {
            if node.node_ref.root_id != base.root_id || node::layers_signature(&node.node_ref.layers) != base_sig {
                continue;
            }
            // ASCII folding keeps byte lengths, so the raw vpath slices like its key.
            let relative = relative_vpath(&scope.base_vpath, &node.node_ref.vpath);
            side.entry(vpath::key(&relative, case).into_owned())
                .or_default()
                .push((relative, node));
        }
        for variants in side.values_mut() {
            variants.sort_by(|a, b| a.0.cmp(&b.0));
        }
        Ok(side)
    }
}
