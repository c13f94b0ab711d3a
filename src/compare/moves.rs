//! Greedy move detection
//!
//! Every (removed, added) pair is scored with a move-specific identity
//! policy; acceptable pairs are ranked by a fixed seven-key order and claimed
//! greedily. The result is deterministic and maximal but not necessarily the
//! globally best assignment.

use super::matching::{match_nodes, score};
use super::{Confidence, EvidenceOutcome, IdentityPolicy, MatchResult, MovePolicy, Verdict, WeightedStrategy};
use crate::collections::HashSet;
use crate::error::Result;
use crate::node;
use crate::types::{CasePolicy, NodeMeta};
use std::cmp::Ordering;
use tracing::debug;

/// A removed node paired with the added node it most plausibly became
#[derive(Debug, Clone, PartialEq)]
pub struct MoveCandidate {
    /// Node from the left (older) side
    pub left: NodeMeta,
    /// Node from the right (newer) side
    pub right: NodeMeta,
    /// Evidence that paired them
    pub match_result: MatchResult,
}

struct Ranked {
    left: usize,
    right: usize,
    match_result: MatchResult,
    verdict_rank: u8,
    confidence_rank: u8,
    match_score: f64,
    mismatch_score: f64,
    strategy_index: usize,
    left_canonical: String,
    right_canonical: String,
}

fn verdict_rank(verdict: Verdict) -> u8 {
    match verdict {
        Verdict::Same => 2,
        Verdict::PossiblySame => 1,
        _ => 0,
    }
}

/// Strategies of `identity` that the move policy allows, then any move
/// strategy the identity policy lacks with weight 1
pub fn effective_move_policy(identity: &IdentityPolicy, move_policy: &MovePolicy) -> IdentityPolicy {
    let mut strategies: Vec<WeightedStrategy> = identity
        .strategies
        .iter()
        .filter(|s| move_policy.strategies.contains(&s.evidence_type))
        .cloned()
        .collect();
    for evidence_type in &move_policy.strategies {
        if !strategies.iter().any(|s| s.evidence_type == *evidence_type) {
            strategies.push(WeightedStrategy::new(*evidence_type, 1.0));
        }
    }
    IdentityPolicy {
        strategies,
        ..identity.clone()
    }
}

fn rank_order(a: &Ranked, b: &Ranked) -> Ordering {
    b.verdict_rank
        .cmp(&a.verdict_rank)
        .then_with(|| b.confidence_rank.cmp(&a.confidence_rank))
        .then_with(|| b.match_score.total_cmp(&a.match_score))
        .then_with(|| a.mismatch_score.total_cmp(&b.mismatch_score))
        .then_with(|| a.strategy_index.cmp(&b.strategy_index))
        .then_with(|| a.left_canonical.cmp(&b.left_canonical))
        .then_with(|| a.right_canonical.cmp(&b.right_canonical))
}

/// Pair removed nodes with added nodes
///
/// Returns nothing when the move policy is disabled. A pair is a candidate
/// when its verdict is `Same` or `PossiblySame` and its confidence reaches
/// `move_policy.min_confidence`. Pairs are returned in selection order.
pub fn detect_moves(
    removed: &[NodeMeta],
    added: &[NodeMeta],
    identity: &IdentityPolicy,
    move_policy: &MovePolicy,
    resolved_case: CasePolicy,
) -> Result<Vec<MoveCandidate>> {
    if !move_policy.enabled || removed.is_empty() || added.is_empty() {
        return Ok(Vec::new());
    }
    let policy = effective_move_policy(identity, move_policy);
    let min_rank = move_policy.min_confidence.rank();

    let left_canonicals = removed
        .iter()
        .map(|n| node::canonical_string(&n.node_ref))
        .collect::<Result<Vec<_>>>()?;
    let right_canonicals = added
        .iter()
        .map(|n| node::canonical_string(&n.node_ref))
        .collect::<Result<Vec<_>>>()?;

    let mut ranked = Vec::new();
    for (li, left) in removed.iter().enumerate() {
        for (ri, right) in added.iter().enumerate() {
            let match_result = match_nodes(left, right, &policy, resolved_case);
            let verdict_rank = verdict_rank(match_result.verdict);
            if verdict_rank == 0 || match_result.confidence.rank() < min_rank {
                continue;
            }
            let strategy_index = policy
                .strategies
                .iter()
                .position(|s| {
                    match_result
                        .evidence
                        .iter()
                        .any(|ev| ev.evidence_type == s.evidence_type && ev.outcome == EvidenceOutcome::Match)
                })
                .unwrap_or(usize::MAX);
            ranked.push(Ranked {
                left: li,
                right: ri,
                verdict_rank,
                confidence_rank: match_result.confidence.rank(),
                match_score: score(&match_result.evidence, EvidenceOutcome::Match),
                mismatch_score: score(&match_result.evidence, EvidenceOutcome::Mismatch),
                strategy_index,
                left_canonical: left_canonicals[li].clone(),
                right_canonical: right_canonicals[ri].clone(),
                match_result,
            });
        }
    }
    ranked.sort_by(rank_order);
    debug!("{} move candidates for {}x{} nodes", ranked.len(), removed.len(), added.len());

    let mut claimed_left = HashSet::default();
    let mut claimed_right = HashSet::default();
    let mut selected = Vec::new();
    for candidate in ranked {
        let left_id = removed[candidate.left].node_id.as_str();
        let right_id = added[candidate.right].node_id.as_str();
        if claimed_left.contains(left_id) || claimed_right.contains(right_id) {
            continue;
        }
        claimed_left.insert(left_id);
        claimed_right.insert(right_id);
        selected.push(MoveCandidate {
            left: removed[candidate.left].clone(),
            right: added[candidate.right].clone(),
            match_result: candidate.match_result,
        });
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::EvidenceType;
    use crate::types::{FileIdentity, Hashes, HashValue, NodeKind, NodeRef};
    use crate::vpath;
    use chrono::{TimeZone, Utc};

    fn meta(id: &str, vpath: &str) -> NodeMeta {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        NodeMeta {
            node_id: id.to_string(),
            node_ref: NodeRef::os("r:1", vpath),
            kind: NodeKind::File,
            name: vpath::last_segment(vpath).to_string(),
            size: Some(10),
            mtime: None,
            ctime: None,
            birthtime: None,
            identity: FileIdentity::unavailable(),
            entity_key: String::new(),
            first_seen_at: at,
            is_deleted: false,
            deleted_at: None,
            hashes: Hashes::new(),
            extras: serde_json::Value::Null,
            observed_in_run_id: "run:1".to_string(),
            last_observed_at: at,
            errors: Vec::new(),
        }
    }

    fn hashed(mut node: NodeMeta, value: &str) -> NodeMeta {
        node.hashes.insert("sha256".to_string(), HashValue::present("sha256", value));
        node
    }

    fn enabled(strategies: Vec<EvidenceType>, min_confidence: Confidence) -> MovePolicy {
        MovePolicy {
            enabled: true,
            strategies,
            min_confidence,
        }
    }

    #[test]
    fn test_effective_policy_keeps_weights_and_adds_missing() {
        let identity = IdentityPolicy {
            strategies: vec![
                WeightedStrategy::new(EvidenceType::Vpath, 1.0),
                WeightedStrategy::new(EvidenceType::ContentHash, 3.0),
            ],
            ..IdentityPolicy::default()
        };
        let policy = effective_move_policy(
            &identity,
            &enabled(vec![EvidenceType::OsFileId, EvidenceType::ContentHash], Confidence::Possible),
        );
        assert_eq!(
            policy.strategies,
            vec![
                WeightedStrategy::new(EvidenceType::ContentHash, 3.0),
                WeightedStrategy::new(EvidenceType::OsFileId, 1.0),
            ]
        );
    }

    #[test]
    fn test_disabled_policy_detects_nothing() {
        let removed = vec![meta("n:1", "/a")];
        let added = vec![meta("n:2", "/b")];
        let policy = MovePolicy::default();
        let moves = detect_moves(&removed, &added, &IdentityPolicy::default(), &policy, CasePolicy::Sensitive).unwrap();
        assert!(moves.is_empty());
    }

    #[test]
    fn test_greedy_claims_best_pairs() {
        let removed = vec![hashed(meta("n:1", "/old/a"), "aa"), hashed(meta("n:2", "/old/b"), "bb")];
        let added = vec![hashed(meta("n:3", "/new/b"), "bb"), hashed(meta("n:4", "/new/a"), "aa")];
        let policy = enabled(vec![EvidenceType::ContentHash], Confidence::Likely);
        let moves = detect_moves(&removed, &added, &IdentityPolicy::default(), &policy, CasePolicy::Sensitive).unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].left.node_id, "n:1");
        assert_eq!(moves[0].right.node_id, "n:4");
        assert_eq!(moves[1].left.node_id, "n:2");
        assert_eq!(moves[1].right.node_id, "n:3");
    }

    #[test]
    fn test_ties_broken_by_canonical_string() {
        let removed = vec![hashed(meta("n:1", "/z"), "aa"), hashed(meta("n:2", "/y"), "aa")];
        let added = vec![hashed(meta("n:3", "/x"), "aa")];
        let policy = enabled(vec![EvidenceType::ContentHash], Confidence::Possible);
        let moves = detect_moves(&removed, &added, &IdentityPolicy::default(), &policy, CasePolicy::Sensitive).unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].left.node_ref.vpath, "/y");
    }

    #[test]
    fn test_min_confidence_filters_candidates() {
        let identity = IdentityPolicy {
            thresholds: crate::compare::ScoreThresholds {
                same_certain: 2.0,
                same_likely: 1.0,
                different_certain: 2.0,
            },
            ..IdentityPolicy::default()
        };
        let removed = vec![meta("n:1", "/dir/a")];
        let added = vec![meta("n:2", "/other/a")];
        let likely = enabled(vec![EvidenceType::Name, EvidenceType::Vpath], Confidence::Likely);
        let moves = detect_moves(&removed, &added, &identity, &likely, CasePolicy::Sensitive).unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].match_result.verdict, Verdict::PossiblySame);

        let certain = enabled(vec![EvidenceType::Name, EvidenceType::Vpath], Confidence::Certain);
        assert!(detect_moves(&removed, &added, &identity, &certain, CasePolicy::Sensitive)
            .unwrap()
            .is_empty());
    }
}
