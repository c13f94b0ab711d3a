//! Evidence matching between two stored nodes

use super::{
    ConflictHandling, Confidence, Evidence, EvidenceOutcome, EvidenceType, IdentityPolicy, MatchResult, Verdict,
};
use crate::node;
use crate::types::{CasePolicy, Hashes, NodeMeta};
use crate::utils::format_instant;
use crate::vpath;

/// Algorithm preferred when a node carries several content hashes
pub const PREFERRED_HASH_ALGO: &str = "sha256";

fn compare_values(left: Option<&str>, right: Option<&str>) -> EvidenceOutcome {
    match (left, right) {
        (None, _) => EvidenceOutcome::MissingLeft,
        (_, None) => EvidenceOutcome::MissingRight,
        (Some(l), Some(r)) if l == r => EvidenceOutcome::Match,
        _ => EvidenceOutcome::Mismatch,
    }
}

/// Preferred present content hash as `algo:value`
///
/// `sha256` wins when present; otherwise the first present hash in algorithm
/// order.
pub fn preferred_hash(hashes: &Hashes) -> Option<(&str, &str)> {
    let mut present = hashes
        .values()
        .filter_map(|hash| hash.present_value().map(|value| (hash.algo.as_str(), value)));
    let first = present.next()?;
    if first.0 == PREFERRED_HASH_ALGO {
        return Some(first);
    }
    Some(present.find(|(algo, _)| *algo == PREFERRED_HASH_ALGO).unwrap_or(first))
}

fn perceptual_hash(hashes: &Hashes) -> Option<String> {
    hashes
        .values()
        .filter(|hash| hash.algo.starts_with('p'))
        .find_map(|hash| hash.present_value().map(|value| format!("{}:{}", hash.algo, value)))
}

fn gather(evidence_type: EvidenceType, left: &NodeMeta, right: &NodeMeta, case: CasePolicy) -> (Option<String>, Option<String>) {
    match evidence_type {
        EvidenceType::OsFileId => (node::identity_value(&left.identity), node::identity_value(&right.identity)),
        EvidenceType::Vpath => (
            Some(vpath::key(&left.node_ref.vpath, case).into_owned()),
            Some(vpath::key(&right.node_ref.vpath, case).into_owned()),
        ),
        EvidenceType::Name => (Some(node::name_key(&left.name, case)), Some(node::name_key(&right.name, case))),
        EvidenceType::Size => (left.size.map(|s| s.to_string()), right.size.map(|s| s.to_string())),
        EvidenceType::Mtime => (left.mtime.as_ref().map(format_instant), right.mtime.as_ref().map(format_instant)),
        EvidenceType::ContentHash => {
            let render = |hashes: &Hashes| preferred_hash(hashes).map(|(algo, value)| format!("{}:{}", algo, value));
            (render(&left.hashes), render(&right.hashes))
        }
        EvidenceType::PerceptualHash => (perceptual_hash(&left.hashes), perceptual_hash(&right.hashes)),
    }
}

/// Weigh the evidence of `policy` for `left` and `right` and pick a verdict
///
/// Path and name evidence compare case-folded values when `resolved_case`
/// is `Insensitive`; all other evidence compares exactly. The verdict rules
/// are applied in order:
///
/// 1. strong match and strong mismatch under `MarkConflict`: `Unknown`/`Possible`
/// 2. content hash mismatch weighing at least `different_certain`: `Different`/`Certain`
/// 3. mismatch score at least `different_certain`: `Different`/`Certain`
/// 4. match score at least `same_certain` with no mismatch: `Same`/`Certain`
/// 5. match score at least `same_likely`: `PossiblySame`/`Likely`
/// 6. otherwise `Unknown`/`Possible`
pub fn match_nodes(left: &NodeMeta, right: &NodeMeta, policy: &IdentityPolicy, resolved_case: CasePolicy) -> MatchResult {
    let evidence: Vec<Evidence> = policy
        .strategies
        .iter()
        .map(|strategy| {
            let (left_value, right_value) = gather(strategy.evidence_type, left, right, resolved_case);
            Evidence {
                evidence_type: strategy.evidence_type,
                outcome: compare_values(left_value.as_deref(), right_value.as_deref()),
                left_value,
                right_value,
                weight: strategy.weight,
            }
        })
        .collect();

    let (verdict, confidence) = decide(&evidence, policy);
    MatchResult {
        verdict,
        confidence,
        evidence,
    }
}

fn decide(evidence: &[Evidence], policy: &IdentityPolicy) -> (Verdict, Confidence) {
    let thresholds = &policy.thresholds;
    let match_score = score(evidence, EvidenceOutcome::Match);
    let mismatch_score = score(evidence, EvidenceOutcome::Mismatch);

    let strong_conflict = match_score >= thresholds.same_likely && mismatch_score >= thresholds.different_certain;
    if strong_conflict && policy.conflict_handling == ConflictHandling::MarkConflict {
        return (Verdict::Unknown, Confidence::Possible);
    }

    let hash_mismatch = evidence.iter().any(|ev| {
        ev.evidence_type == EvidenceType::ContentHash
            && ev.outcome == EvidenceOutcome::Mismatch
            && ev.weight >= thresholds.different_certain
    });
    if hash_mismatch || mismatch_score >= thresholds.different_certain {
        return (Verdict::Different, Confidence::Certain);
    }
    if match_score >= thresholds.same_certain && mismatch_score == 0.0 {
        return (Verdict::Same, Confidence::Certain);
    }
    if match_score >= thresholds.same_likely {
        return (Verdict::PossiblySame, Confidence::Likely);
    }
    (Verdict::Unknown, Confidence::Possible)
}

/// Sum of the weights of evidence with the given outcome
pub(crate) fn score(evidence: &[Evidence], outcome: EvidenceOutcome) -> f64 {
    evidence.iter().filter(|ev| ev.outcome == outcome).map(|ev| ev.weight).sum()
}
