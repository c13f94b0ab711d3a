//! Scope coverage relation
//!
//! `covers` is deliberately asymmetric: a full-subtree scan vouches for
//! anything beneath it, a children-only scan vouches for its own listing and
//! for single children, and a single-node scan vouches only for itself.

use crate::types::{CoverageScope, ScanScope, ScopeCompleteness, ScopeMode};
use crate::vpath;

/// Whether observing `cover` completely also observes all of `target`
pub fn covers(cover: &ScanScope, target: &ScanScope) -> bool {
    match cover.mode {
        ScopeMode::FullSubtree => vpath::has_prefix(&target.base_vpath, &cover.base_vpath),
        ScopeMode::ChildrenOnly => match target.mode {
            ScopeMode::ChildrenOnly => target.base_vpath == cover.base_vpath,
            ScopeMode::SingleNode => vpath::is_immediate_child(&cover.base_vpath, &target.base_vpath),
            ScopeMode::FullSubtree => false,
        },
        ScopeMode::SingleNode => target.mode == ScopeMode::SingleNode && target.base_vpath == cover.base_vpath,
    }
}

/// Whether any COMPLETE scope in `coverage` covers `target`
pub fn is_scope_covered(coverage: &[CoverageScope], target: &ScanScope) -> bool {
    coverage
        .iter()
        .any(|scope| scope.completeness == ScopeCompleteness::Complete && covers(&scope.scope, target))
}
