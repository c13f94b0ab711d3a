//! Scanner-side coverage bookkeeping
//!
//! A scanner walks one or more requested scopes and has to tell the store,
//! per scope, whether every node in it was observed. [`CoverageTracker`]
//! starts each scope as complete and downgrades it as faults come in.
//! A vanished path (`NOT_FOUND`) is ordinary churn between listing and stat,
//! so it never downgrades a scope on its own.

use crate::clock::Clock;
use crate::types::{Coverage, CoverageScope, ErrorCode, ErrorStage, NodeError, ScanScope, ScopeCompleteness};
use std::io;
use tracing::{debug, trace};

/// Maximum representative errors kept per scope
pub const MAX_SCOPE_ERRORS: usize = 10;

#[cfg(target_os = "linux")]
const ENAMETOOLONG: i32 = 36;
#[cfg(all(unix, not(target_os = "linux")))]
const ENAMETOOLONG: i32 = 63;
#[cfg(windows)]
const ENAMETOOLONG: i32 = 206;
#[cfg(not(any(unix, windows)))]
const ENAMETOOLONG: i32 = -1;

/// Tracks completeness of each requested scope during one run
#[derive(Debug, Clone)]
pub struct CoverageTracker {
    run_id: String,
    scopes: Vec<CoverageScope>,
    errors: Vec<Vec<NodeError>>,
}

impl CoverageTracker {
    /// Start tracking `scopes` for `run_id`, all complete
    pub fn new(run_id: impl Into<String>, scopes: &[ScanScope]) -> Self {
        Self {
            run_id: run_id.into(),
            scopes: scopes.iter().cloned().map(CoverageScope::complete).collect(),
            errors: vec![Vec::new(); scopes.len()],
        }
    }

    /// Mark a scope partial, optionally keeping `error` as a representative fault
    ///
    /// Out-of-range indices are ignored. `NOT_FOUND` errors and errors past
    /// [`MAX_SCOPE_ERRORS`] are not kept, but the scope is still marked.
    pub fn mark_partial(&mut self, index: usize, error: Option<NodeError>) {
        let Some(scope) = self.scopes.get_mut(index) else {
            return;
        };
        if scope.completeness != ScopeCompleteness::Partial {
            debug!("Scope {} ({}) downgraded to partial", index, scope.scope.base_vpath);
            scope.completeness = ScopeCompleteness::Partial;
        }
        if let Some(error) = error {
            let kept = &mut self.errors[index];
            if error.code != ErrorCode::NotFound && kept.len() < MAX_SCOPE_ERRORS {
                kept.push(error);
            }
        }
    }

    /// Record an observation fault against a scope
    ///
    /// `NOT_FOUND` is ignored entirely; any other code marks the scope
    /// partial. A fault outside every scope (`None`) is dropped.
    pub fn record_error(&mut self, index: Option<usize>, error: NodeError) {
        let Some(index) = index else {
            return;
        };
        if error.code == ErrorCode::NotFound {
            trace!("Ignoring NOT_FOUND in scope {}", index);
            return;
        }
        self.mark_partial(index, Some(error));
    }

    /// Mark every scope from `start` on as partial (used on cancellation)
    pub fn mark_remaining_partial(&mut self, start: usize) {
        for index in start..self.scopes.len() {
            self.mark_partial(index, None);
        }
    }

    /// Build the coverage report
    pub fn finalize(self) -> Coverage {
        let scopes = self
            .scopes
            .into_iter()
            .zip(self.errors)
            .map(|(mut scope, errors)| {
                if !errors.is_empty() {
                    scope.errors = Some(errors);
                }
                scope
            })
            .collect();
        Coverage {
            run_id: self.run_id,
            scopes,
        }
    }
}

/// Classify an I/O error raised while observing a path
///
/// Permission and not-found faults keep their own codes; a name or path
/// over the OS limit becomes `PATH_TOO_LONG`; every other OS error is a
/// retryable `IO_ERROR`. Errors that carry no OS error number and no
/// specific kind are `UNKNOWN`.
pub fn map_io_error(err: &io::Error, stage: ErrorStage, clock: &dyn Clock) -> NodeError {
    let raw = err.raw_os_error();
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        io::ErrorKind::NotFound => ErrorCode::NotFound,
        _ if raw == Some(ENAMETOOLONG) => ErrorCode::PathTooLong,
        io::ErrorKind::Other if raw.is_none() => ErrorCode::Unknown,
        _ => ErrorCode::IoError,
    };
    NodeError {
        code,
        stage,
        message: err.to_string(),
        retryable: code == ErrorCode::IoError,
        os_code: raw.map(|value| value.to_string()),
        at: clock.now(),
    }
}
