//! Patch session state machine shared by both backends

use super::PatchSession;
use crate::error::{Result, TreesnapError};
use crate::types::{Coverage, ObservedNode, ScanRun};
use tracing::{debug, warn};

/// Backend operations a patch session drives
pub(crate) trait PatchTarget {
    /// Apply one batch of observations atomically
    fn apply_upserts(&self, snapshot_id: &str, run: &ScanRun, nodes: &[ObservedNode]) -> Result<()>;

    /// Reconcile, refresh stats and record the patch on the snapshot
    fn apply_commit(&self, snapshot_id: &str, run: &ScanRun, coverage: &Coverage) -> Result<()>;
}

/// Open/closed bookkeeping around a [`PatchTarget`]
pub(crate) struct StoreSession<'a, T: PatchTarget + ?Sized> {
    target: &'a T,
    snapshot_id: String,
    run: ScanRun,
    coverage: Option<Coverage>,
    closed: bool,
}

impl<'a, T: PatchTarget + ?Sized> StoreSession<'a, T> {
    pub(crate) fn new(target: &'a T, snapshot_id: impl Into<String>, run: ScanRun) -> Self {
        Self {
            target,
            snapshot_id: snapshot_id.into(),
            run,
            coverage: None,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(TreesnapError::SessionClosed);
        }
        Ok(())
    }
}

impl<T: PatchTarget + ?Sized> PatchSession for StoreSession<'_, T> {
    fn upsert_nodes(&mut self, nodes: &[ObservedNode]) -> Result<()> {
        self.ensure_open()?;
        if nodes.is_empty() {
            return Ok(());
        }
        debug!("Upserting {} nodes into {} for {}", nodes.len(), self.snapshot_id, self.run.run_id);
        self.target.apply_upserts(&self.snapshot_id, &self.run, nodes)
    }

    fn record_coverage(&mut self, coverage: Coverage) -> Result<()> {
        self.ensure_open()?;
        if coverage.run_id != self.run.run_id {
            return Err(TreesnapError::CoverageRunMismatch {
                expected: self.run.run_id.clone(),
                actual: coverage.run_id,
            });
        }
        self.coverage = Some(coverage);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let coverage = self.coverage.as_ref().ok_or(TreesnapError::CoverageNotRecorded)?;
        self.target.apply_commit(&self.snapshot_id, &self.run, coverage)?;
        self.closed = true;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        if !self.closed {
            warn!("Patch session for run {} on {} aborted", self.run.run_id, self.snapshot_id);
            self.closed = true;
        }
        Ok(())
    }
}
