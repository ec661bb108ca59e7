// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Staged change primitive
//!
//! Test-before-commit workflow shared by broker credential updates and trust
//! material replacement:
//!
//! ```text
//! stage(candidate) ──► test ──ok──► commit ──ok──► Committed
//!                        │             └──err──► CommitFailed
//!                        └──err──► rollback ──► RolledBack
//! ```

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

/// How a staged change ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome<E> {
    /// Test passed (or was skipped) and the commit succeeded
    Committed,
    /// Test failed; the candidate was rolled back
    RolledBack(E),
    /// Test passed but the commit failed
    CommitFailed(E),
}

impl<E> StageOutcome<E> {
    /// Whether the candidate is now in effect
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// A candidate value awaiting test and commit
#[derive(Debug)]
pub struct StagedChange<T> {
    label: &'static str,
    candidate: T,
}

impl<T> StagedChange<T> {
    /// Stage `candidate`; `label` names the change in logs
    pub fn stage(label: &'static str, candidate: T) -> Self {
        Self { label, candidate }
    }

    /// The staged value
    pub fn candidate(&self) -> &T {
        &self.candidate
    }

    /// Test the candidate, then commit it or roll it back
    pub fn run<E: Display>(
        self,
        test: impl FnOnce(&T) -> Result<(), E>,
        commit: impl FnOnce(T) -> Result<(), E>,
        rollback: impl FnOnce(T),
    ) -> StageOutcome<E> {
        match test(&self.candidate) {
            Ok(()) => {
                info!("{}: test passed", self.label);
                self.commit_untested(commit)
            }
            Err(e) => {
                warn!("{}: test failed, rolling back: {}", self.label, e);
                rollback(self.candidate);
                StageOutcome::RolledBack(e)
            }
        }
    }

    /// Commit without a test phase
    pub fn commit_untested<E: Display>(self, commit: impl FnOnce(T) -> Result<(), E>) -> StageOutcome<E> {
        match commit(self.candidate) {
            Ok(()) => StageOutcome::Committed,
            Err(e) => {
                warn!("{}: commit failed: {}", self.label, e);
                StageOutcome::CommitFailed(e)
            }
        }
    }
}

/// Admits one staged change at a time
#[derive(Debug, Default)]
pub struct TestGate {
    busy: AtomicBool,
}

impl TestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate; `None` while another change holds it
    pub fn try_enter(&self) -> Option<GateGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard { gate: self })
    }

    /// Whether a change currently holds the gate
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases its [`TestGate`] when dropped
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a TestGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_commit_after_successful_test() {
        let live = RefCell::new(1);
        let outcome = StagedChange::stage("value", 2).run(
            |c| if *c > 0 { Ok(()) } else { Err("negative") },
            |c| {
                *live.borrow_mut() = c;
                Ok(())
            },
            |_| panic!("no rollback expected"),
        );
        assert_eq!(outcome, StageOutcome::Committed);
        assert_eq!(*live.borrow(), 2);
    }

    #[test]
    fn test_rollback_leaves_live_untouched() {
        let live = RefCell::new(1);
        let rolled_back = RefCell::new(None);
        let outcome = StagedChange::stage("value", -5).run(
            |c| if *c > 0 { Ok(()) } else { Err("negative") },
            |c| {
                *live.borrow_mut() = c;
                Ok(())
            },
            |c| *rolled_back.borrow_mut() = Some(c),
        );
        assert_eq!(outcome, StageOutcome::RolledBack("negative"));
        assert_eq!(*live.borrow(), 1);
        assert_eq!(*rolled_back.borrow(), Some(-5));
    }

    #[test]
    fn test_commit_failure_reported() {
        let outcome = StagedChange::stage("value", 3).run(
            |_| Ok(()),
            |_| Err("disk full"),
            |_| {},
        );
        assert_eq!(outcome, StageOutcome::CommitFailed("disk full"));
        assert!(!outcome.is_committed());
    }

    #[test]
    fn test_commit_untested() {
        let staged = StagedChange::stage("value", "pem");
        assert_eq!(*staged.candidate(), "pem");
        let outcome: StageOutcome<String> = staged.commit_untested(|_| Ok(()));
        assert!(outcome.is_committed());
    }

    #[test]
    fn test_gate_admits_one() {
        let gate = TestGate::new();
        let guard = gate.try_enter();
        assert!(guard.is_some());
        assert!(gate.is_busy());
        assert!(gate.try_enter().is_none());
        drop(guard);
        assert!(!gate.is_busy());
        assert!(gate.try_enter().is_some());
    }
}
