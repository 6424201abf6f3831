//! The interrupt signal threaded through every suspension point.
//!
//! Interrupts are the scheduler's only cross-process control-flow primitive
//! (spec.md §4.3): the arbiter uses them to tell a writer its share changed,
//! and a broken disk uses them to unblock every writer waiting on it.

use std::fmt;

/// Why a process was interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CauseReason {
    /// A new writer joined the disk and shares need recomputing.
    NeedsDisk,
    /// A writer left the disk and remaining writers should recompute theirs.
    Release,
    /// The owning disk has failed.
    Broken,
    /// A free-form cause for call sites outside the arbiter.
    UserDefined(String),
}

impl fmt::Display for CauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CauseReason::NeedsDisk => write!(f, "needs disk"),
            CauseReason::Release => write!(f, "release"),
            CauseReason::Broken => write!(f, "broken"),
            CauseReason::UserDefined(s) => write!(f, "{s}"),
        }
    }
}

/// The payload carried by an interrupt: a reason and the virtual time it
/// fired at.
#[derive(Debug, Clone, PartialEq)]
pub struct Cause {
    pub reason: CauseReason,
    pub time: f64,
}

impl Cause {
    pub fn new(reason: CauseReason, time: f64) -> Self {
        Self { reason, time }
    }
}

/// Raised when a suspension point's wait is terminated early by
/// [`crate::sim::Ctx::interrupt`]. Caught by the writer/transfer/back-off
/// loop that issued the suspending call; never escapes to
/// [`crate::error::SimError`].
#[derive(Debug, Clone, PartialEq)]
pub struct Interrupted(pub Cause);

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted: {} at {:.3}", self.0.reason, self.0.time)
    }
}

impl std::error::Error for Interrupted {}
