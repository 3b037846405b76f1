use std::fmt;

use crate::routing::Destination;

/// Conductor run phase.
///
/// A run starts `Idle`, moves to `Draining` while entries are being routed,
/// falls back to `Idle` while both pools are saturated, and ends `Completed`
/// once an empty backlog is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Draining,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "IDLE"),
            Phase::Draining => write!(f, "DRAINING"),
            Phase::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// Outcome of one conductor iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// An entry left the backlog and entered a worker queue.
    Routed {
        destination: Destination,
        task_id: String,
    },
    /// An entry left the backlog but could not be submitted.
    Dropped,
    /// Both pools are saturated or out of budget.
    Waiting,
    /// The backlog was empty.
    Completed,
}

impl Phase {
    /// Phase after an iteration produced `step`. `Completed` is terminal.
    pub fn next(self, step: &Step) -> Phase {
        match (self, step) {
            (Phase::Completed, _) => Phase::Completed,
            (_, Step::Completed) => Phase::Completed,
            (_, Step::Routed { .. }) | (_, Step::Dropped) => Phase::Draining,
            (_, Step::Waiting) => Phase::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Completed
    }
}
