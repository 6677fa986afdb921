//! Finite state machine shared by deploys and their commands
//!
//! Both follow `Pending -> Running -> {Succeeded | Failed}`. Terminal states
//! accept no further transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution status of a deploy or of one of its commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Created, not attempted yet
    Pending,

    /// Currently executing
    Running,

    /// Finished successfully
    Succeeded,

    /// Attempted and failed
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Running => "Running",
            Status::Succeeded => "Succeeded",
            Status::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed)
    }

    /// Validate a move to `next` and return it
    pub fn transition(self, next: Status) -> Result<Status, String> {
        match (self, next) {
            // From Pending
            (Status::Pending, Status::Running) => Ok(next),

            // From Running
            (Status::Running, Status::Succeeded) => Ok(next),
            (Status::Running, Status::Failed) => Ok(next),

            // Invalid transitions
            (from, to) => Err(format!("{:?} -> {:?}", from, to)),
        }
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        self.transition(next).is_ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
