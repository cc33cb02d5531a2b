//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task record.
///
/// Moves forward only: `Submitted → Decomposing → Processing → Done`, with
/// `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Input stored, id queued for decomposition.
    #[serde(alias = "PENDING")]
    Submitted,
    /// A decomposer has claimed the task and is calling the LLM.
    Decomposing,
    /// Job pushed to the execution queue.
    Processing,
    /// Executor finished; `result` holds one entry per subtask.
    Done,
    /// Terminal failure; `error` holds the reason.
    Failed,
}

impl TaskStatus {
    /// Wire form stored in the `status` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Decomposing => "DECOMPOSING",
            Self::Processing => "PROCESSING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a stored status. `PENDING` is the legacy gateway spelling of
    /// `SUBMITTED`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" | "PENDING" => Some(Self::Submitted),
            "DECOMPOSING" => Some(Self::Decomposing),
            "PROCESSING" => Some(Self::Processing),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Submitted, Decomposing)
                | (Decomposing, Processing)
                | (Processing, Done)
                | (Submitted, Failed)
                | (Decomposing, Failed)
                | (Processing, Failed)
        )
    }

    /// States from which `self` may be entered.
    pub fn predecessors(&self) -> Vec<TaskStatus> {
        ALL.iter()
            .copied()
            .filter(|s| s.can_transition_to(*self))
            .collect()
    }

    /// Wire strings accepted as predecessors, including legacy spellings.
    pub fn predecessor_wire_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for state in self.predecessors() {
            names.push(state.as_str());
            if state == Self::Submitted {
                names.push("PENDING");
            }
        }
        names
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

const ALL: [TaskStatus; 5] = [
    TaskStatus::Submitted,
    TaskStatus::Decomposing,
    TaskStatus::Processing,
    TaskStatus::Done,
    TaskStatus::Failed,
];

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status moved and the accompanying fields were written.
    Applied,
    /// The record was already in the target status; nothing was written.
    AlreadyInState,
    /// The current status may not move to the target; nothing was written.
    Rejected { current: TaskStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}
