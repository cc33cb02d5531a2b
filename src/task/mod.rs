//! Task data model.
//!
//! - `state`: status state machine (Submitted, Decomposing, Processing, then Done or Failed)
//! - `model`: Subtask, Job, SubtaskResult and the stored task record

pub mod model;
pub mod state;

pub use model::{Action, Job, Subtask, SubtaskResult, TaskField, TaskRecord};
pub use state::{TaskStatus, Transition};

/// RFC 3339 UTC timestamp for `created_at` / `updated_at`.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
