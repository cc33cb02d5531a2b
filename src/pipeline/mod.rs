//! Decomposition-and-dispatch pipeline.
//!
//! Submitted task ids flow through two stages, each a competing-consumer
//! poller on its own queue:
//! 1. `Decomposer` pops `decompose-queue`, asks the LLM for subtasks, pushes a job
//! 2. `Executor` pops `execute-queue`, runs the job's subtasks on one page, writes `DONE`
//!
//! Mutual exclusion over a job is the queue's single-delivery pop; status
//! writes are conditional so no stage moves a task backward.

pub mod decomposer;
pub mod executor;
pub mod handlers;
pub mod poller;

pub use decomposer::{DecomposeOutcome, Decomposer};
pub use executor::Executor;
pub use handlers::{ActionHandler, ActionOutput, HandlerRegistry};
pub use poller::{Backoff, Poller, PollerState, QueueWorker, spawn_poller};
