//! Unified `SharedStore` trait: hand-off queues plus the task record store.
//!
//! Both pipeline stages talk to the store only through this trait, so the
//! in-memory backend used by tests and single-process runs and the Redis
//! backend used in deployment are interchangeable.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::task::{TaskField, TaskRecord, TaskStatus, Transition};

/// The two named FIFO queues used for hand-off between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Task ids awaiting decomposition.
    Decompose,
    /// Decomposed jobs awaiting execution.
    Execute,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decompose => "decompose-queue",
            Self::Execute => "execute-queue",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Decompose => 0,
            Self::Execute => 1,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record key for a task id.
pub fn task_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Backend-agnostic shared store.
///
/// Queue pops are single-delivery: among all concurrent pollers exactly one
/// receives a given element. Field writes never require reading the whole
/// record back.
#[async_trait]
pub trait SharedStore: Send + Sync {
    // ── Queues ──────────────────────────────────────────────────────

    /// Append an element to the tail of a queue. Never blocks on consumers.
    async fn push(&self, queue: QueueName, payload: &str) -> Result<(), StoreError>;

    /// Remove and return the head of a queue, waiting up to `timeout` for
    /// one to arrive. `Ok(None)` means the wait timed out.
    async fn pop(&self, queue: QueueName, timeout: Duration)
    -> Result<Option<String>, StoreError>;

    // ── Records ─────────────────────────────────────────────────────

    /// Create or overwrite the named fields of a record.
    async fn set_fields(
        &self,
        task_id: &str,
        fields: &[(TaskField, String)],
    ) -> Result<(), StoreError>;

    /// Read a single field.
    async fn get_field(&self, task_id: &str, field: TaskField)
    -> Result<Option<String>, StoreError>;

    /// Read the whole record, or `None` if nothing is stored under the id.
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Move `status` to `to` and write `fields`, atomically, but only if the
    /// current status may transition to `to`.
    ///
    /// A record without a status field reads as `SUBMITTED`. A missing
    /// record is `StoreError::NotFound`.
    async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        fields: &[(TaskField, String)],
    ) -> Result<Transition, StoreError>;
}
