//! In-process shared store: queues and task records behind tokio locks.
//!
//! Used by tests and by single-process deployments that run every role in
//! one binary. Pops wait on a per-queue `Notify`, so idle pollers sleep
//! rather than spin.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use super::traits::{QueueName, SharedStore};
use crate::error::StoreError;
use crate::task::{TaskField, TaskRecord, TaskStatus, Transition};

#[derive(Default)]
struct QueueSlot {
    items: Mutex<VecDeque<String>>,
    ready: Notify,
}

/// In-memory [`SharedStore`].
#[derive(Default)]
pub struct InMemoryStore {
    queues: [QueueSlot; 2],
    records: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of elements waiting in a queue.
    pub async fn queue_len(&self, queue: QueueName) -> usize {
        self.queues[queue.index()].items.lock().await.len()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn push(&self, queue: QueueName, payload: &str) -> Result<(), StoreError> {
        let slot = &self.queues[queue.index()];
        slot.items.lock().await.push_back(payload.to_string());
        slot.ready.notify_one();
        debug!(queue = %queue, "Pushed element");
        Ok(())
    }

    async fn pop(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let slot = &self.queues[queue.index()];
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking, so a push between the check
            // and the wait is not missed.
            let notified = slot.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = slot.items.lock().await.pop_front() {
                return Ok(Some(item));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn set_fields(
        &self,
        task_id: &str,
        fields: &[(TaskField, String)],
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.entry(task_id.to_string()).or_default();
        for (field, value) in fields {
            record.insert(field.as_str().to_string(), value.clone());
        }
        Ok(())
    }

    async fn get_field(
        &self,
        task_id: &str,
        field: TaskField,
    ) -> Result<Option<String>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(task_id)
            .and_then(|r| r.get(field.as_str()))
            .cloned())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(task_id)
            .map(|fields| TaskRecord::from_fields(task_id, fields)))
    }

    async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        fields: &[(TaskField, String)],
    ) -> Result<Transition, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound {
                task_id: task_id.to_string(),
            })?;

        let current = match record.get(TaskField::Status.as_str()) {
            None => TaskStatus::Submitted,
            Some(raw) if raw.is_empty() => TaskStatus::Submitted,
            Some(raw) => TaskStatus::parse(raw).ok_or_else(|| {
                StoreError::Serialization(format!("unknown status '{raw}' on task {task_id}"))
            })?,
        };

        if current == to {
            return Ok(Transition::AlreadyInState);
        }
        if !current.can_transition_to(to) {
            return Ok(Transition::Rejected { current });
        }

        record.insert(TaskField::Status.as_str().to_string(), to.as_str().to_string());
        for (field, value) in fields {
            record.insert(field.as_str().to_string(), value.clone());
        }
        Ok(Transition::Applied)
    }
}
