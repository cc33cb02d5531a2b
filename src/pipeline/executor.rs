//! Executor: runs a job's subtasks in order against one browser page.
//!
//! One page per job, opened before the first subtask and closed on every
//! exit path, including a handler panic. A faulting subtask is recorded in
//! place and the next one still runs, so the result list always has one
//! entry per subtask.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::handlers::HandlerRegistry;
use super::poller::QueueWorker;
use crate::browser::{Browser, Page};
use crate::error::{HandlerError, PipelineError, StoreError};
use crate::store::{QueueName, SharedStore};
use crate::task::{Job, Subtask, SubtaskResult, TaskField, TaskStatus, Transition, timestamp};

pub struct Executor {
    store: Arc<dyn SharedStore>,
    browser: Arc<dyn Browser>,
    handlers: Arc<HandlerRegistry>,
    subtask_timeout: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn SharedStore>,
        browser: Arc<dyn Browser>,
        handlers: Arc<HandlerRegistry>,
        subtask_timeout: Duration,
    ) -> Self {
        Self {
            store,
            browser,
            handlers,
            subtask_timeout,
        }
    }

    /// Handle one element popped from the execute queue.
    ///
    /// A payload that is not a job, or a page that cannot be opened, abandons
    /// the job without touching the task record.
    pub async fn process(&self, payload: &str) -> Result<(), PipelineError> {
        let job: Job = serde_json::from_str(payload)
            .map_err(|e| PipelineError::MalformedJob(e.to_string()))?;

        info!(task_id = %job.task_id, subtasks = job.subtasks.len(), "Executing job");
        let results = self.run_job(&job).await?;
        self.record(&job.task_id, &results).await
    }

    /// Run every subtask on a fresh page and collect the results in order.
    pub async fn run_job(&self, job: &Job) -> Result<Vec<SubtaskResult>, PipelineError> {
        let mut page = self.browser.open_page().await?;

        let outcome = AssertUnwindSafe(self.run_subtasks(page.as_mut(), &job.subtasks))
            .catch_unwind()
            .await;

        if let Err(e) = page.close().await {
            warn!(task_id = %job.task_id, error = %e, "Failed to close page");
        }

        outcome.map_err(|panic| PipelineError::Panicked {
            task_id: job.task_id.clone(),
            reason: panic_message(panic.as_ref()),
        })
    }

    async fn run_subtasks(&self, page: &mut dyn Page, subtasks: &[Subtask]) -> Vec<SubtaskResult> {
        let mut results = Vec::with_capacity(subtasks.len());
        for (index, subtask) in subtasks.iter().enumerate() {
            let result = self.run_subtask(page, subtask).await;
            if result.is_fault() {
                warn!(
                    index,
                    action = %subtask.action,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Subtask faulted"
                );
            } else {
                debug!(index, action = %subtask.action, "Subtask completed");
            }
            results.push(result);
        }
        results
    }

    async fn run_subtask(&self, page: &mut dyn Page, subtask: &Subtask) -> SubtaskResult {
        let Some(handler) = self.handlers.get(subtask.action) else {
            return SubtaskResult::fault(
                subtask,
                format!("no handler registered for {}", subtask.action),
            );
        };

        match tokio::time::timeout(self.subtask_timeout, handler.run(page, subtask)).await {
            Ok(Ok(output)) => SubtaskResult::completed(subtask.action, output.fields, output.error),
            Ok(Err(e)) => SubtaskResult::fault(subtask, e),
            Err(_) => SubtaskResult::fault(
                subtask,
                HandlerError::Timeout {
                    action: subtask.action.to_string(),
                    timeout: self.subtask_timeout,
                },
            ),
        }
    }

    /// Write `DONE` and the ordered results in one conditional update.
    async fn record(&self, task_id: &str, results: &[SubtaskResult]) -> Result<(), PipelineError> {
        let result_json = serde_json::to_string(results)
            .map_err(|e| StoreError::Serialization(format!("results for task {task_id}: {e}")))?;

        let outcome = self
            .store
            .transition(
                task_id,
                TaskStatus::Done,
                &[
                    (TaskField::Result, result_json),
                    (TaskField::UpdatedAt, timestamp()),
                ],
            )
            .await?;

        match outcome {
            Transition::Applied => {
                let faults = results.iter().filter(|r| r.is_fault()).count();
                info!(task_id, results = results.len(), faults, "Task completed");
            }
            Transition::AlreadyInState => {
                info!(task_id, "Task already DONE, keeping earlier result");
            }
            Transition::Rejected { current } if current.is_terminal() => {
                warn!(task_id, %current, "Task already finished, discarding results");
            }
            Transition::Rejected { current } => {
                error!(task_id, %current, "Could not record results, task not in PROCESSING");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueWorker for Executor {
    fn name(&self) -> &'static str {
        "executor"
    }

    fn queue(&self) -> QueueName {
        QueueName::Execute
    }

    async fn handle(&self, payload: &str) -> Result<(), PipelineError> {
        self.process(payload).await
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
