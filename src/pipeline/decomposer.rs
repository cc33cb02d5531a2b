//! Decomposer: turns a submitted task into an ordered job.
//!
//! Flow per popped id:
//! 1. Read `input`; abandon if missing or blank
//! 2. Claim the task (`SUBMITTED → DECOMPOSING`)
//! 3. Ask the LLM for a subtask array and parse it strictly
//! 4. Record `PROCESSING`, then push `{task_id, subtasks}` to the execute queue
//!
//! Steps 3 and 4 are not atomic across a crash: a process dying after the
//! LLM call and before the push leaves the task at `DECOMPOSING` or
//! `PROCESSING` with no job queued. Nothing redelivers it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::poller::QueueWorker;
use crate::error::{PipelineError, StoreError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::{QueueName, SharedStore};
use crate::task::{Job, Subtask, TaskField, TaskStatus, Transition, timestamp};

/// System prompt for decomposition.
pub const DECOMPOSE_SYSTEM_PROMPT: &str = r#"You are a task decomposition agent.
Given a user's natural language request, break it into a JSON array of subtasks.
Each subtask must have this format:
{"action": "search" or "navigate" or "extract" or "summarize", "target": "url or search query", "params": {}}
Return ONLY the JSON array. No explanation. No markdown. Just the raw JSON array."#;

/// Temperature for decomposition (deterministic-ish).
const DECOMPOSE_TEMPERATURE: f32 = 0.1;

const DECOMPOSE_MAX_TOKENS: u32 = 1024;

/// What happened to one popped task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecomposeOutcome {
    /// Job pushed to the execute queue.
    Forwarded { task_id: String, subtasks: usize },
    /// Decomposition failed; the task is now `FAILED`.
    Failed { task_id: String, reason: String },
    /// Nothing to do: no input, or another decomposer owns the task.
    Skipped { task_id: String },
}

pub struct Decomposer {
    store: Arc<dyn SharedStore>,
    llm: Arc<dyn LlmProvider>,
}

impl Decomposer {
    pub fn new(store: Arc<dyn SharedStore>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { store, llm }
    }

    /// Handle one element popped from the decompose queue.
    pub async fn process(&self, payload: &str) -> Result<DecomposeOutcome, PipelineError> {
        let task_id = decode_task_id(payload);

        let input = self
            .store
            .get_field(&task_id, TaskField::Input)
            .await?
            .filter(|input| !input.trim().is_empty());
        let Some(input) = input else {
            warn!(task_id = %task_id, "No input stored for task, abandoning");
            return Ok(DecomposeOutcome::Skipped { task_id });
        };

        let claimed = self
            .store
            .transition(
                &task_id,
                TaskStatus::Decomposing,
                &[(TaskField::UpdatedAt, timestamp())],
            )
            .await?;
        if !claimed.is_applied() {
            warn!(task_id = %task_id, outcome = ?claimed, "Task not claimable, skipping");
            return Ok(DecomposeOutcome::Skipped { task_id });
        }

        info!(task_id = %task_id, "Decomposing task");

        let subtasks = match self.decompose(&input).await {
            Ok(subtasks) => subtasks,
            Err(e) => {
                let reason = e.to_string();
                error!(task_id = %task_id, error = %reason, "Decomposition failed");
                self.mark_failed(&task_id, &reason).await?;
                return Ok(DecomposeOutcome::Failed { task_id, reason });
            }
        };

        let count = subtasks.len();
        let job = Job {
            task_id: task_id.clone(),
            subtasks,
        };
        let job_json = serde_json::to_string(&job)
            .map_err(|e| StoreError::Serialization(format!("job for task {task_id}: {e}")))?;

        // PROCESSING goes in first so a fast executor's DONE can't be overtaken.
        let moved = self
            .store
            .transition(
                &task_id,
                TaskStatus::Processing,
                &[(TaskField::UpdatedAt, timestamp())],
            )
            .await?;
        if let Transition::Rejected { current } = moved {
            warn!(task_id = %task_id, %current, "Task moved while decomposing, dropping job");
            return Ok(DecomposeOutcome::Skipped { task_id });
        }

        if let Err(e) = self.store.push(QueueName::Execute, &job_json).await {
            error!(task_id = %task_id, error = %e, "Failed to enqueue job");
            if let Err(mark_err) = self
                .mark_failed(&task_id, &format!("could not enqueue job: {e}"))
                .await
            {
                error!(task_id = %task_id, error = %mark_err, "Failed to record enqueue failure");
            }
            return Err(e.into());
        }

        info!(task_id = %task_id, subtasks = count, "Task forwarded to executor");
        Ok(DecomposeOutcome::Forwarded {
            task_id,
            subtasks: count,
        })
    }

    /// Ask the LLM to decompose `input` and parse its answer.
    pub async fn decompose(&self, input: &str) -> Result<Vec<Subtask>, PipelineError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(DECOMPOSE_SYSTEM_PROMPT),
            ChatMessage::user(input),
        ])
        .with_temperature(DECOMPOSE_TEMPERATURE)
        .with_max_tokens(DECOMPOSE_MAX_TOKENS);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| PipelineError::Decomposition(format!("LLM call failed: {e}")))?;
        debug!(model = self.llm.model_name(), raw = %response.content, "Decomposition response");

        parse_subtasks(&response.content)
    }

    async fn mark_failed(&self, task_id: &str, reason: &str) -> Result<(), PipelineError> {
        let outcome = self
            .store
            .transition(
                task_id,
                TaskStatus::Failed,
                &[
                    (TaskField::Error, reason.to_string()),
                    (TaskField::UpdatedAt, timestamp()),
                ],
            )
            .await?;
        match outcome {
            Transition::Rejected { current } if current.is_terminal() => {
                debug!(task_id, %current, "Task already finished, not marking FAILED");
            }
            Transition::Rejected { current } => {
                warn!(task_id, %current, "Could not mark task FAILED");
            }
            Transition::Applied | Transition::AlreadyInState => {}
        }
        Ok(())
    }
}

#[async_trait]
impl QueueWorker for Decomposer {
    fn name(&self) -> &'static str {
        "decomposer"
    }

    fn queue(&self) -> QueueName {
        QueueName::Decompose
    }

    async fn handle(&self, payload: &str) -> Result<(), PipelineError> {
        self.process(payload).await.map(|_| ())
    }
}

/// Decompose-queue elements are JSON strings; older producers push the
/// bare id.
pub fn decode_task_id(payload: &str) -> String {
    serde_json::from_str::<String>(payload).unwrap_or_else(|_| payload.trim().to_string())
}

/// Parse LLM output as a non-empty JSON array of subtasks.
///
/// The whole (trimmed) text must be the array: prose or code fences around
/// it are a decomposition fault.
pub fn parse_subtasks(raw: &str) -> Result<Vec<Subtask>, PipelineError> {
    let subtasks: Vec<Subtask> = serde_json::from_str(raw.trim()).map_err(|e| {
        PipelineError::Decomposition(format!("output is not a subtask array: {e}"))
    })?;
    if subtasks.is_empty() {
        return Err(PipelineError::Decomposition(
            "output contained no subtasks".to_string(),
        ));
    }
    Ok(subtasks)
}
