//! Error types for Task Relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Shared queue / status store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Command {command} failed on {key}: {reason}")]
    Command {
        command: String,
        key: String,
        reason: String,
    },

    #[error("Task {task_id} not found")]
    NotFound { task_id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Automation engine errors.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("Failed to open session: {0}")]
    SessionFailed(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("{operation} failed: {reason}")]
    Command { operation: String, reason: String },

    #[error("Session already closed")]
    Closed,
}

/// Faults raised by an action handler. The executor records these in the
/// result stream; they never abort the job.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{action} timed out after {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Invalid parameters for {action}: {reason}")]
    InvalidParameters { action: String, reason: String },
}

/// Pipeline-level (decomposer / executor) errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    #[error("Malformed job payload: {0}")]
    MalformedJob(String),

    #[error("Automation session unavailable: {0}")]
    Session(#[from] BrowserError),

    #[error("Job for task {task_id} panicked: {reason}")]
    Panicked { task_id: String, reason: String },
}

impl PipelineError {
    /// Store/transport faults; everything else is scoped to one task.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_faults_are_transient() {
        let err = PipelineError::from(StoreError::Connection("refused".into()));
        assert!(err.is_transient());
        assert!(!PipelineError::MalformedJob("x".into()).is_transient());
        assert!(!PipelineError::Decomposition("x".into()).is_transient());
    }

    #[test]
    fn error_messages_carry_context() {
        let err = HandlerError::Timeout {
            action: "navigate".into(),
            timeout: Duration::from_secs(15),
        };
        assert_eq!(err.to_string(), "navigate timed out after 15s");

        let err = PipelineError::from(StoreError::NotFound {
            task_id: "abc".into(),
        });
        assert_eq!(err.to_string(), "Store error: Task abc not found");
    }
}
