//! Task, job and subtask types shared by every stage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::TaskStatus;

/// The fixed set of actions a subtask can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Navigate,
    Search,
    Extract,
    Summarize,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Search => "search",
            Self::Extract => "extract",
            Self::Summarize => "summarize",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic step of a job, as produced by decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub action: Action,
    /// URL, search query, or text, depending on the action.
    pub target: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Subtask {
    pub fn new(action: Action, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// String-valued parameter, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Execution-queue message: a decomposed task ready for an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub task_id: String,
    pub subtasks: Vec<Subtask>,
}

/// Outcome of one subtask, stored in order inside `result`.
///
/// Successful and degraded outcomes carry action-specific fields; a fault
/// raised by the handler carries `error` plus the subtask that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub action: Action,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask: Option<Subtask>,
}

impl SubtaskResult {
    /// A handler ran to completion, possibly with an embedded error.
    pub fn completed(action: Action, fields: Map<String, Value>, error: Option<String>) -> Self {
        Self {
            action,
            fields,
            error,
            subtask: None,
        }
    }

    /// A handler raised; record the fault against the subtask.
    pub fn fault(subtask: &Subtask, error: impl std::fmt::Display) -> Self {
        Self {
            action: subtask.action,
            fields: Map::new(),
            error: Some(error.to_string()),
            subtask: Some(subtask.clone()),
        }
    }

    /// Whether the handler raised. Degraded results with an embedded
    /// `error` are not faults.
    pub fn is_fault(&self) -> bool {
        self.subtask.is_some()
    }
}

/// Named fields of the `task:<id>` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskField {
    Input,
    Status,
    Result,
    Error,
    CreatedAt,
    UpdatedAt,
}

impl TaskField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Status => "status",
            Self::Result => "result",
            Self::Error => "error",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }
}

/// Snapshot of a task record as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub input: Option<String>,
    pub status: Option<TaskStatus>,
    /// Decoded `result` JSON; falls back to the raw string if it is not JSON.
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl TaskRecord {
    /// Build a record from raw hash fields. Empty strings count as absent.
    pub fn from_fields(task_id: impl Into<String>, fields: &HashMap<String, String>) -> Self {
        let get = |field: TaskField| {
            fields
                .get(field.as_str())
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let status = match get(TaskField::Status) {
            Some(raw) => TaskStatus::parse(&raw),
            None if fields.is_empty() => None,
            None => Some(TaskStatus::Submitted),
        };

        let result = get(TaskField::Result)
            .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)));

        Self {
            task_id: task_id.into(),
            input: get(TaskField::Input),
            status,
            result,
            error: get(TaskField::Error),
            created_at: get(TaskField::CreatedAt),
            updated_at: get(TaskField::UpdatedAt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subtask_params_default_to_empty() {
        let subtask: Subtask =
            serde_json::from_str(r#"{"action": "search", "target": "rust"}"#).unwrap();
        assert_eq!(subtask.action, Action::Search);
        assert!(subtask.params.is_empty());
    }

    #[test]
    fn unknown_action_rejected() {
        let parsed: Result<Subtask, _> =
            serde_json::from_str(r##"{"action": "click", "target": "#btn", "params": {}}"##);
        assert!(parsed.is_err());
    }

    #[test]
    fn job_wire_format() {
        let job = Job {
            task_id: "t1".into(),
            subtasks: vec![Subtask::new(Action::Extract, "").with_param("selector", "main")],
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value,
            json!({
                "task_id": "t1",
                "subtasks": [{"action": "extract", "target": "", "params": {"selector": "main"}}]
            })
        );
    }

    #[test]
    fn completed_result_flattens_fields() {
        let mut fields = Map::new();
        fields.insert("url".into(), json!("https://example.com"));
        fields.insert("title".into(), json!("Example"));
        let result = SubtaskResult::completed(Action::Navigate, fields, None);

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({"action": "navigate", "url": "https://example.com", "title": "Example"})
        );
    }

    #[test]
    fn fault_result_carries_subtask() {
        let subtask = Subtask::new(Action::Navigate, "not a url");
        let result = SubtaskResult::fault(&subtask, "navigate timed out after 15s");
        assert!(result.is_fault());

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["error"], "navigate timed out after 15s");
        assert_eq!(value["subtask"]["target"], "not a url");
        assert_eq!(value["action"], "navigate");
    }

    #[test]
    fn result_deserializes_extra_fields_into_map() {
        let raw = r#"{"action": "search", "query": "q", "results": ["a"], "error": null}"#;
        let result: SubtaskResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.fields["query"], "q");
        assert!(result.error.is_none());
    }

    #[test]
    fn degraded_result_is_not_a_fault() {
        let result = SubtaskResult::completed(
            Action::Summarize,
            Map::new(),
            Some("summarize endpoint unreachable".to_string()),
        );
        assert!(!result.is_fault());
    }

    #[test]
    fn record_from_fields_decodes_result() {
        let mut fields = HashMap::new();
        fields.insert("input".to_string(), "weather".to_string());
        fields.insert("status".to_string(), "DONE".to_string());
        fields.insert("result".to_string(), r#"[{"action":"search"}]"#.to_string());

        let record = TaskRecord::from_fields("t1", &fields);
        assert_eq!(record.status, Some(TaskStatus::Done));
        assert_eq!(record.result, Some(json!([{"action": "search"}])));
        assert_eq!(record.input.as_deref(), Some("weather"));
    }

    #[test]
    fn record_without_status_reads_as_submitted() {
        let mut fields = HashMap::new();
        fields.insert("input".to_string(), "hello".to_string());
        fields.insert("result".to_string(), String::new());

        let record = TaskRecord::from_fields("t1", &fields);
        assert_eq!(record.status, Some(TaskStatus::Submitted));
        assert!(record.result.is_none());

        let empty = TaskRecord::from_fields("t2", &HashMap::new());
        assert!(empty.status.is_none());
    }
}
