//! Task descriptor and execution result types shared by the orchestrator
//! client and the execution back-ends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a task should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One request/response round-trip to the model API.
    Api,
    /// Supervised external tool in a per-task workspace.
    Process,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Api => write!(f, "api"),
            ExecutionMode::Process => write!(f, "process"),
        }
    }
}

/// A unit of work as received from the orchestrator.
///
/// Fields the agent does not understand are preserved in `extra` and sent
/// back unchanged on reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Relative path -> UTF-8 content, materialised into the workspace input tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, String>>,
    /// Per-task override of the agent's default execution mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Token accounting from a model API call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// A file produced by a task, surfaced in the result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub relative_path: String,
    pub size_bytes: u64,
    /// File suffix, or "unknown" when the file has none.
    pub type_hint: String,
    /// Populated only for small text-like files (< 100 kB, known suffix).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_content: Option<String>,
}

/// Outcome of executing a task through any back-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// The model reply, or the captured stdout of the external tool.
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub execution_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ExecutionResult {
    /// A failed result carrying only an error message.
    pub fn failure(error: impl Into<String>, execution_time_seconds: f64) -> Self {
        Self {
            success: false,
            response: String::new(),
            usage: None,
            artifacts: Vec::new(),
            execution_time_seconds,
            exit_code: None,
            error: Some(error.into()),
            model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn descriptor_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "id": "t1",
            "description": "Say hi",
            "context": {"lang": "en"},
            "priority": 7,
            "requested_by": "scheduler"
        });

        let task: TaskDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(task.id, "t1");
        assert_eq!(task.extra.get("priority"), Some(&serde_json::json!(7)));

        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back.get("priority"), Some(&serde_json::json!(7)));
        assert_eq!(
            back.get("requested_by"),
            Some(&serde_json::json!("scheduler"))
        );
    }

    #[test]
    fn execution_mode_wire_names() {
        let task: TaskDescriptor =
            serde_json::from_value(serde_json::json!({"id": "t2", "execution_mode": "process"}))
                .unwrap();
        assert_eq!(task.execution_mode, Some(ExecutionMode::Process));

        let task: TaskDescriptor =
            serde_json::from_value(serde_json::json!({"id": "t3", "execution_mode": "api"}))
                .unwrap();
        assert_eq!(task.execution_mode, Some(ExecutionMode::Api));
    }

    #[test]
    fn missing_optional_fields_default() {
        let task: TaskDescriptor = serde_json::from_value(serde_json::json!({"id": "t4"})).unwrap();
        assert_eq!(task.description, "");
        assert!(task.context.is_empty());
        assert!(task.files.is_none());
        assert!(task.execution_mode.is_none());
    }
}
