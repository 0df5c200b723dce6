pub mod search;

use crate::models::{ToolCall, ToolDefinition, ToolParameter, ToolStatus};
use async_trait::async_trait;
use search::{format_search_context, SearchBackend};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

pub const WEB_SEARCH: &str = "web_search";
pub const CURRENT_TIME: &str = "current_time";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Outcome of one tool execution, as relayed to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl From<ToolResult<Value>> for ToolOutcome {
    fn from(result: ToolResult<Value>) -> Self {
        match result {
            Ok(data) => ToolOutcome::ok(data),
            Err(e) => ToolOutcome::failed(e.to_string()),
        }
    }
}

/// Executes tool calls emitted by a model.
///
/// Failures are reported in the outcome, never as a panic or a dropped call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute_tool(&self, name: &str, arguments: &Value) -> ToolOutcome;
}

/// Record an outcome on the call it answers
pub fn apply_tool_outcome(call: &mut ToolCall, outcome: &ToolOutcome) {
    call.result = outcome.data.clone();
    call.error = outcome.error.clone();
    call.status = if outcome.success {
        ToolStatus::Success
    } else {
        ToolStatus::Error
    };
}

/// Definitions of the tools served by [`BuiltinTools`]
pub fn builtin_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            id: WEB_SEARCH.to_string(),
            name: "Web search".to_string(),
            description: "Search the web and return the top results with titles, URLs and snippets.".to_string(),
            parameters: vec![ToolParameter {
                name: "query".to_string(),
                param_type: "string".to_string(),
                description: "Search query".to_string(),
                required: true,
                enum_values: None,
            }],
            builtin: true,
        },
        ToolDefinition {
            id: CURRENT_TIME.to_string(),
            name: "Current time".to_string(),
            description: "Get the current date and time in UTC.".to_string(),
            parameters: Vec::new(),
            builtin: true,
        },
    ]
}

/// Pick the definitions for the requested tool ids.
///
/// Configured tools shadow builtins with the same id. Unknown ids are skipped.
pub fn select_tools(requested: &[String], configured: &[ToolDefinition]) -> Vec<ToolDefinition> {
    let builtins = builtin_definitions();
    requested
        .iter()
        .filter_map(|id| {
            let found = configured
                .iter()
                .chain(builtins.iter())
                .find(|tool| &tool.id == id)
                .cloned();
            if found.is_none() {
                tracing::warn!("Requested tool {} is not defined, skipping", id);
            }
            found
        })
        .collect()
}

/// Server-side implementations of the builtin tools
pub struct BuiltinTools {
    search: Option<Arc<dyn SearchBackend>>,
    max_results: usize,
}

impl BuiltinTools {
    pub fn new(search: Option<Arc<dyn SearchBackend>>, max_results: usize) -> Self {
        Self { search, max_results }
    }

    async fn web_search(&self, arguments: &Value) -> ToolResult<Value> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidParameters("missing string argument 'query'".to_string()))?;

        let backend = self
            .search
            .as_ref()
            .ok_or_else(|| ToolError::ExecutionError("no search backend configured".to_string()))?;

        let results = backend.search(query, self.max_results).await?;
        Ok(json!({
            "query": query,
            "results": results,
            "context": format_search_context(query, &results),
        }))
    }

    fn current_time(&self) -> Value {
        let now = chrono::Utc::now();
        json!({
            "utc": now.to_rfc3339(),
            "unix": now.timestamp(),
        })
    }
}

#[async_trait]
impl ToolExecutor for BuiltinTools {
    async fn execute_tool(&self, name: &str, arguments: &Value) -> ToolOutcome {
        tracing::debug!("Executing tool {} with {}", name, arguments);
        let result = match name {
            WEB_SEARCH => self.web_search(arguments).await,
            CURRENT_TIME => Ok(self.current_time()),
            other => Err(ToolError::ToolNotFound(other.to_string())),
        };
        if let Err(e) = &result {
            tracing::warn!("Tool {} failed: {}", name, e);
        }
        result.into()
    }
}
