//! Message tracing for debugging
//!
//! Appends chat requests, responses and errors to a JSONL file. Credentials are never written.

use crate::cli::TracingConfig;
use crate::models::{AdapterRequest, AdapterResponse, ChatMessage, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Message tracer that writes to JSONL file
pub struct MessageTracer {
    config: TracingConfig,
    file: Option<Mutex<File>>,
}

#[derive(Serialize)]
struct RequestTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    provider: &'a str,
    model: &'a str,
    is_stream: bool,
    reasoning: bool,
    tools: Vec<&'a str>,
    messages: Vec<&'a ChatMessage>,
}

#[derive(Serialize)]
struct ResponseTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_tokens: Option<u32>,
    response: &'a AdapterResponse,
}

#[derive(Serialize)]
struct ErrorTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    error: &'a str,
}

impl MessageTracer {
    /// Create a new tracer from config
    pub fn new(config: TracingConfig) -> Self {
        if !config.enabled {
            return Self { config, file: None };
        }

        let path = expand_tilde(&config.path);

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!("Failed to create tracing directory: {}", e);
                return Self { config, file: None };
            }
        }

        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing::info!("📝 Message tracing enabled: {}", path.display());
                Self {
                    config,
                    file: Some(Mutex::new(file)),
                }
            }
            Err(e) => {
                tracing::error!("Failed to open trace file: {}", e);
                Self { config, file: None }
            }
        }
    }

    /// A tracer that writes nothing
    pub fn disabled() -> Self {
        Self::new(TracingConfig::default())
    }

    /// Generate a new trace ID (empty when tracing is off)
    pub fn new_trace_id(&self) -> String {
        if self.file.is_some() {
            Uuid::new_v4().simple().to_string()[..8].to_string()
        } else {
            String::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Trace an outgoing adapter request
    pub fn trace_request(&self, id: &str, provider: &str, request: &AdapterRequest, is_stream: bool) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let messages = request
            .messages
            .iter()
            .filter(|m| !(self.config.omit_system_prompt && m.role == Role::System))
            .collect();

        let trace = RequestTrace {
            ts: Utc::now(),
            dir: "req",
            id,
            provider,
            model: &request.model,
            is_stream,
            reasoning: request.reasoning,
            tools: request
                .tools
                .iter()
                .flatten()
                .map(|t| t.id.as_str())
                .collect(),
            messages,
        };

        self.write_trace(&trace, file_mutex);
    }

    /// Trace a completed response, or the folded result of a finished stream
    pub fn trace_response(&self, id: &str, response: &AdapterResponse, latency_ms: u64) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let trace = ResponseTrace {
            ts: Utc::now(),
            dir: "res",
            id,
            latency_ms,
            input_tokens: response.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: response.usage.as_ref().map(|u| u.output_tokens),
            response,
        };

        self.write_trace(&trace, file_mutex);
    }

    pub fn trace_error(&self, id: &str, error: &str) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let trace = ErrorTrace {
            ts: Utc::now(),
            dir: "err",
            id,
            error,
        };

        self.write_trace(&trace, file_mutex);
    }

    fn write_trace<T: Serialize>(&self, trace: &T, file_mutex: &Mutex<File>) {
        let Ok(json) = serde_json::to_string(trace) else {
            return;
        };

        if let Ok(mut file) = file_mutex.lock() {
            let _ = writeln!(file, "{}", json);
        }
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
