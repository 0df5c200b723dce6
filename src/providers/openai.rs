use super::streaming::{fuse_terminal, SseStream};
use super::{error::ProviderError, send_checked, ChunkStream, ProviderAdapter};
use crate::models::media::{self, DataUrl};
use crate::models::{
    content_to_text, AdapterRequest, AdapterResponse, ChatMessage, ContentKind, MessageContent, StreamChunk,
    ToolCall, ToolDefinition, Usage,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const NAME: &str = "openai";

/// OpenAI Chat Completions request format
#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: OpenAIContent,
}

/// Content can be string or array of content parts
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAIContent {
    String(String),
    Parts(Vec<OpenAIContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAIContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAIImageUrl },
    InputAudio { input_audio: OpenAIInputAudio },
}

#[derive(Debug, Serialize)]
struct OpenAIImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct OpenAIInputAudio {
    data: String,
    format: &'static str,
}

/// Tool definition
#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: &'static str, // "function"
    function: OpenAIFunctionDef,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

/// OpenAI Chat Completions response format
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    /// Image-output models on OpenRouter
    #[serde(default)]
    images: Option<Vec<OpenAIResponseImage>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    #[serde(default)]
    id: Option<String>,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String, // JSON string
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseImage {
    image_url: OpenAIResponseImageUrl,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// OpenAI streaming chunk
#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    /// Mid-stream failure reported by some gateways
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>, // OpenRouter, GLM
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCallDelta {
    /// Some gateways leave this out, even for parallel calls
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
    emitted: bool,
}

impl PartialToolCall {
    fn finish(&mut self, arguments: serde_json::Value) -> ToolCall {
        self.emitted = true;
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
        ToolCall::pending(id, self.name.clone(), arguments)
    }
}

/// Reassembles tool calls streamed as per-index argument fragments
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialToolCall>,
    last: Option<usize>,
}

impl ToolCallAccumulator {
    /// Pick the slot a fragment belongs to. Without an index, a new id opens a new slot
    /// and an id-less fragment continues the previous one.
    fn slot(&mut self, delta: &OpenAIToolCallDelta) -> usize {
        let key = match (delta.index, self.last) {
            (Some(index), _) => index,
            (None, Some(last)) => {
                let same_call = match (delta.id.as_deref(), self.calls.get(&last).and_then(|c| c.id.as_deref())) {
                    (Some(id), Some(existing)) => id == existing,
                    _ => true,
                };
                if same_call {
                    last
                } else {
                    self.next_free()
                }
            }
            (None, None) => self.next_free(),
        };
        self.last = Some(key);
        key
    }

    fn next_free(&self) -> usize {
        self.calls.keys().next_back().map_or(0, |key| key + 1)
    }

    /// Apply fragments and return calls whose arguments became a complete object
    fn apply(&mut self, deltas: Vec<OpenAIToolCallDelta>) -> Vec<ToolCall> {
        let mut ready = Vec::new();
        for delta in deltas {
            let key = self.slot(&delta);
            let call = self.calls.entry(key).or_default();
            if let Some(id) = delta.id {
                call.id = Some(id);
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    call.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    call.arguments.push_str(&arguments);
                }
            }

            if call.emitted || call.name.is_empty() {
                continue;
            }
            if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(&call.arguments) {
                ready.push(call.finish(value));
            }
        }
        ready
    }

    /// Flush calls that never produced a parseable object
    fn drain(&mut self) -> Vec<ToolCall> {
        self.last = None;
        let calls = std::mem::take(&mut self.calls);
        calls
            .into_values()
            .filter(|call| !call.emitted && !call.name.is_empty())
            .map(|mut call| {
                let arguments = parse_arguments(&call.arguments);
                call.finish(arguments)
            })
            .collect()
    }
}

fn parse_arguments(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => {
            if !raw.trim().is_empty() {
                tracing::debug!("Unparseable tool arguments, defaulting to {{}}: {}", raw);
            }
            serde_json::json!({})
        }
    }
}

fn transform_tools(tools: &[ToolDefinition]) -> Vec<OpenAITool> {
    tools
        .iter()
        .map(|tool| OpenAITool {
            r#type: "function",
            function: OpenAIFunctionDef {
                name: tool.id.clone(),
                description: tool.description.clone(),
                parameters: tool.json_schema(),
            },
        })
        .collect()
}

fn audio_format(data_url: &DataUrl) -> Option<&'static str> {
    match data_url.mime_type.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        _ => None,
    }
}

fn transform_message(message: &ChatMessage) -> OpenAIMessage {
    let role = message.role.as_str();
    let items = match &message.content {
        MessageContent::Text(text) => {
            return OpenAIMessage {
                role,
                content: OpenAIContent::String(text.clone()),
            }
        }
        MessageContent::Items(items) => items,
    };

    // Text-only bodies are flattened for providers that reject part arrays
    if items.iter().all(|item| item.kind == ContentKind::Text) {
        return OpenAIMessage {
            role,
            content: OpenAIContent::String(content_to_text(&message.content)),
        };
    }

    let mut parts = Vec::new();
    for item in items {
        match item.kind {
            ContentKind::Text => {
                if let Some(text) = &item.text {
                    parts.push(OpenAIContentPart::Text { text: text.clone() });
                }
            }
            ContentKind::Image => {
                if let Some(url) = &item.url {
                    parts.push(OpenAIContentPart::ImageUrl {
                        image_url: OpenAIImageUrl { url: url.clone() },
                    });
                }
            }
            ContentKind::Audio => {
                let input_audio = item
                    .url
                    .as_deref()
                    .and_then(|url| media::parse_data_url(url).ok())
                    .and_then(|data_url| {
                        audio_format(&data_url).map(|format| OpenAIInputAudio {
                            data: data_url.data.clone(),
                            format,
                        })
                    });
                match input_audio {
                    Some(input_audio) => parts.push(OpenAIContentPart::InputAudio { input_audio }),
                    None => tracing::warn!("Skipping audio item: only wav/mp3 data URLs are supported"),
                }
            }
            ContentKind::File => match text_file_contents(item.url.as_deref()) {
                Some(text) => {
                    let header = item.file_name.as_deref().unwrap_or("attachment");
                    parts.push(OpenAIContentPart::Text {
                        text: format!("[{}]\n{}", header, text),
                    });
                }
                None => tracing::warn!("Skipping file item {:?}: not an inline text file", item.file_name),
            },
            ContentKind::Video => tracing::warn!("Skipping video item: not supported by {}", NAME),
        }
    }

    OpenAIMessage {
        role,
        content: OpenAIContent::Parts(parts),
    }
}

/// Decode an inline `text/*` data URL
pub(crate) fn text_file_contents(url: Option<&str>) -> Option<String> {
    let data_url = media::parse_data_url(url?).ok()?;
    if !data_url.mime_type.starts_with("text/") {
        return None;
    }
    let bytes = data_url.decode().ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn build_request(request: &AdapterRequest, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: request.model.clone(),
        messages: request.messages.iter().map(transform_message).collect(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream,
        tools: request.active_tools().map(transform_tools),
        reasoning_effort: request.reasoning.then_some("medium"),
    }
}

fn transform_response(response: ChatCompletionResponse) -> AdapterResponse {
    let usage = response.usage.map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .unwrap_or_default();

    let tool_calls: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let id = call
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            ToolCall::pending(id, call.function.name, parse_arguments(&call.function.arguments))
        })
        .collect();
    let images: Vec<String> = message
        .images
        .unwrap_or_default()
        .into_iter()
        .map(|image| image.image_url.url)
        .collect();

    AdapterResponse {
        content: message.content.unwrap_or_default(),
        thinking: message.reasoning_content.or(message.reasoning),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        images: (!images.is_empty()).then_some(images),
        audio: None,
        usage,
    }
}

/// POST a chat completion and normalize the reply
pub(crate) async fn complete(
    client: &Client,
    url: &str,
    api_key: &str,
    body: &ChatCompletionRequest,
    name: &str,
) -> Result<AdapterResponse, ProviderError> {
    tracing::debug!("{} chat completion: {}", name, url);
    let response = send_checked(client.post(url).bearer_auth(api_key).json(body), name).await?;

    let response_text = response.text().await?;
    tracing::debug!("{} provider response body: {}", name, response_text);

    let parsed: ChatCompletionResponse = serde_json::from_str(&response_text).map_err(|e| {
        tracing::error!("Failed to parse {} response: {}", name, e);
        e
    })?;

    Ok(transform_response(parsed))
}

/// Stream a chat completion as normalized chunks
pub(crate) fn stream_completion(
    client: Client,
    url: String,
    api_key: String,
    body: ChatCompletionRequest,
    name: &'static str,
) -> ChunkStream {
    fuse_terminal(async_stream::stream! {
        tracing::debug!("{} streaming chat completion: {}", name, url);
        let builder = client
            .post(&url)
            .bearer_auth(&api_key)
            .header("accept", "text/event-stream")
            .json(&body);
        let response = match send_checked(builder, name).await {
            Ok(response) => response,
            Err(e) => {
                yield e.into_chunk();
                return;
            }
        };

        let mut events = SseStream::new(response.bytes_stream());
        let mut tool_calls = ToolCallAccumulator::default();

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!("{} stream error: {}", name, e);
                    yield ProviderError::HttpError(e).into_chunk();
                    return;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                for call in tool_calls.drain() {
                    yield StreamChunk::ToolCall { tool_call: call };
                }
                yield StreamChunk::Done;
                return;
            }

            let chunk: OpenAIStreamChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!("Skipping malformed {} chunk: {} - Data: {}", name, e, data);
                    continue;
                }
            };

            if let Some(error) = chunk.error {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                yield StreamChunk::error(format!("{} stream error: {}", name, message));
                return;
            }

            for choice in chunk.choices {
                let delta = choice.delta;
                if let Some(thinking) = delta.reasoning_content.or(delta.reasoning) {
                    if !thinking.is_empty() {
                        yield StreamChunk::thinking(thinking);
                    }
                }
                if let Some(content) = delta.content {
                    if !content.is_empty() {
                        yield StreamChunk::text(content);
                    }
                }
                if let Some(deltas) = delta.tool_calls {
                    for call in tool_calls.apply(deltas) {
                        yield StreamChunk::ToolCall { tool_call: call };
                    }
                }
                if choice.finish_reason.is_some() {
                    for call in tool_calls.drain() {
                        yield StreamChunk::ToolCall { tool_call: call };
                    }
                }
            }
        }

        // Some providers close the stream without [DONE]
        tracing::debug!("{} stream ended without [DONE]", name);
        for call in tool_calls.drain() {
            yield StreamChunk::ToolCall { tool_call: call };
        }
        yield StreamChunk::Done;
    })
}

/// Adapter for OpenAI and wire-compatible vendors (DeepSeek, Qwen, OpenRouter, ...)
pub struct OpenAIAdapter {
    client: Client,
}

impl OpenAIAdapter {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn endpoint(request: &AdapterRequest) -> String {
        format!("{}/chat/completions", request.base())
    }
}

impl Default for OpenAIAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn chat(&self, request: AdapterRequest) -> Result<AdapterResponse, ProviderError> {
        let body = build_request(&request, false);
        complete(&self.client, &Self::endpoint(&request), request.api_key(), &body, NAME).await
    }

    fn chat_stream(&self, request: AdapterRequest) -> ChunkStream {
        let body = build_request(&request, true);
        stream_completion(
            self.client.clone(),
            Self::endpoint(&request),
            request.api_key().to_string(),
            body,
            NAME,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentItem, ToolParameter};

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, arguments: &str) -> OpenAIToolCallDelta {
        OpenAIToolCallDelta {
            index: Some(index),
            ..unindexed(id, name, arguments)
        }
    }

    fn unindexed(id: Option<&str>, name: Option<&str>, arguments: &str) -> OpenAIToolCallDelta {
        OpenAIToolCallDelta {
            index: None,
            id: id.map(str::to_string),
            function: Some(OpenAIFunctionDelta {
                name: name.map(str::to_string),
                arguments: Some(arguments.to_string()),
            }),
        }
    }

    #[test]
    fn test_accumulator_emits_once_arguments_parse() {
        let mut acc = ToolCallAccumulator::default();
        assert!(acc
            .apply(vec![delta(0, Some("call_1"), Some("web_search"), "{\"query\":")])
            .is_empty());

        let ready = acc.apply(vec![delta(0, None, None, "\"x\"}")]);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "call_1");
        assert_eq!(ready[0].name, "web_search");
        assert_eq!(ready[0].arguments, serde_json::json!({"query": "x"}));

        // Already emitted, nothing left to flush
        assert!(acc.drain().is_empty());
    }

    #[test]
    fn test_accumulator_drain_defaults_to_empty_object() {
        let mut acc = ToolCallAccumulator::default();
        acc.apply(vec![delta(0, Some("a"), Some("current_time"), "")]);
        acc.apply(vec![delta(1, Some("b"), Some("web_search"), "{\"query\": \"unterminated")]);

        let drained = acc.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].arguments, serde_json::json!({}));
        assert_eq!(drained[1].id, "b");
        assert_eq!(drained[1].arguments, serde_json::json!({}));
    }

    #[test]
    fn test_accumulator_separates_unindexed_parallel_calls() {
        let mut acc = ToolCallAccumulator::default();
        let mut calls = acc.apply(vec![unindexed(Some("a"), Some("current_time"), "{}")]);
        calls.extend(acc.apply(vec![unindexed(Some("b"), Some("web_search"), "{\"query\":")]));
        calls.extend(acc.apply(vec![unindexed(None, None, "\"rust\"}")]));
        calls.extend(acc.drain());

        let summary: Vec<(&str, &str)> = calls.iter().map(|c| (c.id.as_str(), c.name.as_str())).collect();
        assert_eq!(summary, vec![("a", "current_time"), ("b", "web_search")]);
        assert_eq!(calls[1].arguments, serde_json::json!({"query": "rust"}));
    }

    #[test]
    fn test_build_request_omits_empty_tools_and_flattens_text() {
        let request = AdapterRequest::new("gpt-4o", "https://api.openai.com/v1", "k")
            .with_messages(vec![
                ChatMessage::system("be brief"),
                ChatMessage::user(MessageContent::Items(vec![
                    ContentItem::text("a"),
                    ContentItem::text("b"),
                ])),
            ])
            .with_tools(vec![]);

        let body = serde_json::to_value(build_request(&request, true)).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("reasoning_effort").is_none());
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0], serde_json::json!({"role": "system", "content": "be brief"}));
        assert_eq!(body["messages"][1]["content"], "a\nb");
    }

    #[test]
    fn test_build_request_multimodal_parts_and_tools() {
        let mut request = AdapterRequest::new("gpt-4o", "https://api.openai.com/v1/", "k")
            .with_messages(vec![ChatMessage::user(MessageContent::Items(vec![
                ContentItem::text("what is this?"),
                ContentItem::media(ContentKind::Image, "https://example.com/a.png"),
                ContentItem::media(ContentKind::Audio, "data:audio/wav;base64,UklG"),
                ContentItem::media(ContentKind::Video, "https://example.com/v.mp4"),
            ]))])
            .with_tools(vec![ToolDefinition {
                id: "web_search".into(),
                name: "Web Search".into(),
                description: "Search".into(),
                parameters: vec![ToolParameter {
                    name: "query".into(),
                    param_type: "string".into(),
                    description: String::new(),
                    required: true,
                    enum_values: None,
                }],
                builtin: true,
            }]);
        request.reasoning = true;

        let body = serde_json::to_value(build_request(&request, false)).unwrap();
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1]["image_url"]["url"], "https://example.com/a.png");
        assert_eq!(parts[2], serde_json::json!({"type": "input_audio", "input_audio": {"data": "UklG", "format": "wav"}}));
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "web_search");
        assert_eq!(body["reasoning_effort"], "medium");
        assert_eq!(OpenAIAdapter::endpoint(&request), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_transform_response_reasoning_and_tool_calls() {
        let response: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {
                    "content": "done",
                    "reasoning_content": "thought",
                    "tool_calls": [{"id": "call_9", "type": "function", "function": {"name": "current_time", "arguments": "{}"}}]
                }
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5}
        }))
        .unwrap();

        let adapted = transform_response(response);
        assert_eq!(adapted.content, "done");
        assert_eq!(adapted.thinking.as_deref(), Some("thought"));
        assert_eq!(adapted.tool_calls.unwrap()[0].id, "call_9");
        assert_eq!(adapted.usage, Some(Usage { input_tokens: 3, output_tokens: 5 }));
    }

    #[test]
    fn test_text_file_contents() {
        let url = media::to_data_url("text/plain", &media::encode_base64(b"notes"));
        assert_eq!(text_file_contents(Some(&url)).as_deref(), Some("notes"));
        assert!(text_file_contents(Some("data:application/pdf;base64,JVBE")).is_none());
        assert!(text_file_contents(None).is_none());
    }
}
