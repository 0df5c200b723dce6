use super::streaming::{fuse_terminal, SseStream};
use super::{error::ProviderError, inline_media, send_checked, ChunkStream, ProviderAdapter};
use crate::models::media;
use crate::models::{
    AdapterRequest, AdapterResponse, ChatMessage, ContentItem, ContentKind, MessageContent, Role, StreamChunk,
    ToolCall, ToolDefinition, Usage,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const NAME: &str = "anthropic";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const THINKING_BUDGET_TOKENS: u32 = 2048;

/// Anthropic Messages API request
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text { text: String },
    Image { source: Base64Source },
    Document { source: Base64Source },
}

#[derive(Debug, Serialize)]
struct Base64Source {
    r#type: &'static str, // "base64"
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    r#type: &'static str, // "enabled"
    budget_tokens: u32,
}

/// Non-streaming response
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Typed SSE event payload
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageStop,
    Error {
        error: StreamErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Tool-use block whose input arrives as JSON fragments
#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

impl PendingToolUse {
    fn into_tool_call(self) -> ToolCall {
        let arguments = if self.input_json.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str::<serde_json::Value>(&self.input_json) {
                Ok(value @ serde_json::Value::Object(_)) => value,
                _ => {
                    tracing::debug!("Unparseable tool input for {}: {}", self.name, self.input_json);
                    serde_json::json!({})
                }
            }
        };
        ToolCall::pending(self.id, self.name, arguments)
    }
}

/// Per-stream translation state
#[derive(Debug, Default)]
struct StreamState {
    tool_uses: HashMap<usize, PendingToolUse>,
}

impl StreamState {
    fn handle(&mut self, event: StreamEvent) -> Vec<StreamChunk> {
        match event {
            StreamEvent::ContentBlockStart { index, content_block } => {
                if let StartBlock::ToolUse { id, name } = content_block {
                    self.tool_uses.insert(
                        index,
                        PendingToolUse {
                            id,
                            name,
                            input_json: String::new(),
                        },
                    );
                }
                vec![]
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => vec![StreamChunk::text(text)],
                BlockDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    vec![StreamChunk::thinking(thinking)]
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool_use) = self.tool_uses.get_mut(&index) {
                        tool_use.input_json.push_str(&partial_json);
                    }
                    vec![]
                }
                _ => vec![],
            },
            StreamEvent::ContentBlockStop { index } => match self.tool_uses.remove(&index) {
                Some(tool_use) => vec![StreamChunk::ToolCall {
                    tool_call: tool_use.into_tool_call(),
                }],
                None => vec![],
            },
            StreamEvent::MessageStop => {
                let mut chunks = self.flush();
                chunks.push(StreamChunk::Done);
                chunks
            }
            StreamEvent::Error { error } => {
                vec![StreamChunk::error(format!("{} stream error ({}): {}", NAME, error.kind, error.message))]
            }
            StreamEvent::Other => vec![],
        }
    }

    /// Tool uses whose block never closed
    fn flush(&mut self) -> Vec<StreamChunk> {
        let mut pending: Vec<(usize, PendingToolUse)> = self.tool_uses.drain().collect();
        pending.sort_by_key(|(index, _)| *index);
        pending
            .into_iter()
            .map(|(_, tool_use)| StreamChunk::ToolCall {
                tool_call: tool_use.into_tool_call(),
            })
            .collect()
    }
}

fn transform_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| AnthropicTool {
            name: tool.id.clone(),
            description: tool.description.clone(),
            input_schema: tool.json_schema(),
        })
        .collect()
}

fn unsupported(item: &ContentItem, reason: impl std::fmt::Display) -> ProviderError {
    ProviderError::UnsupportedContent(format!(
        "{} cannot accept {:?} item{}: {}",
        NAME,
        item.kind,
        item.file_name.as_deref().map(|n| format!(" '{}'", n)).unwrap_or_default(),
        reason
    ))
}

async fn transform_item(client: &Client, item: &ContentItem) -> Result<Option<AnthropicBlock>, ProviderError> {
    match item.kind {
        ContentKind::Text => Ok(item.text.clone().map(|text| AnthropicBlock::Text { text })),
        ContentKind::Image => {
            let data_url = inline_media(client, item).await.map_err(|e| unsupported(item, e))?;
            if !data_url.mime_type.starts_with("image/") {
                return Err(unsupported(item, format!("unexpected image type {}", data_url.mime_type)));
            }
            Ok(Some(AnthropicBlock::Image {
                source: Base64Source {
                    r#type: "base64",
                    media_type: data_url.mime_type,
                    data: data_url.data,
                },
            }))
        }
        ContentKind::File => {
            let data_url = inline_media(client, item).await.map_err(|e| unsupported(item, e))?;
            if data_url.mime_type == "application/pdf" {
                Ok(Some(AnthropicBlock::Document {
                    source: Base64Source {
                        r#type: "base64",
                        media_type: data_url.mime_type,
                        data: data_url.data,
                    },
                }))
            } else if data_url.mime_type.starts_with("text/") {
                let bytes = media::decode_base64(&data_url.data)?;
                let header = item.file_name.as_deref().unwrap_or("attachment");
                Ok(Some(AnthropicBlock::Text {
                    text: format!("[{}]\n{}", header, String::from_utf8_lossy(&bytes)),
                }))
            } else {
                Err(unsupported(item, format!("file type {} is not supported", data_url.mime_type)))
            }
        }
        ContentKind::Audio | ContentKind::Video => Err(unsupported(item, "no audio or video input")),
    }
}

/// Hoist system messages and convert the rest to Anthropic blocks
async fn transform_messages(
    client: &Client,
    messages: &[ChatMessage],
) -> Result<(Option<String>, Vec<AnthropicMessage>), ProviderError> {
    let mut system_parts = Vec::new();
    let mut converted = Vec::new();

    for message in messages {
        if message.role == Role::System {
            let text = crate::models::content_to_text(&message.content);
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }

        let content = match &message.content {
            MessageContent::Text(text) => AnthropicContent::Text(text.clone()),
            MessageContent::Items(items) => {
                let mut blocks = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(block) = transform_item(client, item).await? {
                        blocks.push(block);
                    }
                }
                AnthropicContent::Blocks(blocks)
            }
        };

        converted.push(AnthropicMessage {
            role: message.role.as_str(),
            content,
        });
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    Ok((system, converted))
}

async fn build_request(client: &Client, request: &AdapterRequest, stream: bool) -> Result<MessagesRequest, ProviderError> {
    let (system, messages) = transform_messages(client, &request.messages).await?;

    let mut max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let thinking = request.reasoning.then(|| ThinkingConfig {
        r#type: "enabled",
        budget_tokens: THINKING_BUDGET_TOKENS,
    });
    if thinking.is_some() && max_tokens <= THINKING_BUDGET_TOKENS {
        max_tokens = THINKING_BUDGET_TOKENS + DEFAULT_MAX_TOKENS;
    }

    Ok(MessagesRequest {
        model: request.model.clone(),
        messages,
        max_tokens,
        system,
        // Extended thinking rejects a custom temperature
        temperature: if thinking.is_some() { None } else { request.temperature },
        stream,
        tools: request.active_tools().map(transform_tools),
        thinking,
    })
}

fn transform_response(response: MessagesResponse) -> AdapterResponse {
    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            ResponseBlock::Text { text } => content.push_str(&text),
            ResponseBlock::Thinking { thinking: t } => thinking.push_str(&t),
            ResponseBlock::ToolUse { id, name, input } => {
                let arguments = if input.is_object() { input } else { serde_json::json!({}) };
                tool_calls.push(ToolCall::pending(id, name, arguments));
            }
            ResponseBlock::Other => {}
        }
    }

    AdapterResponse {
        content,
        thinking: (!thinking.is_empty()).then_some(thinking),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        images: None,
        audio: None,
        usage: response.usage.map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
    }
}

/// Anthropic Messages API adapter
pub struct AnthropicAdapter {
    client: Client,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn post(client: &Client, request: &AdapterRequest) -> RequestBuilder {
        client
            .post(format!("{}/v1/messages", request.base()))
            .header("x-api-key", request.api_key())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn chat(&self, request: AdapterRequest) -> Result<AdapterResponse, ProviderError> {
        let body = build_request(&self.client, &request, false).await?;
        let response = send_checked(Self::post(&self.client, &request).json(&body), NAME).await?;

        // Get response body as text for debugging
        let response_text = response.text().await?;
        tracing::debug!("{} provider response body: {}", NAME, response_text);

        let parsed: MessagesResponse = serde_json::from_str(&response_text).map_err(|e| {
            tracing::error!("Failed to parse {} response: {}", NAME, e);
            e
        })?;

        Ok(transform_response(parsed))
    }

    fn chat_stream(&self, request: AdapterRequest) -> ChunkStream {
        let client = self.client.clone();

        fuse_terminal(async_stream::stream! {
            let body = match build_request(&client, &request, true).await {
                Ok(body) => body,
                Err(e) => {
                    yield e.into_chunk();
                    return;
                }
            };
            let builder = Self::post(&client, &request)
                .header("accept", "text/event-stream")
                .json(&body);
            let response = match send_checked(builder, NAME).await {
                Ok(response) => response,
                Err(e) => {
                    yield e.into_chunk();
                    return;
                }
            };

            let mut events = SseStream::new(response.bytes_stream());
            let mut state = StreamState::default();

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!("{} stream error: {}", NAME, e);
                        yield ProviderError::HttpError(e).into_chunk();
                        return;
                    }
                };

                let parsed: StreamEvent = match serde_json::from_str(&event.data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::debug!("Skipping malformed {} event {:?}: {} - Data: {}", NAME, event.event, e, event.data);
                        continue;
                    }
                };

                for chunk in state.handle(parsed) {
                    yield chunk;
                }
            }

            tracing::debug!("{} stream ended without message_stop", NAME);
            for chunk in state.flush() {
                yield chunk;
            }
            yield StreamChunk::Done;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolParameter;

    fn event(json: serde_json::Value) -> StreamEvent {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_tool_input_is_buffered_until_block_stop() {
        let mut state = StreamState::default();
        assert!(state
            .handle(event(serde_json::json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "web_search", "input": {}}
            })))
            .is_empty());

        for fragment in ["{\"que", "ry\": \"ru", "st\"}"] {
            let chunks = state.handle(event(serde_json::json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": fragment}
            })));
            assert!(chunks.is_empty());
        }

        let chunks = state.handle(event(serde_json::json!({"type": "content_block_stop", "index": 1})));
        match &chunks[..] {
            [StreamChunk::ToolCall { tool_call }] => {
                assert_eq!(tool_call.id, "toolu_1");
                assert_eq!(tool_call.arguments, serde_json::json!({"query": "rust"}));
            }
            other => panic!("unexpected chunks {:?}", other),
        }
    }

    #[test]
    fn test_text_thinking_and_stop() {
        let mut state = StreamState::default();
        let chunks = state.handle(event(serde_json::json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "thinking_delta", "thinking": "hmm"}
        })));
        assert_eq!(chunks, vec![StreamChunk::thinking("hmm")]);

        let chunks = state.handle(event(serde_json::json!({
            "type": "content_block_delta", "index": 1,
            "delta": {"type": "text_delta", "text": "Hello"}
        })));
        assert_eq!(chunks, vec![StreamChunk::text("Hello")]);

        // Unknown event types and deltas are ignored
        assert!(state.handle(event(serde_json::json!({"type": "ping"}))).is_empty());
        assert!(state
            .handle(event(serde_json::json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "signature_delta", "signature": "abc"}
            })))
            .is_empty());

        assert_eq!(
            state.handle(event(serde_json::json!({"type": "message_stop"}))),
            vec![StreamChunk::Done]
        );
    }

    #[test]
    fn test_error_event() {
        let mut state = StreamState::default();
        let chunks = state.handle(event(serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })));
        assert!(matches!(&chunks[..], [StreamChunk::Error { error }] if error.contains("Overloaded")));
    }

    #[tokio::test]
    async fn test_build_request_hoists_system_and_enables_thinking() {
        let mut request = AdapterRequest::new("claude-sonnet-4", "https://api.anthropic.com", "k")
            .with_messages(vec![
                ChatMessage::system("rule one"),
                ChatMessage::system("rule two"),
                ChatMessage::user("hi"),
            ])
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
        request.temperature = Some(0.3);
        request.max_tokens = Some(1024);

        let body = serde_json::to_value(build_request(&Client::new(), &request, true).await.unwrap()).unwrap();
        assert_eq!(body["system"], "rule one\n\nrule two");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["thinking"], serde_json::json!({"type": "enabled", "budget_tokens": 2048}));
        assert!(body["max_tokens"].as_u64().unwrap() > 2048);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["tools"][0]["name"], "web_search");
        assert_eq!(body["tools"][0]["input_schema"]["required"], serde_json::json!(["query"]));
    }

    #[tokio::test]
    async fn test_build_request_omits_empty_tools() {
        let request = AdapterRequest::new("claude-sonnet-4", "https://api.anthropic.com", "k")
            .with_messages(vec![ChatMessage::user("hi")])
            .with_tools(vec![]);

        let body = serde_json::to_value(build_request(&Client::new(), &request, false).await.unwrap()).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("thinking").is_none());
    }

    #[tokio::test]
    async fn test_media_blocks() {
        let client = Client::new();
        let image = ContentItem::media(ContentKind::Image, "data:image/png;base64,iVBO");
        match transform_item(&client, &image).await.unwrap() {
            Some(AnthropicBlock::Image { source }) => {
                assert_eq!(source.media_type, "image/png");
                assert_eq!(source.data, "iVBO");
            }
            other => panic!("unexpected block {:?}", other),
        }

        let pdf = ContentItem::media(ContentKind::File, "data:application/pdf;base64,JVBERi0=");
        assert!(matches!(
            transform_item(&client, &pdf).await.unwrap(),
            Some(AnthropicBlock::Document { .. })
        ));

        let notes = ContentItem::media(
            ContentKind::File,
            media::to_data_url("text/markdown", &media::encode_base64(b"# notes")),
        )
        .with_file_name("notes.md");
        match transform_item(&client, &notes).await.unwrap() {
            Some(AnthropicBlock::Text { text }) => assert_eq!(text, "[notes.md]\n# notes"),
            other => panic!("unexpected block {:?}", other),
        }

        let audio = ContentItem::media(ContentKind::Audio, "data:audio/wav;base64,UklG");
        assert!(matches!(
            transform_item(&client, &audio).await,
            Err(ProviderError::UnsupportedContent(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_remote_image_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/missing.png").with_status(404).create_async().await;

        let item = ContentItem::media(ContentKind::Image, format!("{}/missing.png", server.url()));
        assert!(matches!(
            transform_item(&Client::new(), &item).await,
            Err(ProviderError::UnsupportedContent(_))
        ));
    }

    #[test]
    fn test_transform_response() {
        let response: MessagesResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "plan", "signature": "x"},
                {"type": "text", "text": "answer"},
                {"type": "tool_use", "id": "toolu_2", "name": "current_time", "input": {}}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }))
        .unwrap();

        let adapted = transform_response(response);
        assert_eq!(adapted.content, "answer");
        assert_eq!(adapted.thinking.as_deref(), Some("plan"));
        assert_eq!(adapted.tool_calls.unwrap()[0].name, "current_time");
        assert_eq!(adapted.usage.unwrap().input_tokens, 10);
    }
}
