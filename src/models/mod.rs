pub mod media;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Kind of a single content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    File,
    Audio,
    Video,
}

/// One typed unit of a message body.
///
/// `url` holds either a remote URL or a `data:` URI. Non-text items are
/// resolved to bytes by the adapter that needs them inline.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: Some(text.into()),
            url: None,
            file_name: None,
            mime_type: None,
        }
    }

    pub fn media(kind: ContentKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            text: None,
            url: Some(url.into()),
            file_name: None,
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// Message content can be a plain string or an array of content items
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Items(Vec<ContentItem>),
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

/// Message in the conversation
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    /// Iterate over the structured items, treating a plain string as no items
    pub fn items(&self) -> &[ContentItem] {
        match &self.content {
            MessageContent::Text(_) => &[],
            MessageContent::Items(items) => items,
        }
    }
}

/// Flatten content to plain text.
///
/// Text items are joined with a newline; other kinds are ignored.
pub fn content_to_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Items(items) => items
            .iter()
            .filter(|item| item.kind == ContentKind::Text)
            .filter_map(|item| item.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// URLs of all image items in the content
pub fn extract_images(content: &MessageContent) -> Vec<String> {
    match content {
        MessageContent::Text(_) => Vec::new(),
        MessageContent::Items(items) => items
            .iter()
            .filter(|item| item.kind == ContentKind::Image)
            .filter_map(|item| item.url.clone())
            .collect(),
    }
}

pub fn latest_user_message(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages.iter().rev().find(|m| m.role == Role::User)
}

pub fn has_audio_attachment(message: &ChatMessage) -> bool {
    message
        .items()
        .iter()
        .any(|item| item.kind == ContentKind::Audio && item.url.is_some())
}

/// First audio attachment in a message, if any
pub fn find_audio(message: &ChatMessage) -> Option<&ContentItem> {
    message
        .items()
        .iter()
        .find(|item| item.kind == ContentKind::Audio && item.url.is_some())
}

/// First image attachment in a message, if any
pub fn find_image(message: &ChatMessage) -> Option<&ContentItem> {
    message
        .items()
        .iter()
        .find(|item| item.kind == ContentKind::Image && item.url.is_some())
}

/// Declared tool parameter
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

/// Tool the model may call
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default)]
    pub builtin: bool,
}

impl ToolDefinition {
    /// JSON-Schema object describing the parameters
    pub fn json_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        for param in &self.parameters {
            let mut prop = serde_json::json!({
                "type": param.param_type,
                "description": param.description,
            });
            if let Some(values) = &param.enum_values {
                prop["enum"] = serde_json::json!(values);
            }
            properties.insert(param.name.clone(), prop);
        }

        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// Tool invocation requested by a model
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCall {
    pub fn pending(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            result: None,
            status: ToolStatus::Pending,
            error: None,
        }
    }
}

/// Declared model capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelCapabilities {
    #[serde(alias = "function_call")]
    pub function_call: bool,
    pub vision: bool,
    pub file: bool,
    pub reasoning: bool,
    #[serde(alias = "image_output")]
    pub image_output: bool,
    pub search: bool,
    pub tts: bool,
    pub asr: bool,
    pub stt: bool,
}

/// Request handed to a provider adapter
#[derive(Clone)]
pub struct AdapterRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub base_url: String,
    pub api_key: SecretString,
    pub reasoning: bool,
    pub tools: Option<Vec<ToolDefinition>>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub capabilities: Option<ModelCapabilities>,
}

impl AdapterRequest {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            model: model.into(),
            base_url: base_url.into(),
            api_key: SecretString::new(api_key.into()),
            reasoning: false,
            tools: None,
            temperature: None,
            max_tokens: None,
            capabilities: None,
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Tools to advertise, `None` when the list is absent or empty
    pub fn active_tools(&self) -> Option<&[ToolDefinition]> {
        self.tools.as_deref().filter(|tools| !tools.is_empty())
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        self.capabilities.unwrap_or_default()
    }

    /// Base URL without a trailing slash
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

impl std::fmt::Debug for AdapterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRequest")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("messages", &self.messages.len())
            .field("reasoning", &self.reasoning)
            .field("tools", &self.tools.as_ref().map(|t| t.len()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Result of a single-shot adapter call
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl AdapterResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Fold one stream chunk into the response.
    ///
    /// Returns the message of an error chunk; other chunks return `None`.
    pub fn absorb(&mut self, chunk: StreamChunk) -> Option<String> {
        match chunk {
            StreamChunk::Text { content } => self.content.push_str(&content),
            StreamChunk::Thinking { content } => self.thinking.get_or_insert_with(String::new).push_str(&content),
            StreamChunk::ToolCall { tool_call } => self.tool_calls.get_or_insert_with(Vec::new).push(tool_call),
            StreamChunk::Image { image_url, .. } => self.images.get_or_insert_with(Vec::new).push(image_url),
            StreamChunk::Audio { content, .. } => {
                self.audio.get_or_insert(content);
            }
            StreamChunk::Error { error } => return Some(error),
            StreamChunk::ToolResult { .. } | StreamChunk::Done => {}
        }
        None
    }
}

/// One event of the internal streaming protocol
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },
    ToolResult {
        #[serde(rename = "toolId")]
        tool_id: String,
        result: serde_json::Value,
    },
    Image {
        #[serde(rename = "imageUrl")]
        image_url: String,
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Audio {
        content: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Error {
        error: String,
    },
    Done,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        StreamChunk::Text {
            content: content.into(),
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        StreamChunk::Thinking {
            content: content.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        StreamChunk::Error { error: error.into() }
    }

    /// `error` and `done` end a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Error { .. } | StreamChunk::Done)
    }
}
