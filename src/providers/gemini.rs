use super::dispatch::{detect_model_type, ModelType};
use super::streaming::{bridge_result, fuse_terminal, SseStream};
use super::{error::ProviderError, send_checked, ChunkStream, ProviderAdapter};
use crate::models::media;
use crate::models::{
    content_to_text, has_audio_attachment, latest_user_message, AdapterRequest, AdapterResponse, ChatMessage,
    ContentItem, ContentKind, MessageContent, Role, StreamChunk, ToolCall, ToolDefinition, Usage,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

const NAME: &str = "gemini";
const TTS_VOICE: &str = "Kore";
const MISSING_TTS_TEXT: &str = "Please provide some text to convert to speech.";
const MISSING_AUDIO: &str = "Please attach an audio file to transcribe.";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<FileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    file_uri: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    include_thoughts: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<GeminiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    #[serde(default)]
    message: String,
}

/// Audio parts held back until the upstream finishes
#[derive(Debug, Default)]
struct AudioBuffer {
    pcm: Vec<u8>,
    sample_rate: Option<u32>,
    encoded: Vec<(String, String)>,
}

impl AudioBuffer {
    fn push(&mut self, inline: InlineData) -> Result<(), ProviderError> {
        if media::is_pcm_mime(&inline.mime_type) {
            self.pcm.extend(media::decode_base64(&inline.data)?);
            self.sample_rate.get_or_insert(media::pcm_sample_rate(&inline.mime_type));
        } else {
            self.encoded.push((inline.mime_type, inline.data));
        }
        Ok(())
    }

    fn drain(&mut self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        if !self.pcm.is_empty() {
            let rate = self.sample_rate.unwrap_or(media::DEFAULT_PCM_SAMPLE_RATE);
            let wav = media::pcm_to_wav(&self.pcm, rate);
            chunks.push(StreamChunk::Audio {
                content: media::to_data_url("audio/wav", &media::encode_base64(&wav)),
                mime_type: "audio/wav".to_string(),
            });
            self.pcm.clear();
        }
        for (mime_type, data) in self.encoded.drain(..) {
            chunks.push(StreamChunk::Audio {
                content: media::to_data_url(&mime_type, &data),
                mime_type,
            });
        }
        chunks
    }
}

/// Turns response payloads into chunks, holding audio until `finish`
#[derive(Debug, Default)]
struct ResponseTranslator {
    audio: AudioBuffer,
    usage: Option<Usage>,
}

impl ResponseTranslator {
    fn translate(&mut self, response: GenerateContentResponse) -> Vec<StreamChunk> {
        if let Some(error) = response.error {
            return vec![StreamChunk::error(format!("{} error: {}", NAME, error.message))];
        }
        if let Some(usage) = response.usage_metadata {
            self.usage = Some(Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            });
        }

        let Some(content) = response.candidates.into_iter().next().and_then(|c| c.content) else {
            if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
                return vec![StreamChunk::error(format!("{} blocked the prompt: {}", NAME, reason))];
            }
            return vec![];
        };

        let mut chunks = Vec::new();
        for part in content.parts {
            if let Some(text) = part.text {
                if text.is_empty() {
                    continue;
                }
                if part.thought == Some(true) {
                    chunks.push(StreamChunk::thinking(text));
                } else {
                    chunks.push(StreamChunk::text(text));
                }
            } else if let Some(call) = part.function_call {
                let arguments = if call.args.is_object() { call.args } else { serde_json::json!({}) };
                let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                chunks.push(StreamChunk::ToolCall {
                    tool_call: ToolCall::pending(id, call.name, arguments),
                });
            } else if let Some(inline) = part.inline_data {
                if inline.mime_type.starts_with("image/") {
                    chunks.push(StreamChunk::Image {
                        image_url: media::to_data_url(&inline.mime_type, &inline.data),
                        mime_type: Some(inline.mime_type),
                    });
                } else if inline.mime_type.starts_with("audio/") {
                    if let Err(e) = self.audio.push(inline) {
                        tracing::debug!("Skipping undecodable {} audio part: {}", NAME, e);
                    }
                }
            }
        }
        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        self.audio.drain()
    }
}

/// Keep the audio chunks of a speech response, with whatever MIME type they carry
fn speech_chunks(chunks: Vec<StreamChunk>) -> Result<Vec<StreamChunk>, ProviderError> {
    let mut audio = Vec::new();
    for chunk in chunks {
        match chunk {
            StreamChunk::Error { error } => return Err(ProviderError::UpstreamFailure(error)),
            chunk @ StreamChunk::Audio { .. } => audio.push(chunk),
            _ => {}
        }
    }
    if audio.is_empty() {
        return Err(ProviderError::UpstreamFailure(format!(
            "{} speech response contained no audio",
            NAME
        )));
    }
    Ok(audio)
}

/// Collapse translated chunks into a single response
fn fold_chunks(chunks: Vec<StreamChunk>, usage: Option<Usage>) -> Result<AdapterResponse, ProviderError> {
    let mut response = AdapterResponse {
        usage,
        ..Default::default()
    };
    for chunk in chunks {
        if let Some(error) = response.absorb(chunk) {
            return Err(ProviderError::UpstreamFailure(error));
        }
    }
    Ok(response)
}

fn media_part(item: &ContentItem) -> Option<GeminiPart> {
    let url = item.url.as_deref()?;
    if media::is_data_url(url) {
        match media::parse_data_url(url) {
            Ok(data_url) => Some(GeminiPart {
                inline_data: Some(InlineData {
                    mime_type: data_url.mime_type,
                    data: data_url.data,
                }),
                ..Default::default()
            }),
            Err(e) => {
                tracing::warn!("Skipping {:?} item with bad data URL: {}", item.kind, e);
                None
            }
        }
    } else {
        Some(GeminiPart {
            file_data: Some(FileData {
                mime_type: item.mime_type.clone(),
                file_uri: url.to_string(),
            }),
            ..Default::default()
        })
    }
}

fn transform_message(message: &ChatMessage) -> GeminiContent {
    let parts = match &message.content {
        MessageContent::Text(text) => vec![GeminiPart::text(text.clone())],
        MessageContent::Items(items) => items
            .iter()
            .filter_map(|item| match item.kind {
                ContentKind::Text => item.text.clone().map(GeminiPart::text),
                _ => media_part(item),
            })
            .collect(),
    };

    GeminiContent {
        role: Some(match message.role {
            Role::Assistant => "model".to_string(),
            _ => "user".to_string(),
        }),
        parts,
    }
}

fn transform_tools(tools: &[ToolDefinition]) -> Vec<GeminiTool> {
    vec![GeminiTool {
        function_declarations: tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.id.clone(),
                description: tool.description.clone(),
                parameters: tool.json_schema(),
            })
            .collect(),
    }]
}

fn build_request(request: &AdapterRequest, model_type: ModelType) -> GenerateContentRequest {
    let system_text = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| content_to_text(&m.content))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(transform_message)
        .collect();

    let generation_config = GenerationConfig {
        temperature: request.temperature,
        max_output_tokens: request.max_tokens,
        thinking_config: request.reasoning.then_some(ThinkingConfig { include_thoughts: true }),
        response_modalities: match model_type {
            ModelType::Image => Some(vec!["TEXT", "IMAGE"]),
            // Native audio models answer spoken input with text plus speech
            ModelType::Asr | ModelType::Stt => Some(vec!["TEXT", "AUDIO"]),
            _ => None,
        },
        speech_config: None,
    };

    GenerateContentRequest {
        contents,
        system_instruction: (!system_text.is_empty()).then(|| GeminiContent {
            role: None,
            parts: vec![GeminiPart::text(system_text)],
        }),
        tools: request.active_tools().map(transform_tools),
        generation_config: Some(generation_config),
    }
}

fn build_tts_request(text: String) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![GeminiContent {
            role: Some("user".to_string()),
            parts: vec![GeminiPart::text(text)],
        }],
        system_instruction: None,
        tools: None,
        generation_config: Some(GenerationConfig {
            response_modalities: Some(vec!["AUDIO"]),
            speech_config: Some(SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig { voice_name: TTS_VOICE },
                },
            }),
            ..Default::default()
        }),
    }
}

/// What a request resolves to once capabilities are applied
enum Plan {
    Generate(GenerateContentRequest),
    Speech(GenerateContentRequest),
    Placeholder(&'static str),
}

fn plan(request: &AdapterRequest) -> Plan {
    let model_type = detect_model_type(&request.capabilities());
    let latest = latest_user_message(&request.messages);
    tracing::debug!("{} dispatch for {}: {}", NAME, request.model, model_type);

    match model_type {
        ModelType::Tts => {
            let text = latest.map(|m| content_to_text(&m.content)).unwrap_or_default();
            if text.trim().is_empty() {
                Plan::Placeholder(MISSING_TTS_TEXT)
            } else {
                Plan::Speech(build_tts_request(text))
            }
        }
        ModelType::Asr | ModelType::Stt if !latest.is_some_and(has_audio_attachment) => {
            Plan::Placeholder(MISSING_AUDIO)
        }
        other => Plan::Generate(build_request(request, other)),
    }
}

fn endpoint(request: &AdapterRequest, method: &str, sse: bool) -> Result<Url, ProviderError> {
    let model = request.model.trim_start_matches("models/");
    let mut url = Url::parse(&format!("{}/models/{}:{}", request.base(), model, method))
        .map_err(|e| ProviderError::ConfigError(format!("Invalid {} base URL '{}': {}", NAME, request.base_url, e)))?;
    if sse {
        url.query_pairs_mut().append_pair("alt", "sse");
    }
    Ok(url)
}

/// Google Gemini adapter
pub struct GeminiAdapter {
    client: Client,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn generate(
        client: &Client,
        request: &AdapterRequest,
        body: &GenerateContentRequest,
    ) -> Result<(Vec<StreamChunk>, Option<Usage>), ProviderError> {
        let url = endpoint(request, "generateContent", false)?;
        tracing::debug!("{} generateContent: {}", NAME, url);
        let response = send_checked(
            client.post(url).header("x-goog-api-key", request.api_key()).json(body),
            NAME,
        )
        .await?;

        let response_text = response.text().await?;
        tracing::debug!("{} provider response body: {}", NAME, response_text);
        let parsed: GenerateContentResponse = serde_json::from_str(&response_text).map_err(|e| {
            tracing::error!("Failed to parse {} response: {}", NAME, e);
            e
        })?;

        let mut translator = ResponseTranslator::default();
        let mut chunks = translator.translate(parsed);
        chunks.extend(translator.finish());
        Ok((chunks, translator.usage))
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn chat(&self, request: AdapterRequest) -> Result<AdapterResponse, ProviderError> {
        match plan(&request) {
            Plan::Placeholder(text) => Ok(AdapterResponse::text(text)),
            Plan::Speech(body) | Plan::Generate(body) => {
                let (chunks, usage) = Self::generate(&self.client, &request, &body).await?;
                fold_chunks(chunks, usage)
            }
        }
    }

    fn chat_stream(&self, request: AdapterRequest) -> ChunkStream {
        let client = self.client.clone();

        let body = match plan(&request) {
            Plan::Placeholder(text) => {
                return bridge_result(async move { Ok(vec![StreamChunk::text(text)]) });
            }
            Plan::Speech(body) => {
                return bridge_result(async move {
                    let (chunks, _) = Self::generate(&client, &request, &body).await?;
                    speech_chunks(chunks)
                });
            }
            Plan::Generate(body) => body,
        };

        fuse_terminal(async_stream::stream! {
            let url = match endpoint(&request, "streamGenerateContent", true) {
                Ok(url) => url,
                Err(e) => {
                    yield e.into_chunk();
                    return;
                }
            };
            tracing::debug!("{} streamGenerateContent: {}", NAME, url);

            let builder = client
                .post(url)
                .header("x-goog-api-key", request.api_key())
                .json(&body);
            let response = match send_checked(builder, NAME).await {
                Ok(response) => response,
                Err(e) => {
                    yield e.into_chunk();
                    return;
                }
            };

            let mut events = SseStream::new(response.bytes_stream());
            let mut translator = ResponseTranslator::default();

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!("{} stream error: {}", NAME, e);
                        yield ProviderError::HttpError(e).into_chunk();
                        return;
                    }
                };

                let parsed: GenerateContentResponse = match serde_json::from_str(&event.data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::debug!("Skipping malformed {} chunk: {} - Data: {}", NAME, e, event.data);
                        continue;
                    }
                };

                for chunk in translator.translate(parsed) {
                    yield chunk;
                }
            }

            // Audio goes last, after every text chunk
            for chunk in translator.finish() {
                yield chunk;
            }
            yield StreamChunk::Done;
        })
    }
}
