//! Cloudflare Workers AI.
//!
//! Chat goes through the OpenAI-compatible endpoint. Speech, transcription
//! and image models are called through `/run/{model}`, which wraps JSON
//! results in a `{success, result, errors}` envelope and returns some
//! media as raw bytes.

use super::dispatch::{detect_model_type, ModelType};
use super::streaming::bridge_result;
use super::{error::ProviderError, inline_media, openai, send_checked, ChunkStream, ProviderAdapter};
use crate::models::media;
use crate::models::{
    content_to_text, find_audio, find_image, latest_user_message, AdapterRequest, AdapterResponse, StreamChunk,
};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;

const NAME: &str = "cloudflare";
const MISSING_TTS_TEXT: &str = "Please provide some text to convert to speech.";
const MISSING_AUDIO: &str = "Please attach an audio file to transcribe.";
const MISSING_IMAGE_PROMPT: &str = "Please describe the image you want to generate.";

/// `{success, result, errors}` wrapper used by `/run`
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    errors: Vec<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

impl Envelope {
    fn into_result(self) -> Result<serde_json::Value, ProviderError> {
        if !self.success {
            let message = if self.errors.is_empty() {
                "request was not successful".to_string()
            } else {
                self.errors
                    .iter()
                    .map(|e| match e.code {
                        Some(code) => format!("{} ({})", e.message, code),
                        None => e.message.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            return Err(ProviderError::UpstreamFailure(format!("{}: {}", NAME, message)));
        }
        Ok(self.result.unwrap_or(serde_json::Value::Null))
    }
}

/// Body of a `/run` response
#[derive(Debug)]
enum RunBody {
    Json(serde_json::Value),
    Binary { content_type: Option<String>, bytes: Vec<u8> },
}

#[derive(Debug, Default, Deserialize)]
struct TranscriptionResult {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<Segment>,
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    start: f64,
    end: f64,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Word {
    word: String,
    start: f64,
    end: f64,
}

/// Normalized result of a non-chat operation
#[derive(Debug, Clone, PartialEq)]
enum RunOutput {
    Audio { data_url: String, mime_type: String },
    Images(Vec<String>),
    Text(String),
}

impl RunOutput {
    fn into_chunks(self) -> Vec<StreamChunk> {
        match self {
            RunOutput::Audio { data_url, mime_type } => vec![StreamChunk::Audio {
                content: data_url,
                mime_type,
            }],
            RunOutput::Images(urls) => urls
                .into_iter()
                .map(|url| {
                    let mime_type = media::parse_data_url(&url).ok().map(|d| d.mime_type);
                    StreamChunk::Image {
                        image_url: url,
                        mime_type,
                    }
                })
                .collect(),
            RunOutput::Text(text) => vec![StreamChunk::text(text)],
        }
    }

    fn into_response(self) -> AdapterResponse {
        match self {
            RunOutput::Audio { data_url, .. } => AdapterResponse {
                audio: Some(data_url),
                ..Default::default()
            },
            RunOutput::Images(urls) => AdapterResponse {
                images: Some(urls),
                ..Default::default()
            },
            RunOutput::Text(text) => AdapterResponse::text(text),
        }
    }
}

fn timestamp(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let minutes = (seconds / 60.0).floor();
    format!("{:02}:{:05.2}", minutes as u64, seconds - minutes * 60.0)
}

/// Render a transcription, with per-segment timestamps when available
fn format_transcript(result: &TranscriptionResult) -> String {
    let lines: Vec<(f64, f64, String)> = if !result.segments.is_empty() {
        result
            .segments
            .iter()
            .map(|s| (s.start, s.end, s.text.trim().to_string()))
            .collect()
    } else {
        result
            .words
            .iter()
            .map(|w| (w.start, w.end, w.word.trim().to_string()))
            .collect()
    };

    let (Some(first), Some(last)) = (lines.first(), lines.last()) else {
        return result.text.trim().to_string();
    };

    let full_text = if result.text.trim().is_empty() {
        lines.iter().map(|(_, _, t)| t.as_str()).collect::<Vec<_>>().join(" ")
    } else {
        result.text.trim().to_string()
    };

    let mut output = format!("[{} - {}] {}\n", timestamp(first.0), timestamp(last.1), full_text);
    for (start, end, text) in &lines {
        output.push('\n');
        output.push_str(&format!("[{} - {}] {}", timestamp(*start), timestamp(*end), text));
    }
    output
}

fn binary_data_url(content_type: Option<&str>, bytes: &[u8], prefix: &str, sniff: fn(&[u8]) -> &'static str) -> (String, String) {
    let mime_type = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
        .filter(|ct| ct.starts_with(prefix))
        .map(str::to_string)
        .unwrap_or_else(|| sniff(bytes).to_string());
    let data_url = media::to_data_url(&mime_type, &media::encode_base64(bytes));
    (data_url, mime_type)
}

/// Decode a base64 field of a JSON result into a data URL
fn json_media(result: &serde_json::Value, field: &str, sniff: fn(&[u8]) -> &'static str) -> Result<(String, String), ProviderError> {
    let encoded = result.get(field).and_then(|v| v.as_str()).ok_or_else(|| {
        ProviderError::UpstreamFailure(format!("{} result has no '{}' field", NAME, field))
    })?;
    let bytes = media::decode_base64(encoded)?;
    let mime_type = sniff(&bytes).to_string();
    Ok((media::to_data_url(&mime_type, encoded.trim()), mime_type))
}

async fn read_run_response(response: Response) -> Result<RunBody, ProviderError> {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if content_type.as_deref().map_or(true, |ct| ct.starts_with("application/json")) {
        let text = response.text().await?;
        tracing::debug!("{} run response body: {}", NAME, text);
        let envelope: Envelope = serde_json::from_str(&text)?;
        return Ok(RunBody::Json(envelope.into_result()?));
    }

    let bytes = response.bytes().await?;
    tracing::debug!("{} run returned {} bytes of {:?}", NAME, bytes.len(), content_type);
    Ok(RunBody::Binary {
        content_type,
        bytes: bytes.to_vec(),
    })
}

/// Cloudflare Workers AI adapter
pub struct CloudflareAdapter {
    client: Client,
}

impl CloudflareAdapter {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn chat_url(request: &AdapterRequest) -> String {
        format!("{}/v1/chat/completions", request.base())
    }

    fn run_url(request: &AdapterRequest) -> String {
        format!("{}/run/{}", request.base(), request.model)
    }

    async fn run_json(client: &Client, request: &AdapterRequest, body: serde_json::Value) -> Result<RunBody, ProviderError> {
        let url = Self::run_url(request);
        tracing::debug!("{} run: {}", NAME, url);
        let response = send_checked(client.post(&url).bearer_auth(request.api_key()).json(&body), NAME).await?;
        read_run_response(response).await
    }

    async fn run_multipart(client: &Client, request: &AdapterRequest, form: Form) -> Result<RunBody, ProviderError> {
        let url = Self::run_url(request);
        tracing::debug!("{} run (multipart): {}", NAME, url);
        let response = send_checked(client.post(&url).bearer_auth(request.api_key()).multipart(form), NAME).await?;
        read_run_response(response).await
    }

    async fn text_to_speech(client: &Client, request: &AdapterRequest) -> Result<RunOutput, ProviderError> {
        let text = latest_user_message(&request.messages)
            .map(|m| content_to_text(&m.content))
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(RunOutput::Text(MISSING_TTS_TEXT.to_string()));
        }

        let (data_url, mime_type) = match Self::run_json(client, request, serde_json::json!({ "prompt": text })).await? {
            RunBody::Binary { content_type, bytes } => {
                binary_data_url(content_type.as_deref(), &bytes, "audio/", media::sniff_audio_mime)
            }
            RunBody::Json(result) => json_media(&result, "audio", media::sniff_audio_mime)?,
        };
        Ok(RunOutput::Audio { data_url, mime_type })
    }

    async fn transcribe(client: &Client, request: &AdapterRequest) -> Result<RunOutput, ProviderError> {
        let Some(audio) = latest_user_message(&request.messages).and_then(find_audio) else {
            return Ok(RunOutput::Text(MISSING_AUDIO.to_string()));
        };

        let audio = inline_media(client, audio).await?;
        let result = match Self::run_json(client, request, serde_json::json!({ "audio": audio.data })).await? {
            RunBody::Json(result) => result,
            RunBody::Binary { content_type, .. } => {
                return Err(ProviderError::UpstreamFailure(format!(
                    "{} transcription returned unexpected {:?} body",
                    NAME, content_type
                )))
            }
        };

        let transcription: TranscriptionResult = serde_json::from_value(result)?;
        Ok(RunOutput::Text(format_transcript(&transcription)))
    }

    async fn generate_image(client: &Client, request: &AdapterRequest) -> Result<RunOutput, ProviderError> {
        let latest = latest_user_message(&request.messages);
        let prompt = latest.map(|m| content_to_text(&m.content)).unwrap_or_default();
        if prompt.trim().is_empty() {
            return Ok(RunOutput::Text(MISSING_IMAGE_PROMPT.to_string()));
        }

        let body = match latest.and_then(find_image) {
            Some(image) => {
                let source = inline_media(client, image).await?;
                let bytes = source.decode()?;
                let part = Part::bytes(bytes).file_name("image").mime_str(&source.mime_type)?;
                let form = Form::new().text("prompt", prompt).part("image", part);
                Self::run_multipart(client, request, form).await?
            }
            None => Self::run_json(client, request, serde_json::json!({ "prompt": prompt })).await?,
        };

        let (data_url, _) = match body {
            RunBody::Binary { content_type, bytes } => {
                binary_data_url(content_type.as_deref(), &bytes, "image/", media::sniff_image_mime)
            }
            RunBody::Json(result) => json_media(&result, "image", media::sniff_image_mime)?,
        };
        Ok(RunOutput::Images(vec![data_url]))
    }

    async fn run(client: &Client, model_type: ModelType, request: &AdapterRequest) -> Result<RunOutput, ProviderError> {
        tracing::debug!("{} dispatch for {}: {}", NAME, request.model, model_type);
        match model_type {
            ModelType::Tts => Self::text_to_speech(client, request).await,
            ModelType::Asr | ModelType::Stt => Self::transcribe(client, request).await,
            ModelType::Image => Self::generate_image(client, request).await,
            ModelType::Chat => Err(ProviderError::ConfigError(format!("{} chat models are not run through /run", NAME))),
        }
    }
}

impl Default for CloudflareAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for CloudflareAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn chat(&self, request: AdapterRequest) -> Result<AdapterResponse, ProviderError> {
        match detect_model_type(&request.capabilities()) {
            ModelType::Chat => {
                let body = openai::build_request(&request, false);
                openai::complete(&self.client, &Self::chat_url(&request), request.api_key(), &body, NAME).await
            }
            other => Ok(Self::run(&self.client, other, &request).await?.into_response()),
        }
    }

    fn chat_stream(&self, request: AdapterRequest) -> ChunkStream {
        let client = self.client.clone();

        match detect_model_type(&request.capabilities()) {
            ModelType::Chat => {
                let body = openai::build_request(&request, true);
                openai::stream_completion(
                    client,
                    Self::chat_url(&request),
                    request.api_key().to_string(),
                    body,
                    NAME,
                )
            }
            other => bridge_result(async move {
                Ok(Self::run(&client, other, &request).await?.into_chunks())
            }),
        }
    }
}
