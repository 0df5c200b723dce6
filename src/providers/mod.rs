pub mod anthropic;
pub mod cloudflare;
pub mod dispatch;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod streaming;

use crate::models::media::{self, DataUrl};
use crate::models::{AdapterRequest, AdapterResponse, ContentItem, ContentKind, ModelCapabilities, StreamChunk};
use async_trait::async_trait;
use error::ProviderError;
use futures::stream::Stream;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::pin::Pin;

/// Lazy sequence of normalized stream events
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Main adapter trait - one implementation per vendor family
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short vendor name used in logs and error messages
    fn name(&self) -> &'static str;

    /// Single-shot completion
    async fn chat(&self, request: AdapterRequest) -> Result<AdapterResponse, ProviderError>;

    /// Streaming completion.
    ///
    /// Nothing is sent until the stream is first polled. The stream ends
    /// after exactly one `done` chunk, or after an `error` chunk.
    fn chat_stream(&self, request: AdapterRequest) -> ChunkStream;
}

/// Send a request and turn a non-2xx status into `ApiError`
pub(crate) async fn send_checked(builder: RequestBuilder, name: &str) -> Result<Response, ProviderError> {
    let response = builder.send().await?;
    ensure_success(response, name).await
}

pub(crate) async fn ensure_success(response: Response, name: &str) -> Result<Response, ProviderError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        tracing::warn!("{} API returned {}: {}", name, status, error_text);
        return Err(ProviderError::ApiError {
            status,
            message: format!("{} API error: {}", name, error_text),
        });
    }
    Ok(response)
}

/// Resolve a non-text content item to `(mime type, base64 payload)`.
///
/// `data:` URIs are decoded locally; remote URLs are fetched.
pub(crate) async fn inline_media(client: &Client, item: &ContentItem) -> Result<DataUrl, ProviderError> {
    let url = item.url.as_deref().ok_or_else(|| {
        ProviderError::UnsupportedContent(format!("{:?} item has no url", item.kind))
    })?;

    if media::is_data_url(url) {
        let mut data_url = media::parse_data_url(url)?;
        if data_url.mime_type == "application/octet-stream" {
            if let Some(mime) = &item.mime_type {
                data_url.mime_type = mime.clone();
            }
        }
        return Ok(data_url);
    }

    tracing::debug!("Fetching remote media: {}", url);
    let response = send_checked(client.get(url), "media").await?;
    let header_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty() && v != "application/octet-stream");
    let bytes = response.bytes().await?;

    let mime_type = header_mime
        .or_else(|| item.mime_type.clone())
        .unwrap_or_else(|| match item.kind {
            ContentKind::Image => media::sniff_image_mime(&bytes).to_string(),
            ContentKind::Audio => media::sniff_audio_mime(&bytes).to_string(),
            _ => "application/octet-stream".to_string(),
        });

    Ok(DataUrl {
        mime_type,
        data: media::encode_base64(&bytes),
    })
}

/// Serialize a secret without exposing it
pub(crate) fn serialize_redacted<S>(_secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str("[REDACTED]")
}

pub(crate) fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(SecretString::new(s))
}

pub(crate) fn serialize_redacted_opt<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match secret {
        Some(secret) => serialize_redacted(secret, serializer),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_secret_opt<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.map(SecretString::new))
}

/// Model entry under a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
}

impl ModelConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Provider configuration from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider id used by clients, e.g. "openai" or "my-deepseek"
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Adapter family; defaults to `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    /// API key, or `env:VAR` to read it from the environment
    #[serde(serialize_with = "serialize_redacted", deserialize_with = "deserialize_secret")]
    pub api_key: SecretString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl ProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn provider_type(&self) -> &str {
        self.provider_type.as_deref().unwrap_or(&self.id)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// Resolve the API key, following an `env:` indirection
    pub fn resolve_api_key(&self) -> Result<String, ProviderError> {
        let raw = self.api_key.expose_secret();
        match raw.strip_prefix("env:") {
            Some(var) => std::env::var(var).map_err(|_| {
                ProviderError::ConfigError(format!(
                    "Provider '{}' reads its api_key from ${}, which is not set",
                    self.id, var
                ))
            }),
            None => Ok(raw.clone()),
        }
    }
}

// Re-export adapter implementations
pub use anthropic::AnthropicAdapter;
pub use cloudflare::CloudflareAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAIAdapter;
pub use registry::ProviderRegistry;

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(api_key: &str) -> ProviderConfig {
        ProviderConfig {
            id: "deepseek".to_string(),
            name: None,
            provider_type: Some("openai".to_string()),
            api_key: SecretString::new(api_key.to_string()),
            base_url: None,
            models: vec![],
            enabled: None,
        }
    }

    #[test]
    fn test_resolve_api_key_literal_and_env() {
        assert_eq!(provider("sk-1").resolve_api_key().unwrap(), "sk-1");

        std::env::set_var("CHATMUX_TEST_PROVIDER_KEY", "sk-env");
        assert_eq!(provider("env:CHATMUX_TEST_PROVIDER_KEY").resolve_api_key().unwrap(), "sk-env");

        let err = provider("env:CHATMUX_TEST_UNSET_KEY").resolve_api_key().unwrap_err();
        assert!(matches!(err, ProviderError::ConfigError(_)));
    }

    #[test]
    fn test_provider_config_defaults_and_redaction() {
        let config = provider("sk-secret");
        assert!(config.is_enabled());
        assert_eq!(config.provider_type(), "openai");
        assert_eq!(config.display_name(), "deepseek");

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(json.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_inline_media_data_url() {
        let client = Client::new();
        let item = ContentItem::media(ContentKind::Image, "data:image/png;base64,iVBORw0K");
        let resolved = inline_media(&client, &item).await.unwrap();
        assert_eq!(resolved.mime_type, "image/png");
        assert_eq!(resolved.data, "iVBORw0K");
    }

    #[tokio::test]
    async fn test_inline_media_remote_fetch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/cat.jpg")
            .with_header("content-type", "image/jpeg")
            .with_body([0xFF, 0xD8, 0xFF, 0xE0])
            .create_async()
            .await;

        let client = Client::new();
        let item = ContentItem::media(ContentKind::Image, format!("{}/cat.jpg", server.url()));
        let resolved = inline_media(&client, &item).await.unwrap();

        mock.assert_async().await;
        assert_eq!(resolved.mime_type, "image/jpeg");
        assert_eq!(resolved.data, media::encode_base64(&[0xFF, 0xD8, 0xFF, 0xE0]));
    }

    #[tokio::test]
    async fn test_inline_media_missing_url() {
        let client = Client::new();
        let item = ContentItem {
            kind: ContentKind::File,
            text: None,
            url: None,
            file_name: None,
            mime_type: None,
        };
        assert!(matches!(
            inline_media(&client, &item).await,
            Err(ProviderError::UnsupportedContent(_))
        ));
    }
}
