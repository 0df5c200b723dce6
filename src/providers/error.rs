use crate::models::media::MediaError;
use crate::models::StreamChunk;
use thiserror::Error;

/// Provider-specific errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Provider API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// 2xx response whose payload reports failure
    #[error("Upstream reported failure: {0}")]
    UpstreamFailure(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("Media error: {0}")]
    MediaError(#[from] MediaError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProviderError {
    /// Check if this is a client error (4xx) that a retry would not fix
    pub fn is_client_error(&self) -> bool {
        match self {
            ProviderError::ApiError { status, .. } => *status >= 400 && *status < 500,
            ProviderError::UnknownProvider(_) | ProviderError::UnsupportedContent(_) => true,
            _ => false,
        }
    }

    /// Terminal `error` chunk carrying this error's message
    pub fn into_chunk(self) -> StreamChunk {
        StreamChunk::error(self.to_string())
    }
}
