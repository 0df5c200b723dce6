//! Web search backend used for request augmentation and the `web_search` tool.

use super::ToolError;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_results() -> usize {
    5
}

/// Search backend configuration from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// JSON search endpoint, e.g. a SearXNG `/search` URL
    pub endpoint: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::providers::serialize_redacted_opt",
        deserialize_with = "crate::providers::deserialize_secret_opt"
    )]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default, alias = "content")]
    pub snippet: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ToolError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

/// SearXNG-compatible JSON search over HTTP
pub struct HttpSearchBackend {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpSearchBackend {
    pub fn new(config: &SearchConfig) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ToolError> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json")]);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ToolError::ExecutionError(format!("search returned {}: {}", status, error_text)));
        }

        let mut parsed: SearchResponse = response.json().await?;
        parsed.results.truncate(max_results);
        tracing::debug!("Search for {:?} returned {} results", query, parsed.results.len());
        Ok(parsed.results)
    }
}

/// Render results as a system-prompt block
pub fn format_search_context(query: &str, results: &[SearchResult]) -> String {
    let mut context = format!("Web search results for \"{}\":\n", query);
    for (i, result) in results.iter().enumerate() {
        context.push_str(&format!("\n[{}] {}\n{}\n", i + 1, result.title, result.url));
        if !result.snippet.is_empty() {
            context.push_str(&format!("{}\n", result.snippet.trim()));
        }
    }
    context.push_str("\nUse these results when they are relevant and cite sources by number.");
    context
}
