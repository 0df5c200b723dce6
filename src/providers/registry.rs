use super::{
    error::ProviderError, AnthropicAdapter, CloudflareAdapter, GeminiAdapter, ModelConfig, OpenAIAdapter,
    ProviderAdapter, ProviderConfig,
};
use crate::models::{AdapterRequest, ModelCapabilities};
use secrecy::SecretString;
use std::collections::HashMap;

/// Default base URL for OpenAI-compatible API
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter family a provider id resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    OpenAI,
    Anthropic,
    Gemini,
    Cloudflare,
}

impl AdapterKind {
    pub fn from_provider_id(provider_id: &str) -> Option<Self> {
        match provider_id.to_ascii_lowercase().as_str() {
            "openai" | "deepseek" | "qwen" | "openrouter" | "openai-compatible" | "custom" => Some(AdapterKind::OpenAI),
            "anthropic" | "claude" => Some(AdapterKind::Anthropic),
            "gemini" | "google" => Some(AdapterKind::Gemini),
            "cloudflare" | "workers-ai" => Some(AdapterKind::Cloudflare),
            _ => None,
        }
    }

    fn create(self) -> Box<dyn ProviderAdapter> {
        match self {
            AdapterKind::OpenAI => Box::new(OpenAIAdapter::new()),
            AdapterKind::Anthropic => Box::new(AnthropicAdapter::new()),
            AdapterKind::Gemini => Box::new(GeminiAdapter::new()),
            AdapterKind::Cloudflare => Box::new(CloudflareAdapter::new()),
        }
    }
}

/// Vendor default base URL for a provider id.
///
/// Cloudflare has none: its base URL embeds the account id.
pub fn default_base_url(provider_id: &str) -> Option<&'static str> {
    match provider_id.to_ascii_lowercase().as_str() {
        "openai" => Some(DEFAULT_OPENAI_BASE_URL),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "qwen" => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "anthropic" | "claude" => Some("https://api.anthropic.com"),
        "gemini" | "google" => Some("https://generativelanguage.googleapis.com/v1beta"),
        _ => None,
    }
}

/// Create a fresh adapter for a provider id
pub fn get_adapter(provider_id: &str) -> Result<Box<dyn ProviderAdapter>, ProviderError> {
    AdapterKind::from_provider_id(provider_id)
        .map(AdapterKind::create)
        .ok_or_else(|| ProviderError::UnknownProvider(provider_id.to_string()))
}

/// Everything needed to call one model of one provider
pub struct ResolvedModel {
    pub adapter: Box<dyn ProviderAdapter>,
    pub base_url: String,
    pub api_key: SecretString,
    pub capabilities: ModelCapabilities,
}

impl ResolvedModel {
    /// Start an adapter request for this model
    pub fn request(&self, model: impl Into<String>) -> AdapterRequest {
        AdapterRequest {
            api_key: self.api_key.clone(),
            capabilities: Some(self.capabilities),
            ..AdapterRequest::new(model, self.base_url.clone(), String::new())
        }
    }
}

struct RegisteredProvider {
    kind: AdapterKind,
    base_url: String,
    config: ProviderConfig,
}

/// Registry of configured providers
pub struct ProviderRegistry {
    /// Map of provider id -> provider entry
    providers: HashMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Load providers from configuration
    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self, ProviderError> {
        let mut registry = Self::new();

        for config in configs {
            // Skip disabled providers
            if !config.is_enabled() {
                continue;
            }

            let kind = match AdapterKind::from_provider_id(config.provider_type()) {
                Some(kind) => kind,
                None => {
                    return Err(ProviderError::ConfigError(format!(
                        "Unknown provider type: {}",
                        config.provider_type()
                    )));
                }
            };

            let base_url = config
                .base_url
                .clone()
                .or_else(|| default_base_url(config.provider_type()).map(str::to_string))
                .or_else(|| default_base_url(&config.id).map(str::to_string))
                .ok_or_else(|| {
                    ProviderError::ConfigError(format!("Provider '{}' requires base_url", config.id))
                })?;

            if registry.providers.contains_key(&config.id) {
                return Err(ProviderError::ConfigError(format!("Duplicate provider id: {}", config.id)));
            }

            tracing::debug!("Registered provider {} ({:?}) at {}", config.id, kind, base_url);
            registry.providers.insert(
                config.id.clone(),
                RegisteredProvider {
                    kind,
                    base_url,
                    config: config.clone(),
                },
            );
        }

        Ok(registry)
    }

    /// Resolve a provider/model pair to a fresh adapter and its settings
    pub fn resolve(&self, provider_id: &str, model_id: &str) -> Result<ResolvedModel, ProviderError> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| ProviderError::UnknownProvider(provider_id.to_string()))?;

        // Unlisted models fall back to plain chat
        let capabilities = provider
            .config
            .model(model_id)
            .map(|m| m.capabilities)
            .unwrap_or_default();

        Ok(ResolvedModel {
            adapter: provider.kind.create(),
            base_url: provider.base_url.clone(),
            api_key: SecretString::new(provider.config.resolve_api_key()?),
            capabilities,
        })
    }

    pub fn provider(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider_id).map(|p| &p.config)
    }

    /// List all providers, sorted by id
    pub fn list_providers(&self) -> Vec<&ProviderConfig> {
        let mut providers: Vec<&ProviderConfig> = self.providers.values().map(|p| &p.config).collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        providers
    }

    /// List every `(provider id, model)` pair
    pub fn list_models(&self) -> Vec<(&str, &ModelConfig)> {
        self.list_providers()
            .into_iter()
            .flat_map(|p| p.models.iter().map(move |m| (p.id.as_str(), m)))
            .collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn provider(id: &str, provider_type: Option<&str>, base_url: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            name: None,
            provider_type: provider_type.map(str::to_string),
            api_key: SecretString::new(format!("{}-key", id)),
            base_url: base_url.map(str::to_string),
            models: vec![ModelConfig {
                id: "tts-model".to_string(),
                name: None,
                capabilities: ModelCapabilities { tts: true, ..Default::default() },
            }],
            enabled: None,
        }
    }

    #[test]
    fn test_get_adapter_families() {
        for (id, name) in [
            ("openai", "openai"),
            ("deepseek", "openai"),
            ("qwen", "openai"),
            ("openrouter", "openai"),
            ("custom", "openai"),
            ("anthropic", "anthropic"),
            ("claude", "anthropic"),
            ("gemini", "gemini"),
            ("google", "gemini"),
            ("cloudflare", "cloudflare"),
            ("workers-ai", "cloudflare"),
        ] {
            assert_eq!(get_adapter(id).unwrap().name(), name, "provider id {}", id);
        }
    }

    #[test]
    fn test_unknown_provider() {
        assert!(matches!(get_adapter("nope"), Err(ProviderError::UnknownProvider(id)) if id == "nope"));

        let registry = ProviderRegistry::new();
        assert!(matches!(registry.resolve("nope", "m"), Err(ProviderError::UnknownProvider(_))));
    }

    #[test]
    fn test_empty_registry() {
        let registry = ProviderRegistry::new();
        assert!(registry.list_models().is_empty());
        assert!(registry.list_providers().is_empty());
    }

    #[test]
    fn test_from_configs_and_resolve() {
        let mut disabled = provider("anthropic", None, None);
        disabled.enabled = Some(false);
        let registry = ProviderRegistry::from_configs(&[
            provider("my-deepseek", Some("deepseek"), None),
            provider("cf", Some("cloudflare"), Some("https://api.cloudflare.com/client/v4/accounts/a/ai")),
            disabled,
        ])
        .unwrap();

        assert_eq!(registry.list_providers().len(), 2);
        assert_eq!(registry.list_models().len(), 2);
        assert!(registry.provider("anthropic").is_none());

        let resolved = registry.resolve("my-deepseek", "tts-model").unwrap();
        assert_eq!(resolved.adapter.name(), "openai");
        assert_eq!(resolved.base_url, "https://api.deepseek.com/v1");
        assert_eq!(resolved.api_key.expose_secret(), "my-deepseek-key");
        assert!(resolved.capabilities.tts);

        let request = resolved.request("tts-model");
        assert_eq!(request.api_key(), "my-deepseek-key");
        assert_eq!(request.capabilities, Some(resolved.capabilities));

        let unlisted = registry.resolve("cf", "@cf/meta/llama-3.1-8b-instruct").unwrap();
        assert_eq!(unlisted.adapter.name(), "cloudflare");
        assert_eq!(unlisted.capabilities, ModelCapabilities::default());
    }

    #[test]
    fn test_from_configs_errors() {
        let unknown = ProviderRegistry::from_configs(&[provider("x", Some("mystery"), None)]);
        assert!(matches!(unknown, Err(ProviderError::ConfigError(_))));

        let no_base = ProviderRegistry::from_configs(&[provider("cloudflare", None, None)]);
        assert!(matches!(no_base, Err(ProviderError::ConfigError(_))));

        let duplicate = ProviderRegistry::from_configs(&[provider("openai", None, None), provider("openai", None, None)]);
        assert!(matches!(duplicate, Err(ProviderError::ConfigError(_))));
    }
}
