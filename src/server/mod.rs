pub mod relay;

use crate::cli::AppConfig;
use crate::message_tracing::MessageTracer;
use crate::models::{content_to_text, latest_user_message, AdapterRequest, ChatMessage};
use crate::providers::error::ProviderError;
use crate::providers::ProviderRegistry;
use crate::tools::search::{format_search_context, HttpSearchBackend, SearchBackend};
use crate::tools::{apply_tool_outcome, select_tools, BuiltinTools, ToolExecutor};
use anyhow::Context;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use relay::{relay, sse_body_stream, RelayContext};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const DEFAULT_SEARCH_RESULTS: usize = 5;

/// Application state shared across handlers
pub struct AppState {
    pub config: AppConfig,
    pub registry: ProviderRegistry,
    pub tools: Arc<dyn ToolExecutor>,
    pub search: Option<Arc<dyn SearchBackend>>,
    pub search_max_results: usize,
    pub tracer: Arc<MessageTracer>,
}

impl AppState {
    /// Build the registry, tools and tracer described by the config
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let registry = ProviderRegistry::from_configs(&config.providers)
            .context("Failed to initialize provider registry")?;

        let search = match &config.search {
            Some(search_config) => {
                let backend =
                    HttpSearchBackend::new(search_config).context("Failed to initialize search backend")?;
                info!("🔎 Web search backend: {}", search_config.endpoint);
                Some(Arc::new(backend) as Arc<dyn SearchBackend>)
            }
            None => None,
        };
        let search_max_results = config
            .search
            .as_ref()
            .map(|s| s.max_results)
            .unwrap_or(DEFAULT_SEARCH_RESULTS);

        let tools: Arc<dyn ToolExecutor> = Arc::new(BuiltinTools::new(search.clone(), search_max_results));
        let tracer = Arc::new(MessageTracer::new(config.server.tracing.clone()));

        Ok(Self {
            config,
            registry,
            tools,
            search,
            search_max_results,
            tracer,
        })
    }
}

/// Chat request from the browser
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub provider_id: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub reasoning: bool,
    /// Tool ids to offer the model
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub search: bool,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// Build the HTTP router
pub fn build_app(state: Arc<AppState>) -> AxumRouter {
    let api = AxumRouter::new()
        .route("/api/models", get(get_models))
        .route("/api/chat", post(handle_chat))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_password));

    let mut app = AxumRouter::new().route("/health", get(health_check)).merge(api);

    if let Some(static_dir) = &state.config.server.static_dir {
        info!("📂 Serving UI from {}", static_dir.display());
        app = app.fallback_service(ServeDir::new(static_dir));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::from_config(config)?);

    info!(
        "📦 Loaded {} providers with {} models",
        state.registry.list_providers().len(),
        state.registry.list_models().len()
    );
    if state.config.server.password.is_some() {
        info!("🔒 Password protection enabled for /api routes");
    }

    let app = build_app(state);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("🚀 Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn require_password(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let authorized = {
        let headers = request.headers();
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or_else(|| headers.get("x-access-password").and_then(|v| v.to_str().ok()));
        state.config.server.password_matches(presented)
    };

    if !authorized {
        return AppError::Unauthorized.into_response();
    }
    next.run(request).await
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-mux"
    }))
}

/// List enabled providers and their models. Keys are never included.
async fn get_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers: Vec<serde_json::Value> = state
        .registry
        .list_providers()
        .into_iter()
        .map(|provider| {
            let models: Vec<serde_json::Value> = provider
                .models
                .iter()
                .map(|model| {
                    serde_json::json!({
                        "id": model.id,
                        "name": model.display_name(),
                        "capabilities": model.capabilities,
                    })
                })
                .collect();
            serde_json::json!({
                "id": provider.id,
                "name": provider.display_name(),
                "type": provider.provider_type(),
                "models": models,
            })
        })
        .collect();

    Json(serde_json::json!({ "providers": providers }))
}

/// Handle /api/chat requests (both streaming and non-streaming)
async fn handle_chat(
    State(state): State<Arc<AppState>>,
    Json(chat): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let started = Instant::now();

    let resolved = state
        .registry
        .resolve(&chat.provider_id, &chat.model)
        .map_err(|e| match e {
            ProviderError::UnknownProvider(_) => AppError::RoutingError(e.to_string()),
            other => AppError::ParseError(other.to_string()),
        })?;
    let capabilities = resolved.capabilities;

    let mut messages = chat.messages;
    if chat.search && !capabilities.search {
        augment_with_search(&state, &mut messages).await;
    }

    let tools = if capabilities.function_call && !chat.tools.is_empty() {
        Some(select_tools(&chat.tools, &state.config.tools))
    } else {
        None
    };

    let request = AdapterRequest {
        reasoning: chat.reasoning,
        tools,
        temperature: chat.temperature,
        max_tokens: chat.max_tokens,
        ..resolved.request(chat.model.as_str())
    }
    .with_messages(messages);

    let trace_id = state.tracer.new_trace_id();
    state
        .tracer
        .trace_request(&trace_id, &chat.provider_id, &request, chat.stream);

    info!(
        "💬 {} / {} via {} ({})",
        chat.provider_id,
        chat.model,
        resolved.adapter.name(),
        if chat.stream { "stream" } else { "sync" }
    );

    if chat.stream {
        let chunks = relay(
            resolved.adapter.chat_stream(request),
            RelayContext {
                tools: state.tools.clone(),
                tracer: state.tracer.clone(),
                trace_id,
                started,
            },
        );

        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(sse_body_stream(chunks)))
            .map_err(|e| AppError::ParseError(format!("Failed to build response: {}", e)));
    }

    let mut response = match resolved.adapter.chat(request).await {
        Ok(response) => response,
        Err(e) => {
            if e.is_client_error() {
                warn!("❌ Provider {} rejected the request: {}", chat.provider_id, e);
            } else {
                error!("❌ Provider {} failed: {}", chat.provider_id, e);
            }
            state.tracer.trace_error(&trace_id, &e.to_string());
            return Err(AppError::ProviderError(e.to_string()));
        }
    };

    if let Some(calls) = response.tool_calls.as_mut() {
        for call in calls.iter_mut() {
            let outcome = state.tools.execute_tool(&call.name, &call.arguments).await;
            apply_tool_outcome(call, &outcome);
        }
    }

    let latency_ms = started.elapsed().as_millis() as u64;
    info!("✅ Request completed in {}ms", latency_ms);
    state.tracer.trace_response(&trace_id, &response, latency_ms);

    Ok(Json(response).into_response())
}

/// Prepend web search results for the latest user message as a system message.
///
/// Search failures leave the messages untouched.
async fn augment_with_search(state: &AppState, messages: &mut Vec<ChatMessage>) {
    let Some(backend) = &state.search else {
        debug!("Search requested but no search backend configured");
        return;
    };

    let query = match latest_user_message(messages).map(|m| content_to_text(&m.content)) {
        Some(query) if !query.trim().is_empty() => query,
        _ => return,
    };

    match backend.search(&query, state.search_max_results).await {
        Ok(results) if results.is_empty() => debug!("Search for {:?} found nothing", query),
        Ok(results) => {
            debug!("Augmenting request with {} search results", results.len());
            messages.insert(0, ChatMessage::system(format_search_context(&query, &results)));
        }
        Err(e) => warn!("Web search failed, continuing without results: {}", e),
    }
}

/// Application errors
#[derive(Debug)]
pub enum AppError {
    Unauthorized,
    RoutingError(String),
    ParseError(String),
    ProviderError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Invalid or missing access password".to_string()),
            AppError::RoutingError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::ParseError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::ProviderError(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(serde_json::json!({
            "error": {
                "type": "error",
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Unauthorized => write!(f, "Unauthorized"),
            AppError::RoutingError(msg) => write!(f, "Routing error: {}", msg),
            AppError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            AppError::ProviderError(msg) => write!(f, "Provider error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}
