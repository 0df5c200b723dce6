//! Relays adapter streams to the client, executing tool calls inline.

use crate::message_tracing::MessageTracer;
use crate::models::{AdapterResponse, StreamChunk, ToolStatus};
use crate::providers::streaming::SseEvent;
use crate::providers::ChunkStream;
use crate::tools::{apply_tool_outcome, ToolExecutor};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

/// Per-request collaborators of a relay
pub struct RelayContext {
    pub tools: Arc<dyn ToolExecutor>,
    pub tracer: Arc<MessageTracer>,
    pub trace_id: String,
    pub started: Instant,
}

/// Wrap an adapter stream so every `tool_call` is executed and answered.
///
/// A received call is forwarded with status `running`, then a `tool_result`
/// chunk follows once the executor returns. The relay ends after the first
/// `done` or `error`.
pub fn relay(upstream: ChunkStream, ctx: RelayContext) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut upstream = upstream;
        let mut collected = AdapterResponse::default();

        while let Some(chunk) = upstream.next().await {
            match chunk {
                StreamChunk::ToolCall { mut tool_call } => {
                    tool_call.status = ToolStatus::Running;
                    yield StreamChunk::ToolCall { tool_call: tool_call.clone() };

                    let outcome = ctx.tools.execute_tool(&tool_call.name, &tool_call.arguments).await;
                    apply_tool_outcome(&mut tool_call, &outcome);

                    let tool_id = tool_call.id.clone();
                    collected.absorb(StreamChunk::ToolCall { tool_call });
                    yield StreamChunk::ToolResult {
                        tool_id,
                        result: serde_json::to_value(&outcome).unwrap_or_default(),
                    };
                }
                StreamChunk::ToolResult { tool_id, .. } => {
                    tracing::warn!("Dropping adapter-emitted tool_result for {}", tool_id);
                }
                StreamChunk::Error { error } => {
                    tracing::warn!("Stream {} failed: {}", ctx.trace_id, error);
                    ctx.tracer.trace_error(&ctx.trace_id, &error);
                    yield StreamChunk::Error { error };
                    return;
                }
                StreamChunk::Done => {
                    let latency_ms = ctx.started.elapsed().as_millis() as u64;
                    tracing::info!("✅ Stream completed in {}ms", latency_ms);
                    ctx.tracer.trace_response(&ctx.trace_id, &collected, latency_ms);
                    yield StreamChunk::Done;
                    return;
                }
                other => {
                    collected.absorb(other.clone());
                    yield other;
                }
            }
        }

        tracing::debug!("Upstream stream ended without a terminal chunk");
    })
}

/// Serialize one chunk as an SSE `data:` frame
pub fn sse_frame(chunk: &StreamChunk) -> Bytes {
    let json = match serde_json::to_string(chunk) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize stream chunk: {}", e);
            serde_json::json!({"type": "error", "error": "failed to serialize stream chunk"}).to_string()
        }
    };
    Bytes::from(SseEvent::data(json).to_sse_string())
}

/// Frame a chunk stream for an HTTP body
pub fn sse_body_stream(chunks: ChunkStream) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    chunks.map(|chunk| Ok(sse_frame(&chunk)))
}
