use crate::models::StreamChunk;
use super::error::ProviderError;
use super::ChunkStream;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use pin_project::pin_project;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// SSE event from provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// Format as SSE output for client
    pub fn to_sse_string(&self) -> String {
        let mut output = String::new();

        if let Some(ref event_type) = self.event {
            output.push_str(&format!("event: {}\n", event_type));
        }

        output.push_str(&format!("data: {}\n\n", self.data));
        output
    }
}

/// Incremental newline splitter over raw bytes.
///
/// Keeps the trailing partial line between pushes, so multi-byte UTF-8
/// sequences split across reads are reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.buf[start..end]));
            start = end + 1;
        }
        self.buf.drain(..start);
        lines
    }

    /// Flush a final line that had no terminating newline
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = decode_line(&self.buf);
        self.buf.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Line-oriented SSE decoder.
///
/// Every `data:` line is surfaced as its own event, tagged with the most
/// recent `event:` field of the current block.
#[derive(Debug, Default)]
pub struct SseParser {
    lines: LineBuffer,
    event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let lines = self.lines.push(bytes);
        lines.into_iter().filter_map(|line| self.handle_line(&line)).collect()
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        self.lines
            .finish()
            .and_then(|line| self.handle_line(&line))
            .into_iter()
            .collect()
    }

    fn handle_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            self.event = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(data) = field_value(line, "data") {
            return Some(SseEvent {
                event: self.event.clone(),
                data: data.to_string(),
            });
        }
        if let Some(event) = field_value(line, "event") {
            self.event = Some(event.to_string());
        }
        // id:, retry: and unknown fields are ignored
        None
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Parse SSE events from a complete body
pub fn parse_sse_events(input: &str) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.push(input.as_bytes());
    events.extend(parser.finish());
    events
}

/// Stream adapter that converts a byte stream into SSE events
#[pin_project]
pub struct SseStream<S> {
    #[pin]
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

impl<S> SseStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<SseEvent, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match futures::ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => {
                    let events = this.parser.push(&bytes);
                    this.pending.extend(events);
                }
                Some(Err(e)) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    // Stream ended - flush any unterminated line
                    *this.finished = true;
                    let events = this.parser.finish();
                    this.pending.extend(events);
                }
            }
        }
    }
}

/// Stop a chunk stream right after its first `error` or `done`
pub fn fuse_terminal<S>(inner: S) -> ChunkStream
where
    S: Stream<Item = StreamChunk> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        futures::pin_mut!(inner);
        while let Some(chunk) = inner.next().await {
            let terminal = chunk.is_terminal();
            yield chunk;
            if terminal {
                break;
            }
        }
    })
}

/// Repackage a one-shot operation as a stream ending in `done`, or in
/// a single `error` chunk when the operation fails
pub fn bridge_result<F>(operation: F) -> ChunkStream
where
    F: Future<Output = Result<Vec<StreamChunk>, ProviderError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        match operation.await {
            Ok(chunks) => {
                for chunk in chunks {
                    yield chunk;
                }
                yield StreamChunk::Done;
            }
            Err(e) => {
                tracing::warn!("Bridged provider call failed: {}", e);
                yield e.into_chunk();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_sse_single_event() {
        let input = "event: message\ndata: {\"test\":\"value\"}\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"test\":\"value\"}");
    }

    #[test]
    fn test_parse_sse_multiple_events() {
        let input = "event: start\ndata: {\"a\":1}\n\nevent: delta\ndata: {\"b\":2}\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("start"));
        assert_eq!(events[1].event.as_deref(), Some("delta"));
    }

    #[test]
    fn test_parse_sse_no_event_type() {
        let input = "data: plain data\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 1);
        assert!(events[0].event.is_none());
        assert_eq!(events[0].data, "plain data");
    }

    #[test]
    fn test_parse_sse_crlf_comments_and_tight_prefix() {
        let input = ": keep-alive\r\ndata:{\"x\":1}\r\n\r\ndata: [DONE]";
        let events = parse_sse_events(input);

        assert_eq!(events, vec![SseEvent::data("{\"x\":1}"), SseEvent::data("[DONE]")]);
    }

    #[test]
    fn test_event_name_resets_after_blank_line() {
        let events = parse_sse_events("event: ping\ndata: 1\n\ndata: 2\n\n");
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert!(events[1].event.is_none());
    }

    #[test]
    fn test_line_buffer_keeps_partial_line() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"data: he").is_empty());
        assert_eq!(buffer.push(b"llo\ndata: wo"), vec!["data: hello"]);
        assert_eq!(buffer.finish().as_deref(), Some("data: wo"));
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_line_buffer_split_utf8() {
        let text = "data: héllo\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut buffer = LineBuffer::new();
        assert!(buffer.push(&text[..split]).is_empty());
        assert_eq!(buffer.push(&text[split..]), vec!["data: héllo"]);
    }

    #[test]
    fn test_to_sse_string() {
        assert_eq!(SseEvent::data("{}").to_sse_string(), "data: {}\n\n");
    }

    #[tokio::test]
    async fn test_sse_stream_yields_every_event_in_a_read() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: a\n\ndata: b\n\nda")),
            Ok(Bytes::from_static(b"ta: c\n\ndata: d")),
        ];
        let events: Vec<_> = SseStream::new(futures::stream::iter(chunks))
            .map(|e| e.unwrap().data)
            .collect()
            .await;

        assert_eq!(events, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_sse_stream_surfaces_transport_error_and_ends() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: a\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: never\n")),
        ];
        let mut stream = SseStream::new(futures::stream::iter(chunks));

        assert_eq!(stream.next().await.unwrap().unwrap().data, "a");
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fuse_terminal_stops_after_done() {
        let inner = futures::stream::iter(vec![
            StreamChunk::text("a"),
            StreamChunk::Done,
            StreamChunk::text("late"),
        ]);
        let chunks: Vec<_> = fuse_terminal(inner).collect().await;
        assert_eq!(chunks, vec![StreamChunk::text("a"), StreamChunk::Done]);
    }

    #[tokio::test]
    async fn test_bridge_result() {
        let ok: Vec<_> = bridge_result(async { Ok(vec![StreamChunk::text("hi")]) }).collect().await;
        assert_eq!(ok, vec![StreamChunk::text("hi"), StreamChunk::Done]);

        let failed: Vec<_> = bridge_result(async {
            Err(ProviderError::UpstreamFailure("nope".into()))
        })
        .collect()
        .await;
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0], StreamChunk::Error { .. }));
    }

    #[test]
    fn test_bridged_error_is_single_chunk() {
        let chunks: Vec<_> = tokio_test::block_on(
            bridge_result(async { Err(ProviderError::UnknownProvider("x".into())) }).collect::<Vec<_>>(),
        );
        assert_eq!(chunks, vec![StreamChunk::error("Unknown provider: x")]);
    }

    proptest! {
        #[test]
        fn prop_split_point_does_not_change_events(split in 0usize..120) {
            let body = "event: a\ndata: {\"k\":\"välue\"}\r\n\r\n: c\ndata: second\n\ndata: [DONE]\n\n";
            let bytes = body.as_bytes();
            let split = split.min(bytes.len());

            let mut parser = SseParser::new();
            let mut events = parser.push(&bytes[..split]);
            events.extend(parser.push(&bytes[split..]));
            events.extend(parser.finish());

            prop_assert_eq!(events, parse_sse_events(body));
        }
    }
}
