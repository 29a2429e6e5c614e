//! Server-Sent Events upstream transport
//!
//! Reads a smee-style relay channel over HTTP. Each SSE data block carries a
//! JSON object holding the original webhook headers and body:
//!
//! ```text
//! event: message
//! data: {"x-github-event":"push","x-github-delivery":"abc","body":{...}}
//!
//! ```
//!
//! A block whose data is already an event envelope (as produced by this
//! tool's own relay) is accepted as-is. The `ready` block sent on connect is
//! skipped.

use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

use super::{Connection, Inbound, Transport, TransportError};
use crate::event::{Event, EVENT_KIND};

const EVENT_STREAM: &str = "text/event-stream";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READY_EVENT: &str = "ready";

/// Transport for `http://` and `https://` SSE endpoints.
#[derive(Debug, Clone)]
pub struct SseTransport {
    url: Url,
    client: reqwest::Client,
    categories: Arc<HashSet<String>>,
}

impl SseTransport {
    /// Validate the endpoint and build the HTTP client.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{}' for sse transport",
                url.scheme()
            )));
        }

        // No overall request timeout: the response body is the event stream.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Connect(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url,
            client,
            categories: Arc::default(),
        })
    }

    /// Only pass events of these categories. The relay channel carries
    /// everything, so the filter is applied on this side; empty means all.
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = Arc::new(categories.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl Transport for SseTransport {
    type Connection = SseConnection;

    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    async fn connect(&self) -> Result<SseConnection, TransportError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, EVENT_STREAM)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(SseConnection {
            pending_response: Some(response),
            body: None,
            decoder: SseDecoder::default(),
            blocks: VecDeque::new(),
            categories: Arc::clone(&self.categories),
        })
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// An open SSE response.
pub struct SseConnection {
    pending_response: Option<reqwest::Response>,
    body: Option<ByteStream>,
    decoder: SseDecoder,
    blocks: VecDeque<SseBlock>,
    categories: Arc<HashSet<String>>,
}

fn wanted(categories: &HashSet<String>, inbound: &Inbound) -> bool {
    match inbound {
        Inbound::Event(event) => categories.is_empty() || categories.contains(&event.category),
        Inbound::Undecodable { .. } => true,
    }
}

#[async_trait]
impl Connection for SseConnection {
    /// Accept the response only if the upstream answered `200 OK`.
    async fn handshake(&mut self) -> Result<(), TransportError> {
        let Some(response) = self.pending_response.take() else {
            return Ok(());
        };
        if response.status() != StatusCode::OK {
            return Err(TransportError::Handshake(format!(
                "unexpected status {}",
                response.status()
            )));
        }
        self.body = Some(Box::pin(response.bytes_stream()));
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<Inbound>, TransportError> {
        let Some(body) = self.body.as_mut() else {
            return Err(TransportError::Read("read before handshake".to_string()));
        };

        loop {
            if let Some(block) = self.blocks.pop_front() {
                match decode_block(block) {
                    Some(inbound) if wanted(&self.categories, &inbound) => return Ok(Some(inbound)),
                    _ => continue,
                }
            }

            match body.next().await {
                Some(Ok(chunk)) => self.blocks.extend(self.decoder.feed(&chunk)?),
                Some(Err(e)) => return Err(TransportError::Read(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// One dispatched SSE block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseBlock {
    /// Last `id:` field, if any
    pub id: Option<String>,
    /// `event:` field, if any
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Longest line accepted before the stream is considered corrupt.
pub const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

/// Incremental SSE line parser.
///
/// Chunks may split lines (and multi-byte characters) anywhere; bytes are
/// buffered until a full line is available.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    // Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    max_line_bytes: usize,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    /// Decoder that rejects lines longer than `max_line_bytes`.
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line_bytes,
            id: None,
            event: None,
            data: Vec::new(),
        }
    }

    /// Feed raw bytes and collect every block completed by them.
    ///
    /// A line that is not valid UTF-8, or an unterminated line longer than
    /// the limit, is a framing error: the stream can no longer be trusted
    /// and the connection must be dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseBlock>, TransportError> {
        self.buffer.extend_from_slice(chunk);

        let mut blocks = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let raw = &self.buffer[start..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = std::str::from_utf8(raw)
                .map_err(|e| TransportError::Framing(format!("invalid UTF-8 in event stream: {e}")))?
                .to_owned();

            if let Some(block) = self.process_line(&line) {
                blocks.push(block);
            }
            start = end + 1;
            search_from = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_line_bytes {
            return Err(TransportError::Framing(format!(
                "event stream line exceeds {} bytes",
                self.max_line_bytes
            )));
        }
        Ok(blocks)
    }

    fn process_line(&mut self, line: &str) -> Option<SseBlock> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseBlock> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseBlock {
            id: self.id.clone(),
            event,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

fn decode_block(block: SseBlock) -> Option<Inbound> {
    if block.event.as_deref() == Some(READY_EVENT) {
        return None;
    }
    Some(match decode_relay_payload(&block.data) {
        Ok(event) => Inbound::Event(event),
        Err(reason) => Inbound::Undecodable {
            raw: block.data,
            reason,
        },
    })
}

/// Decode the data of one SSE block into an [`Event`].
///
/// # Examples
///
/// ```
/// use gh_pulse::source::sse::decode_relay_payload;
///
/// let event = decode_relay_payload(
///     r#"{"x-github-event":"push","x-github-delivery":"d-1","body":{"ref":"main"}}"#,
/// )
/// .unwrap();
/// assert_eq!(event.category, "push");
/// assert_eq!(event.payload["ref"], "main");
/// ```
pub fn decode_relay_payload(data: &str) -> Result<Event, String> {
    let value: Value = serde_json::from_str(data).map_err(|e| format!("invalid JSON: {e}"))?;

    if value.get("type").and_then(Value::as_str) == Some(EVENT_KIND) {
        return Event::from_json(data).map_err(|e| e.to_string());
    }

    let Value::Object(mut fields) = value else {
        return Err("payload is not a JSON object".to_string());
    };

    let category = match fields.get("x-github-event").and_then(Value::as_str) {
        Some(category) if !category.is_empty() => category.to_string(),
        _ => return Err("missing x-github-event".to_string()),
    };
    let delivery_id = match fields.get("x-github-delivery").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err("missing x-github-delivery".to_string()),
    };
    let body = fields.remove("body").unwrap_or(Value::Null);

    Ok(Event::new(category, delivery_id, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(decoder: &mut SseDecoder, input: &str) -> Vec<SseBlock> {
        decoder.feed(input.as_bytes()).unwrap()
    }

    #[test]
    fn test_new_validates_scheme() {
        assert!(SseTransport::new("https://smee.io/abc").is_ok());
        assert!(SseTransport::new("http://localhost:3000/channel").is_ok());
        assert!(matches!(
            SseTransport::new("ws://localhost/ws").unwrap_err(),
            TransportError::InvalidEndpoint(_)
        ));
        assert!(matches!(
            SseTransport::new("::nope").unwrap_err(),
            TransportError::InvalidEndpoint(_)
        ));
    }

    #[test]
    fn test_decoder_single_block() {
        let mut decoder = SseDecoder::default();
        let blocks = feed_all(&mut decoder, "event: message\nid: 7\ndata: {\"a\":1}\n\n");
        assert_eq!(
            blocks,
            vec![SseBlock {
                id: Some("7".into()),
                event: Some("message".into()),
                data: "{\"a\":1}".into(),
            }]
        );
    }

    #[test]
    fn test_decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let blocks = feed_all(&mut decoder, "data: line1\ndata: line2\n\n");
        assert_eq!(blocks[0].data, "line1\nline2");
    }

    #[test]
    fn test_decoder_handles_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::default();
        assert!(feed_all(&mut decoder, "da").is_empty());
        assert!(feed_all(&mut decoder, "ta: hel").is_empty());
        assert!(feed_all(&mut decoder, "lo\r\n").is_empty());
        let blocks = feed_all(&mut decoder, "\r\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, "hello");
    }

    #[test]
    fn test_decoder_multibyte_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.len() - 3;
        assert!(decoder.feed(&bytes[..split]).unwrap().is_empty());
        let blocks = decoder.feed(&bytes[split..]).unwrap();
        assert_eq!(blocks[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_decoder_ignores_comments_and_empty_blocks() {
        let mut decoder = SseDecoder::default();
        let blocks = feed_all(&mut decoder, ": keepalive\n\nevent: ping\n\ndata: x\n\n");
        assert_eq!(blocks.len(), 1);
        // The event name of a block without data does not leak into the next one.
        assert_eq!(blocks[0].event, None);
    }

    #[test]
    fn test_decoder_rejects_invalid_utf8() {
        let mut decoder = SseDecoder::default();
        let err = decoder.feed(b"data: \xff\xfe\n\n").unwrap_err();
        assert!(matches!(err, TransportError::Framing(_)));
    }

    #[test]
    fn test_decode_block_skips_ready() {
        let block = SseBlock {
            id: None,
            event: Some("ready".into()),
            data: "{}".into(),
        };
        assert_eq!(decode_block(block), None);
    }

    #[test]
    fn test_decode_relay_payload_smee_shape() {
        let event = decode_relay_payload(
            r#"{"x-github-event":"issues","x-github-delivery":"d-9","body":{"action":"opened"},"timestamp":1}"#,
        )
        .unwrap();
        assert_eq!(event.category, "issues");
        assert_eq!(event.delivery_id, "d-9");
        assert_eq!(event.payload["action"], "opened");
        assert!(!event.truncated);
    }

    #[test]
    fn test_decode_relay_payload_envelope_shape() {
        let event = decode_relay_payload(
            r#"{"type":"event","event":"push","delivery_id":"x","truncated":true,"payload":{}}"#,
        )
        .unwrap();
        assert_eq!(event.category, "push");
        assert!(event.truncated);
    }

    #[test]
    fn test_decode_relay_payload_errors() {
        assert!(decode_relay_payload("{not json").is_err());
        assert!(decode_relay_payload("[1,2]").is_err());
        assert!(decode_relay_payload(r#"{"body":{}}"#)
            .unwrap_err()
            .contains("x-github-event"));
        assert!(decode_relay_payload(r#"{"x-github-event":"push","body":{}}"#)
            .unwrap_err()
            .contains("x-github-delivery"));
    }

    #[test]
    fn test_undecodable_block_keeps_raw_data() {
        let block = SseBlock {
            id: None,
            event: None,
            data: "{oops".into(),
        };
        assert!(matches!(
            decode_block(block),
            Some(Inbound::Undecodable { raw, .. }) if raw == "{oops"
        ));
    }

    #[test]
    fn test_category_filter() {
        let push = Inbound::Event(Event::new("push", "d1", serde_json::json!({})));
        let raw = Inbound::Undecodable {
            raw: "x".into(),
            reason: "bad".into(),
        };
        let only_prs: HashSet<String> = ["pull_request".to_string()].into();

        assert!(wanted(&HashSet::new(), &push));
        assert!(!wanted(&only_prs, &push));
        assert!(wanted(&only_prs, &raw));
    }

    #[test]
    fn test_decoder_long_line_across_many_chunks() {
        let mut decoder = SseDecoder::default();
        let payload = "x".repeat(4096);
        let input = format!("data: {payload}\n\n");
        let mut blocks = Vec::new();
        for chunk in input.as_bytes().chunks(7) {
            blocks.extend(decoder.feed(chunk).unwrap());
        }
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, payload);
    }

    #[test]
    fn test_decoder_rejects_oversized_line() {
        let mut decoder = SseDecoder::with_max_line_bytes(16);
        assert!(decoder.feed(b"data: 0123456789").is_ok());
        assert!(matches!(
            decoder.feed(b"abcdef").unwrap_err(),
            TransportError::Framing(_)
        ));
    }

    #[test]
    fn test_decoder_limit_applies_per_line() {
        let mut decoder = SseDecoder::with_max_line_bytes(16);
        let blocks = decoder
            .feed(b"data: 0123456789\ndata: 0123456789\n\n")
            .unwrap();
        assert_eq!(blocks[0].data, "0123456789\n0123456789");
    }
}
