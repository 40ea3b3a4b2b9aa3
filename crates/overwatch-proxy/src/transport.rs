//! Framed JSON-RPC transport.
//!
//! Two frame modes, tried in order per frame:
//! - **Header-delimited**: ASCII headers terminated by CRLF CRLF, then
//!   exactly `Content-Length` bytes of UTF-8 JSON. The lookup is
//!   case-insensitive; other headers are ignored.
//! - **Line-delimited**: when the first line is not a header, it is parsed as
//!   one complete JSON message.
//!
//! Size violations discard the offending frame, surface a typed error on the
//! receive stream, resynchronize, and leave the transport running.
//! [`FrameDecoder`] is a synchronous state machine so framing is testable
//! without streams; [`FramedTransport`] binds it to an async read/write pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use overwatch_types::errors::OverwatchError;
use overwatch_types::rpc::JsonRpcMessage;
use overwatch_types::traits::{ProxyTransport, TransportError, TransportEvent};

// ============================================================
// Limits
// ============================================================

/// Security limits for one transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportLimits {
    /// Largest frame body accepted or sent.
    pub max_message_size: usize,
    /// Cap on buffered unparsed bytes.
    pub max_buffer_size: usize,
    /// Cap on one header block.
    pub max_header_size: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            max_buffer_size: 20 * 1024 * 1024,
            max_header_size: 8 * 1024,
        }
    }
}

// ============================================================
// FrameDecoder
// ============================================================

struct PendingBody {
    length: usize,
    /// Body of an already-rejected frame; consumed and dropped.
    discard: bool,
}

/// Incremental frame decoder.
pub struct FrameDecoder {
    limits: TransportLimits,
    buffer: Vec<u8>,
    pending: Option<PendingBody>,
}

impl FrameDecoder {
    pub fn new(limits: TransportLimits) -> Self {
        Self {
            limits,
            buffer: Vec::new(),
            pending: None,
        }
    }

    /// Feed bytes and drain every event they complete.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if self.buffer.len() + bytes.len() > self.limits.max_buffer_size {
            events.push(TransportEvent::Error(TransportError::BufferOverflow {
                size: self.buffer.len() + bytes.len(),
                limit: self.limits.max_buffer_size,
            }));
            self.buffer.clear();
            self.pending = None;
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(event) = self.next_event() {
            if let Some(e) = event {
                events.push(e);
            }
        }
        events
    }

    /// One step of the state machine. `None` = need more bytes;
    /// `Some(None)` = consumed input without producing an event.
    fn next_event(&mut self) -> Option<Option<TransportEvent>> {
        if let Some(ref pending) = self.pending {
            if self.buffer.len() < pending.length {
                return None;
            }
            let length = pending.length;
            let discard = pending.discard;
            self.pending = None;
            let body: Vec<u8> = self.buffer.drain(..length).collect();
            if discard {
                return Some(None);
            }
            return Some(Some(parse_frame(&body)));
        }

        let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
            // Still reading the first line. A JSON payload may grow to the
            // message limit; anything else is a header and gets the header
            // cap.
            let size = self.buffer.len();
            let looks_like_json = matches!(self.buffer.first(), Some(b'{') | Some(b'['));
            if looks_like_json && size > self.limits.max_message_size {
                self.buffer.clear();
                return Some(Some(TransportEvent::Error(TransportError::MessageTooLarge {
                    size,
                    limit: self.limits.max_message_size,
                })));
            }
            if !looks_like_json && size > self.limits.max_header_size {
                self.buffer.clear();
                return Some(Some(TransportEvent::Error(TransportError::HeaderTooLarge {
                    size,
                    limit: self.limits.max_header_size,
                })));
            }
            return None;
        };

        let first_line = trim_cr(&self.buffer[..newline]);
        if first_line.is_empty() {
            self.buffer.drain(..=newline);
            return Some(None);
        }

        if is_header_line(first_line) {
            self.consume_header_block()
        } else {
            // Line-delimited: the line is a complete JSON message.
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = trim_cr(&line[..line.len() - 1]).to_vec();
            if line.len() > self.limits.max_message_size {
                return Some(Some(TransportEvent::Error(TransportError::MessageTooLarge {
                    size: line.len(),
                    limit: self.limits.max_message_size,
                })));
            }
            Some(Some(parse_frame(&line)))
        }
    }

    /// Parse a header block once its CRLF CRLF terminator has arrived.
    fn consume_header_block(&mut self) -> Option<Option<TransportEvent>> {
        let Some(end) = find_subsequence(&self.buffer, b"\r\n\r\n") else {
            if self.buffer.len() > self.limits.max_header_size {
                let size = self.buffer.len();
                self.buffer.clear();
                return Some(Some(TransportEvent::Error(TransportError::HeaderTooLarge {
                    size,
                    limit: self.limits.max_header_size,
                })));
            }
            return None;
        };

        let header_block: Vec<u8> = self.buffer.drain(..end + 4).collect();
        let header_block = &header_block[..end];
        if header_block.len() > self.limits.max_header_size {
            return Some(Some(TransportEvent::Error(TransportError::HeaderTooLarge {
                size: header_block.len(),
                limit: self.limits.max_header_size,
            })));
        }

        let header_text = String::from_utf8_lossy(header_block);
        let Some(raw_length) = content_length_value(&header_text) else {
            return Some(Some(TransportEvent::Error(
                TransportError::InvalidContentLength("header block has no Content-Length".into()),
            )));
        };

        let Ok(length) = raw_length.trim().parse::<i64>() else {
            return Some(Some(TransportEvent::Error(
                TransportError::InvalidContentLength(format!("not an integer: '{raw_length}'")),
            )));
        };
        if length < 0 {
            return Some(Some(TransportEvent::Error(
                TransportError::InvalidContentLength(format!("negative length {length}")),
            )));
        }
        let length = length as usize;
        if length > self.limits.max_message_size {
            // Reject the frame but still consume its body to resynchronize.
            self.pending = Some(PendingBody {
                length,
                discard: true,
            });
            return Some(Some(TransportEvent::Error(TransportError::MessageTooLarge {
                size: length,
                limit: self.limits.max_message_size,
            })));
        }

        self.pending = Some(PendingBody {
            length,
            discard: false,
        });
        Some(None)
    }
}

fn parse_frame(body: &[u8]) -> TransportEvent {
    match serde_json::from_slice::<JsonRpcMessage>(body) {
        Ok(message) => TransportEvent::Message(message),
        Err(e) => TransportEvent::Error(TransportError::Parse(e.to_string())),
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// `Token: value` with an HTTP-ish token. JSON payloads start with `{` and
/// fall through to line framing.
fn is_header_line(line: &[u8]) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    colon > 0
        && line[..colon]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Case-insensitive `Content-Length` lookup across header lines.
fn content_length_value(header_text: &str) -> Option<String> {
    for line in header_text.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ============================================================
// FramedTransport
// ============================================================

/// Framed transport over an async read/write pair.
pub struct FramedTransport {
    writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    events: mpsc::Receiver<TransportEvent>,
    reader_task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

impl FramedTransport {
    pub fn new<R, W>(reader: R, writer: W, limits: TransportLimits) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_task = tokio::spawn(read_loop(reader, limits, tx, connected.clone()));
        Self {
            writer: Box::new(writer),
            events: rx,
            reader_task,
            connected,
        }
    }

    /// Transport over this process's own stdio (the client side).
    pub fn over_stdio(limits: TransportLimits) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), limits)
    }

    /// Transport over a spawned child's piped stdio (the upstream side).
    pub fn over_child(
        child: &mut tokio::process::Child,
        limits: TransportLimits,
    ) -> Result<Self, OverwatchError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OverwatchError::Upstream("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OverwatchError::Upstream("child stdout not captured".to_string()))?;
        Ok(Self::new(stdout, stdin, limits))
    }
}

async fn read_loop<R: AsyncRead + Send + Unpin>(
    mut reader: R,
    limits: TransportLimits,
    tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new(limits);
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for event in decoder.decode(&buf[..n]) {
                    if tx.send(event).await.is_err() {
                        connected.store(false, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }
    debug!("transport read stream ended");
    connected.store(false, Ordering::Relaxed);
}

#[async_trait]
impl ProxyTransport for FramedTransport {
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), OverwatchError> {
        let json = serde_json::to_string(&message)?;
        // Byte length, not code points.
        let frame = format!("Content-Length: {}\r\n\r\n{}", json.len(), json);
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::Relaxed);
                OverwatchError::Transport(format!("write failed: {e}"))
            })?;
        self.writer.flush().await.map_err(|e| {
            self.connected.store(false, Ordering::Relaxed);
            OverwatchError::Transport(format!("flush failed: {e}"))
        })
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        // Stops delivery to subscribers; the underlying streams close with
        // their owner.
        self.reader_task.abort();
        self.events.close();
        self.connected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for FramedTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(TransportLimits::default())
    }

    fn small_decoder() -> FrameDecoder {
        FrameDecoder::new(TransportLimits {
            max_message_size: 100,
            max_buffer_size: 300,
            max_header_size: 64,
        })
    }

    fn expect_message(event: &TransportEvent) -> &JsonRpcMessage {
        match event {
            TransportEvent::Message(m) => m,
            other => panic!("expected message, got {other:?}"),
        }
    }

    fn header_frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    // ── Header-delimited ─────────────────────────────────────

    #[test]
    fn test_header_frame_decodes() {
        let mut d = decoder();
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let events = d.decode(&header_frame(body));
        assert_eq!(events.len(), 1);
        let msg = expect_message(&events[0]);
        assert_eq!(msg.method.as_deref(), Some("ping"));
    }

    #[test]
    fn test_content_length_case_insensitive_and_other_headers_ignored() {
        let mut d = decoder();
        let body = r#"{"jsonrpc":"2.0","method":"x"}"#;
        let frame = format!(
            "Content-Type: application/json\r\ncontent-LENGTH: {}\r\nX-Extra: 1\r\n\r\n{}",
            body.len(),
            body
        );
        let events = d.decode(frame.as_bytes());
        assert_eq!(events.len(), 1);
        expect_message(&events[0]);
    }

    #[test]
    fn test_frame_split_across_pushes() {
        let mut d = decoder();
        let body = r#"{"jsonrpc":"2.0","id":7,"result":{}}"#;
        let frame = header_frame(body);

        let (a, b) = frame.split_at(10);
        assert!(d.decode(a).is_empty());
        let (b1, b2) = b.split_at(b.len() - 5);
        assert!(d.decode(b1).is_empty());
        let events = d.decode(b2);
        assert_eq!(events.len(), 1);
        assert_eq!(expect_message(&events[0]).id, Some(json!(7)));
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut d = decoder();
        let mut bytes = header_frame(r#"{"jsonrpc":"2.0","id":1,"method":"a"}"#);
        bytes.extend(header_frame(r#"{"jsonrpc":"2.0","id":2,"method":"b"}"#));
        let events = d.decode(&bytes);
        assert_eq!(events.len(), 2);
        assert_eq!(expect_message(&events[1]).method.as_deref(), Some("b"));
    }

    #[test]
    fn test_content_length_is_byte_count() {
        let mut d = decoder();
        // "héllo" is 6 bytes, 5 code points.
        let body = r#"{"jsonrpc":"2.0","method":"héllo"}"#;
        let events = d.decode(&header_frame(body));
        assert_eq!(events.len(), 1);
        assert_eq!(
            expect_message(&events[0]).method.as_deref(),
            Some("héllo")
        );
    }

    // ── Line-delimited ───────────────────────────────────────

    #[test]
    fn test_line_frame_decodes() {
        let mut d = decoder();
        let events = d.decode(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n");
        assert_eq!(events.len(), 1);
        expect_message(&events[0]);
    }

    #[test]
    fn test_line_frames_mixed_with_header_frames() {
        let mut d = decoder();
        let mut bytes = b"{\"jsonrpc\":\"2.0\",\"method\":\"a\"}\n".to_vec();
        bytes.extend(header_frame(r#"{"jsonrpc":"2.0","method":"b"}"#));
        bytes.extend(b"{\"jsonrpc\":\"2.0\",\"method\":\"c\"}\r\n");
        let events = d.decode(&bytes);
        let methods: Vec<_> = events
            .iter()
            .map(|e| expect_message(e).method.clone().unwrap())
            .collect();
        assert_eq!(methods, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut d = decoder();
        let events = d.decode(b"\n\r\n{\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n");
        assert_eq!(events.len(), 1);
    }

    // ── Violations & resynchronization ───────────────────────

    #[test]
    fn test_oversize_declared_length_rejected_and_resynced() {
        let mut d = small_decoder();
        let big_body = "x".repeat(150);
        let mut bytes = format!("Content-Length: {}\r\n\r\n{}", big_body.len(), big_body)
            .into_bytes();
        bytes.extend(header_frame(r#"{"jsonrpc":"2.0","method":"after"}"#));

        let events = d.decode(&bytes);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            TransportEvent::Error(TransportError::MessageTooLarge { size: 150, .. })
        ));
        // The stream recovered: the next frame decodes.
        assert_eq!(expect_message(&events[1]).method.as_deref(), Some("after"));
    }

    #[test]
    fn test_negative_and_non_numeric_content_length() {
        for bad in ["-5", "abc", "1e3"] {
            let mut d = decoder();
            let frame = format!("Content-Length: {bad}\r\n\r\nrest");
            let events = d.decode(frame.as_bytes());
            assert!(
                matches!(
                    events[0],
                    TransportEvent::Error(TransportError::InvalidContentLength(_))
                ),
                "value '{bad}' produced {events:?}"
            );
        }
    }

    #[test]
    fn test_header_without_content_length() {
        let mut d = decoder();
        let events = d.decode(b"Content-Type: application/json\r\n\r\n");
        assert!(matches!(
            events[0],
            TransportEvent::Error(TransportError::InvalidContentLength(_))
        ));
    }

    #[test]
    fn test_header_too_large() {
        let mut d = small_decoder();
        let frame = format!("X-Padding: {}\r\nContent-Length: 2\r\n\r\n{{}}", "p".repeat(100));
        let events = d.decode(frame.as_bytes());
        assert!(matches!(
            events[0],
            TransportEvent::Error(TransportError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn test_buffer_overflow_clears_and_continues() {
        let mut d = small_decoder();
        let events = d.decode(&vec![b'a'; 400]);
        assert!(matches!(
            events[0],
            TransportEvent::Error(TransportError::BufferOverflow { .. })
        ));

        // The decoder still works afterwards.
        let events = d.decode(b"{\"jsonrpc\":\"2.0\",\"method\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
        expect_message(&events[0]);
    }

    #[test]
    fn test_parse_error_does_not_kill_stream() {
        let mut d = decoder();
        let mut bytes = b"this is not json\n".to_vec();
        bytes.extend(b"{\"jsonrpc\":\"2.0\",\"method\":\"ok\"}\n");
        let events = d.decode(&bytes);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            TransportEvent::Error(TransportError::Parse(_))
        ));
        expect_message(&events[1]);
    }

    #[test]
    fn test_oversize_line_rejected() {
        let mut d = small_decoder();
        let mut bytes = vec![b'{'];
        bytes.extend(vec![b'x'; 150]);
        bytes.push(b'\n');
        let events = d.decode(&bytes);
        assert!(matches!(
            events[0],
            TransportEvent::Error(TransportError::MessageTooLarge { .. })
        ));
    }

    // ── FramedTransport over a duplex pipe ───────────────────

    #[tokio::test]
    async fn test_transport_roundtrip_over_duplex() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        let mut near = FramedTransport::new(our_read, our_write, TransportLimits::default());
        let mut far = FramedTransport::new(their_read, their_write, TransportLimits::default());

        near.send(JsonRpcMessage::request(json!(1), "tools/list", None))
            .await
            .unwrap();
        match far.recv().await.unwrap() {
            TransportEvent::Message(msg) => {
                assert_eq!(msg.method.as_deref(), Some("tools/list"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        far.send(JsonRpcMessage::response(json!(1), json!({"tools": []})))
            .await
            .unwrap();
        match near.recv().await.unwrap() {
            TransportEvent::Message(msg) => assert!(msg.is_response()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_recv_none_after_peer_drop() {
        let (ours, theirs) = tokio::io::duplex(64);
        let (our_read, our_write) = tokio::io::split(ours);
        let mut near = FramedTransport::new(our_read, our_write, TransportLimits::default());

        drop(theirs);
        assert!(near.recv().await.is_none());
        assert!(!near.is_connected());
    }

    #[tokio::test]
    async fn test_transport_close_stops_delivery() {
        let (ours, theirs) = tokio::io::duplex(64);
        let (our_read, our_write) = tokio::io::split(ours);
        let mut near = FramedTransport::new(our_read, our_write, TransportLimits::default());

        near.close().await;
        assert!(!near.is_connected());
        assert!(near.recv().await.is_none());
        drop(theirs);
    }
}
