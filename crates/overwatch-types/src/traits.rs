/// Trait contracts at the Overwatch subsystem seams.
///
/// Concrete implementations live in their subsystem crates; proxy cores code
/// against these interfaces so tests can substitute mocks (canned-response
/// transports, scripted approval handlers, capturing sinks).
use async_trait::async_trait;

use crate::errors::OverwatchError;
use crate::records::{
    ApprovalRequest, ApprovalResponse, AuditEntry, AuditFilter, AuditStats, NewAuditEntry,
};
use crate::rpc::JsonRpcMessage;

// ============================================================
// Transport
// ============================================================

/// A frame-level fault surfaced by the transport without terminating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A frame exceeded the maximum message size and was discarded.
    MessageTooLarge { size: usize, limit: usize },
    /// The header block exceeded the maximum header size.
    HeaderTooLarge { size: usize, limit: usize },
    /// The receive buffer exceeded its cap and was cleared.
    BufferOverflow { size: usize, limit: usize },
    /// `Content-Length` was missing, negative, non-numeric, or over limit.
    InvalidContentLength(String),
    /// The frame body was not valid JSON-RPC.
    Parse(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::MessageTooLarge { size, limit } => {
                write!(f, "message of {size} bytes exceeds limit of {limit}")
            }
            TransportError::HeaderTooLarge { size, limit } => {
                write!(f, "header block of {size} bytes exceeds limit of {limit}")
            }
            TransportError::BufferOverflow { size, limit } => {
                write!(f, "receive buffer of {size} bytes exceeds limit of {limit}")
            }
            TransportError::InvalidContentLength(s) => {
                write!(f, "invalid Content-Length: {s}")
            }
            TransportError::Parse(s) => write!(f, "frame parse error: {s}"),
        }
    }
}

/// One item from a transport's receive stream.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete, parsed JSON-RPC message.
    Message(JsonRpcMessage),
    /// A frame-level fault. The stream continues after resynchronization.
    Error(TransportError),
}

/// Bidirectional framed JSON-RPC transport.
///
/// `recv` returns `None` once the underlying stream is closed; frame-level
/// faults arrive as [`TransportEvent::Error`] and do not end the stream.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Serialize and send one message, prefixed with a `Content-Length`
    /// header using the UTF-8 byte length.
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), OverwatchError>;

    /// Receive the next event, or `None` at end of stream.
    async fn recv(&mut self) -> Option<TransportEvent>;

    /// Tear down subscribers. Streams the proxy does not own stay open.
    async fn close(&mut self);

    /// Whether the underlying stream is still usable.
    fn is_connected(&self) -> bool;
}

// ============================================================
// Audit
// ============================================================

/// Append-only audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Assign a fresh id and timestamp, then append. Never updates or
    /// deletes.
    async fn log(&self, entry: NewAuditEntry) -> Result<AuditEntry, OverwatchError>;

    /// Filtered query, newest first, optional limit.
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, OverwatchError>;

    /// Aggregate statistics, optionally bounded to entries at or after
    /// `since`.
    async fn stats(
        &self,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<AuditStats, OverwatchError>;
}

// ============================================================
// Approval
// ============================================================

/// Asynchronous request → approve/deny decision with timeout.
///
/// Implementations include an interactive terminal reader (external to this
/// workspace) and the webhook client. Errors are treated as denials by the
/// proxy according to its fail mode.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Ask for a decision on one tool call.
    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<ApprovalResponse, OverwatchError>;

    /// Release any held resources. Idempotent.
    async fn close(&self);
}
