/// Unified error type for the Overwatch security proxy.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
#[derive(Debug, thiserror::Error)]
pub enum OverwatchError {
    /// Error from the framed transport (framing, I/O, size limits).
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected JSON-RPC traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error from the policy engine (invalid policy set, evaluation failure).
    #[error("policy error: {0}")]
    Policy(String),

    /// Error from the session grant cache.
    #[error("session error: {0}")]
    Session(String),

    /// Error from the audit sink (logging, query, or export failures).
    #[error("audit error: {0}")]
    Audit(String),

    /// Error from the tool-shadowing detector.
    #[error("shadowing error: {0}")]
    Shadowing(String),

    /// Error from an approval handler (webhook failures, timeouts).
    #[error("approval error: {0}")]
    Approval(String),

    /// Error from configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// Database error (connection, query, migration).
    #[error("database error: {0}")]
    Database(String),

    /// The upstream server is not serving requests.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Timeout waiting for a response (upstream call, approval, shutdown).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Action was forbidden by policy or a security check.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for OverwatchError {
    fn from(err: serde_json::Error) -> Self {
        OverwatchError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OverwatchError {
    fn from(err: serde_yaml::Error) -> Self {
        OverwatchError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for OverwatchError {
    fn from(err: std::io::Error) -> Self {
        OverwatchError::Transport(err.to_string())
    }
}
