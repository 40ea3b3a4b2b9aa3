//! Shared data records used across the Overwatch subsystems.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================
// Risk
// ============================================================

/// Coarse severity classification for a tool invocation.
///
/// Ordered: `Safe < Read < Write < Destructive < Dangerous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Known-safe invocation (explicit path allow).
    Safe,
    /// Read-only by inference.
    Read,
    /// Mutating but routine.
    Write,
    /// Deletes or irreversibly alters data.
    Destructive,
    /// Explicitly denied paths or equivalent.
    Dangerous,
}

impl RiskLevel {
    /// CEF severity mapping used by audit export.
    pub fn cef_severity(&self) -> u8 {
        match self {
            RiskLevel::Safe => 1,
            RiskLevel::Read => 3,
            RiskLevel::Write => 5,
            RiskLevel::Destructive => 8,
            RiskLevel::Dangerous => 10,
        }
    }

    /// Stable lowercase name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Read => "read",
            RiskLevel::Write => "write",
            RiskLevel::Destructive => "destructive",
            RiskLevel::Dangerous => "dangerous",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================
// Audit
// ============================================================

/// Outcome recorded for a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    /// The call was forwarded to the upstream.
    Allowed,
    /// The call was refused before reaching the upstream.
    Denied,
}

impl AuditDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditDecision::Allowed => "allowed",
            AuditDecision::Denied => "denied",
        }
    }
}

/// One append-only audit record. Entries are never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Random 128-bit identifier, assigned by the sink.
    pub id: Uuid,
    /// Wall-clock time the entry was logged, assigned by the sink.
    pub timestamp: DateTime<Utc>,
    /// The upstream server the call targeted, if known.
    pub server: Option<String>,
    /// Tool name.
    pub tool: String,
    /// Tool arguments (redacted before storage when a redactor is configured).
    pub args: Option<serde_json::Value>,
    /// Risk classification from the policy decision.
    pub risk_level: RiskLevel,
    /// Whether the call was allowed or denied.
    pub decision: AuditDecision,
    /// Session grant that satisfied the call, if one matched.
    pub session_id: Option<String>,
    /// Round-trip duration in milliseconds, when the call completed.
    pub duration_ms: Option<u64>,
    /// Error message for failed or denied calls.
    pub error: Option<String>,
}

/// An audit record before the sink assigns `id` and `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub server: Option<String>,
    pub tool: String,
    pub args: Option<serde_json::Value>,
    pub risk_level: RiskLevel,
    pub decision: AuditDecision,
    pub session_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl NewAuditEntry {
    /// Minimal entry for a decision on `tool`.
    pub fn decision(
        server: Option<&str>,
        tool: &str,
        risk_level: RiskLevel,
        decision: AuditDecision,
    ) -> Self {
        Self {
            server: server.map(String::from),
            tool: tool.to_string(),
            args: None,
            risk_level,
            decision,
            session_id: None,
            duration_ms: None,
            error: None,
        }
    }
}

/// Filters for audit queries. All present fields are ANDed together.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Entries at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Entries strictly before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Exact server match.
    pub server: Option<String>,
    /// Exact tool match.
    pub tool: Option<String>,
    /// Exact risk level match.
    pub risk_level: Option<RiskLevel>,
    /// Exact decision match.
    pub decision: Option<AuditDecision>,
    /// Maximum number of entries to return (> 0).
    pub limit: Option<usize>,
}

/// Aggregate statistics over audit entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
    pub by_risk_level: HashMap<String, u64>,
    pub by_server: HashMap<String, u64>,
    /// Top 10 tool names by count; ties keep insertion order.
    pub top_tools: Vec<(String, u64)>,
}

// ============================================================
// Approval
// ============================================================

/// Session grant duration presets, as they appear on the webhook wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDuration {
    #[serde(rename = "once")]
    Once,
    #[serde(rename = "5min")]
    FiveMin,
    #[serde(rename = "15min")]
    FifteenMin,
    #[serde(rename = "session")]
    Session,
}

/// A request for out-of-band approval of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request identifier.
    pub id: String,
    /// When the request was created (ISO-8601 on the wire).
    pub timestamp: DateTime<Utc>,
    /// The upstream server the call targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Tool name.
    pub tool: String,
    /// Tool arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    /// Risk classification from the policy decision.
    pub risk_level: RiskLevel,
    /// Why approval is being requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Decision returned by an approval handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Whether the call may proceed.
    pub approved: bool,
    /// Optional grant duration so matching future calls skip the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<SessionDuration>,
    /// Free-form reason from the approver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalResponse {
    /// A denial with the given reason.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            session_duration: None,
            reason: Some(reason.into()),
        }
    }
}

// ============================================================
// Tool Descriptors & Shadowing Reports
// ============================================================

/// A tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for the tool's input. An absent schema reads as an empty
    /// mapping so fingerprints agree with the registration default.
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Severity of a shadowing detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the detector recommends the proxy do about a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendedAction {
    Allow,
    Prompt,
    Deny,
}

/// The specific shadowing condition that was detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShadowingKind {
    /// The same tool name is exposed by multiple servers.
    Collision {
        /// All servers exposing the name, sorted.
        servers: Vec<String>,
        /// True when every server's definition hashes identically.
        identical: bool,
    },
    /// A tool definition changed mid-session, or appeared without a
    /// registration.
    Mutation {
        /// Combined hash at registration time, if the tool was known.
        prev_hash: Option<String>,
        /// Combined hash of the definition seen now.
        curr_hash: String,
        /// True when the tool was never registered on this server.
        new_tool: bool,
    },
    /// The description (or the descriptor itself) looks hostile.
    SuspiciousDescription {
        /// Names of the patterns that matched.
        pattern_tags: Vec<String>,
    },
}

/// One shadowing detection with its severity and recommended handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowingReport {
    pub tool: String,
    pub kind: ShadowingKind,
    pub severity: ShadowingSeverity,
    pub recommended_action: RecommendedAction,
    pub message: String,
}

/// Aggregate report for one server registration batch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerShadowingReport {
    pub server: String,
    pub tools_registered: usize,
    pub reports: Vec<ShadowingReport>,
    /// True when the per-server registration rate limit suppressed the batch.
    pub rate_limited: bool,
}

impl ServerShadowingReport {
    /// Highest severity across all reports, if any.
    pub fn max_severity(&self) -> Option<ShadowingSeverity> {
        self.reports.iter().map(|r| r.severity).max()
    }
}

// ============================================================
// Circuit Breaker
// ============================================================

/// Circuit breaker states for upstream connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Healthy — calls flowing normally.
    Closed,
    /// Broken — calls rejected, waiting for the reset timeout.
    Open,
    /// Testing — calls allowed while recovery is confirmed.
    HalfOpen,
}

// ============================================================
// Proxy
// ============================================================

/// Proxy posture when policy or the upstream cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Allow best-effort.
    Open,
    /// Deny.
    Closed,
    /// Signal only; policy rules decide what counts as a read.
    Readonly,
}

/// Counter snapshot from one proxy core.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProxyStats {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub requests_timed_out: u64,
    pub messages_relayed: u64,
}

impl ProxyStats {
    /// Sum two snapshots, for orchestrator aggregation.
    pub fn merged(self, other: ProxyStats) -> ProxyStats {
        ProxyStats {
            requests_total: self.requests_total + other.requests_total,
            requests_failed: self.requests_failed + other.requests_failed,
            requests_timed_out: self.requests_timed_out + other.requests_timed_out,
            messages_relayed: self.messages_relayed + other.messages_relayed,
        }
    }
}
