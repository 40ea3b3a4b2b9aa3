//! Declarative configuration document for the Overwatch proxy.
//!
//! The document is deliberately stringly-typed where the policy validation
//! table needs to report bad values (`defaults.action`, rule actions) instead
//! of failing at parse time. The policy engine compiles it into typed form
//! and owns the full validation rule set; the helpers here only describe the
//! document shape.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::OverwatchError;

/// Top-level configuration document. `version` must be 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverwatchConfig {
    /// Document schema version.
    pub version: i64,
    /// Global defaults applied when no rule decides.
    #[serde(default)]
    pub defaults: Defaults,
    /// Upstream servers keyed by name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Audit trail settings.
    #[serde(default)]
    pub audit: AuditConfig,
    /// Tool-shadowing detector settings.
    #[serde(default)]
    pub tool_shadowing: ShadowingConfig,
}

/// Global defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Default action when no rule matches: allow, prompt, or deny.
    #[serde(default = "default_action")]
    pub action: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Lifetime of "session" grants in milliseconds.
    #[serde(default = "default_session_duration_ms")]
    pub session_duration_ms: u64,
}

fn default_action() -> String {
    "prompt".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_session_duration_ms() -> u64 {
    24 * 60 * 60 * 1000
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            action: default_action(),
            timeout_ms: default_timeout_ms(),
            session_duration_ms: default_session_duration_ms(),
        }
    }
}

/// One upstream server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Command to spawn. Required; its absence is a validation error, not a
    /// parse error, so the whole document can be reported on at once.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides, merged in after the sanitizer blocklist.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Declarative rules, evaluated in order.
    #[serde(default)]
    pub policies: Vec<PolicyRuleConfig>,
}

/// One declarative policy rule.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyRuleConfig {
    /// Tool name globs this rule applies to. Empty means the rule is global.
    #[serde(default)]
    pub tools: ToolPatterns,
    /// allow, prompt, deny, or smart. None falls through to path matching and
    /// name inference.
    #[serde(default)]
    pub action: Option<String>,
    /// Path allow/deny globs tested against path-typed arguments.
    #[serde(default)]
    pub paths: PathRules,
    /// Human-readable rule description, surfaced as `matched_rule`.
    #[serde(default)]
    pub description: Option<String>,
    /// Legacy field from pre-1.0 documents; accepted but ignored.
    #[serde(default)]
    pub analyzer: Option<serde_json::Value>,
}

/// `tools:` accepts either a single glob string or a list.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ToolPatterns(pub Vec<String>);

impl<'de> Deserialize<'de> for ToolPatterns {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(s) => ToolPatterns(vec![s]),
            OneOrMany::Many(v) => ToolPatterns(v),
        })
    }
}

/// Path allow/deny lists.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl PathRules {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite database path; in-memory when absent.
    #[serde(default)]
    pub path: Option<String>,
    /// Run entries through the redactor before storage/export.
    #[serde(default = "default_true")]
    pub redact_pii: bool,
    /// Retention window in days; unlimited when absent.
    #[serde(default)]
    pub retention: Option<u32>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            redact_pii: true,
            retention: None,
        }
    }
}

/// Tool-shadowing detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub check_descriptions: bool,
    #[serde(default = "default_true")]
    pub detect_mutations: bool,
}

impl Default for ShadowingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_descriptions: true,
            detect_mutations: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A single validation finding. Errors refuse the document; warnings are
/// advisory unless strict mode is on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Stable machine code, e.g. `INVALID_TOOL_PATTERN`.
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
}

impl ValidationIssue {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: IssueSeverity::Error,
            message: message.into(),
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

impl OverwatchConfig {
    /// Parse a YAML document. Validation is a separate step owned by the
    /// policy engine.
    pub fn from_yaml(text: &str) -> Result<Self, OverwatchError> {
        serde_yaml::from_str(text)
            .map_err(|e| OverwatchError::Config(format!("failed to parse config document: {e}")))
    }
}
