//! Declarative policy engine.
//!
//! Loading path: validate → compile → expose. A set containing any validation
//! error is never made active; evaluations always see either the old compiled
//! set or the new one, never a mix.
//!
//! Evaluation for `(server, tool, args)` walks the server's rules in
//! declaration order: path rules first (deny wins over allow), then a static
//! rule action, then fall-through to risk inference on the tool name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use regex::Regex;
use tracing::{debug, info, warn};

use overwatch_types::config::{
    IssueSeverity, OverwatchConfig, PolicyRuleConfig, ValidationIssue,
};
use overwatch_types::errors::OverwatchError;
use overwatch_types::records::RiskLevel;

// ============================================================
// Decisions
// ============================================================

/// A rule's configured action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Prompt,
    Deny,
    /// Defer to path matching, then to name inference.
    Smart,
}

/// The engine's verdict for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Allow,
    Prompt,
    Deny,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: DecisionAction,
    pub risk_level: RiskLevel,
    pub reason: String,
    /// Description of the rule that decided, when one did.
    pub matched_rule: Option<String>,
}

/// Argument keys treated as filesystem paths.
const PATH_KEYS: &[&str] = &["path", "file", "filename", "filepath", "directory", "dir"];

/// Characters never allowed in a tool pattern.
const FORBIDDEN_PATTERN_CHARS: &[char] = &['<', '>', '"', '|', ';', '`', '$'];

// ============================================================
// Compiled form
// ============================================================

struct CompiledRule {
    /// Empty means the rule is global (matches every tool).
    tool_patterns: Vec<Regex>,
    action: Option<PolicyAction>,
    path_allow: Vec<Regex>,
    path_deny: Vec<Regex>,
    /// Surfaced as `matched_rule` in decisions.
    description: String,
}

impl CompiledRule {
    fn matches_tool(&self, tool: &str) -> bool {
        self.tool_patterns.is_empty() || self.tool_patterns.iter().any(|p| p.is_match(tool))
    }
}

struct CompiledPolicy {
    default_action: DecisionAction,
    servers: HashMap<String, Vec<CompiledRule>>,
}

impl CompiledPolicy {
    fn empty() -> Self {
        Self {
            default_action: DecisionAction::Prompt,
            servers: HashMap::new(),
        }
    }
}

// ============================================================
// Engine
// ============================================================

/// One instance per process, shared by all proxy cores.
pub struct PolicyEngine {
    active: RwLock<Arc<CompiledPolicy>>,
    /// Compiled glob regexes, cached by pattern text.
    pattern_cache: Mutex<HashMap<String, Regex>>,
    /// In strict mode, warnings also refuse the load.
    strict: bool,
}

impl PolicyEngine {
    /// An engine with no rules: every call falls through to name inference
    /// with a `prompt` default.
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(CompiledPolicy::empty())),
            pattern_cache: Mutex::new(HashMap::new()),
            strict: false,
        }
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    /// Validate and apply a configuration document.
    ///
    /// On validation errors (or warnings in strict mode) the previous set
    /// stays active and the issues are returned. On success the compiled set
    /// is swapped atomically and any warnings are returned.
    pub fn load(&self, config: &OverwatchConfig) -> Result<Vec<ValidationIssue>, Vec<ValidationIssue>> {
        let issues = validate_config(config);
        let refused = issues.iter().any(|i| {
            i.is_error() || (self.strict && i.severity == IssueSeverity::Warning)
        });
        if refused {
            warn!(
                issues = issues.len(),
                "refusing to apply policy set with validation failures"
            );
            return Err(issues);
        }

        let compiled = self.compile(config);
        *self.active.write().expect("policy lock poisoned") = Arc::new(compiled);
        info!(
            servers = config.servers.len(),
            warnings = issues.len(),
            "policy set applied"
        );
        Ok(issues)
    }

    /// Synchronous admin reload from a YAML file.
    pub fn reload_from_path(&self, path: &std::path::Path) -> Result<Vec<ValidationIssue>, OverwatchError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OverwatchError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = OverwatchConfig::from_yaml(&text)?;
        self.load(&config).map_err(|issues| {
            OverwatchError::Policy(format!(
                "policy set rejected: {}",
                issues
                    .iter()
                    .filter(|i| i.is_error())
                    .map(|i| format!("{} ({})", i.message, i.code))
                    .collect::<Vec<_>>()
                    .join("; ")
            ))
        })
    }

    /// Evaluate one invocation.
    pub fn evaluate(
        &self,
        server: &str,
        tool: &str,
        args: Option<&serde_json::Value>,
    ) -> Decision {
        let compiled = self.active.read().expect("policy lock poisoned").clone();
        let path = args.and_then(extract_path);

        if let Some(rules) = compiled.servers.get(server) {
            for rule in rules {
                if !rule.matches_tool(tool) {
                    continue;
                }

                if let Some(ref path) = path {
                    if rule.path_deny.iter().any(|p| p.is_match(path)) {
                        debug!(server, tool, path, "deny path matched");
                        return Decision {
                            action: DecisionAction::Deny,
                            risk_level: RiskLevel::Dangerous,
                            reason: "deny path".to_string(),
                            matched_rule: Some(rule.description.clone()),
                        };
                    }
                    if rule.path_allow.iter().any(|p| p.is_match(path)) {
                        debug!(server, tool, path, "allow path matched");
                        return Decision {
                            action: DecisionAction::Allow,
                            risk_level: RiskLevel::Safe,
                            reason: "allow path".to_string(),
                            matched_rule: Some(rule.description.clone()),
                        };
                    }
                }

                match rule.action {
                    Some(PolicyAction::Allow) => {
                        return Decision {
                            action: DecisionAction::Allow,
                            risk_level: RiskLevel::Write,
                            reason: "allowed by rule".to_string(),
                            matched_rule: Some(rule.description.clone()),
                        }
                    }
                    Some(PolicyAction::Prompt) => {
                        return Decision {
                            action: DecisionAction::Prompt,
                            risk_level: RiskLevel::Write,
                            reason: "rule requires approval".to_string(),
                            matched_rule: Some(rule.description.clone()),
                        }
                    }
                    Some(PolicyAction::Deny) => {
                        return Decision {
                            action: DecisionAction::Deny,
                            risk_level: RiskLevel::Write,
                            reason: "denied by rule".to_string(),
                            matched_rule: Some(rule.description.clone()),
                        }
                    }
                    // Smart and action-less rules fall through.
                    Some(PolicyAction::Smart) | None => {}
                }
            }
        }

        infer_by_name(tool, compiled.default_action)
    }

    // ── Compilation ──────────────────────────────────────────

    fn compile(&self, config: &OverwatchConfig) -> CompiledPolicy {
        let default_action = match config.defaults.action.as_str() {
            "allow" => DecisionAction::Allow,
            "deny" => DecisionAction::Deny,
            _ => DecisionAction::Prompt,
        };

        let mut servers = HashMap::new();
        for (name, server) in &config.servers {
            let rules = server
                .policies
                .iter()
                .map(|rule| self.compile_rule(rule))
                .collect();
            servers.insert(name.clone(), rules);
        }
        CompiledPolicy {
            default_action,
            servers,
        }
    }

    fn compile_rule(&self, rule: &PolicyRuleConfig) -> CompiledRule {
        let tool_patterns = rule
            .tools
            .0
            .iter()
            .filter_map(|glob| self.compile_glob(glob))
            .collect();
        let path_allow = rule
            .paths
            .allow
            .iter()
            .filter_map(|glob| self.compile_glob(glob))
            .collect();
        let path_deny = rule
            .paths
            .deny
            .iter()
            .filter_map(|glob| self.compile_glob(glob))
            .collect();
        let description = rule.description.clone().unwrap_or_else(|| {
            if rule.tools.0.is_empty() {
                "global rule".to_string()
            } else {
                format!("rule for {}", rule.tools.0.join(", "))
            }
        });
        CompiledRule {
            tool_patterns,
            action: rule.action.as_deref().and_then(parse_action),
            path_allow,
            path_deny,
            description,
        }
    }

    /// Compile a glob through the shared cache.
    fn compile_glob(&self, glob: &str) -> Option<Regex> {
        let mut cache = self.pattern_cache.lock().expect("pattern cache poisoned");
        if let Some(regex) = cache.get(glob) {
            return Some(regex.clone());
        }
        match Regex::new(&glob_to_regex_source(glob)) {
            Ok(regex) => {
                cache.insert(glob.to_string(), regex.clone());
                Some(regex)
            }
            Err(e) => {
                // Validation rejects uncompilable patterns before load; this
                // only fires for sets applied without validation.
                warn!(glob, error = %e, "skipping uncompilable pattern");
                None
            }
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_action(text: &str) -> Option<PolicyAction> {
    match text {
        "allow" => Some(PolicyAction::Allow),
        "prompt" => Some(PolicyAction::Prompt),
        "deny" => Some(PolicyAction::Deny),
        "smart" => Some(PolicyAction::Smart),
        _ => None,
    }
}

/// Translate a glob into an anchored regex: escape metacharacters, then
/// `*` → `.*` and `?` → `.`.
fn glob_to_regex_source(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if regex_syntax_char(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|'
    )
}

/// First path-typed argument value, if any.
fn extract_path(args: &serde_json::Value) -> Option<String> {
    for key in PATH_KEYS {
        if let Some(value) = args.get(key).and_then(|v| v.as_str()) {
            return Some(value.to_string());
        }
    }
    None
}

/// Risk inference on the lowercased tool name when no rule decided.
fn infer_by_name(tool: &str, default_action: DecisionAction) -> Decision {
    let lower = tool.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if contains_any(&["delete", "remove", "drop", "truncate"]) {
        Decision {
            action: DecisionAction::Prompt,
            risk_level: RiskLevel::Destructive,
            reason: "tool name suggests a destructive operation".to_string(),
            matched_rule: None,
        }
    } else if contains_any(&["write", "create", "update", "insert", "modify", "set"]) {
        Decision {
            action: DecisionAction::Prompt,
            risk_level: RiskLevel::Write,
            reason: "tool name suggests a write operation".to_string(),
            matched_rule: None,
        }
    } else if contains_any(&["read", "get", "list", "search", "find", "query"]) {
        Decision {
            action: DecisionAction::Allow,
            risk_level: RiskLevel::Read,
            reason: "tool name suggests a read operation".to_string(),
            matched_rule: None,
        }
    } else {
        Decision {
            action: default_action,
            risk_level: RiskLevel::Write,
            reason: "no matching rule, default action".to_string(),
            matched_rule: None,
        }
    }
}

// ============================================================
// Validation
// ============================================================

/// The full validation rule set. Both the config loader and the engine use
/// this one table, so the two entry points cannot diverge.
pub fn validate_config(config: &OverwatchConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if config.version != 1 {
        issues.push(ValidationIssue::error(
            "INVALID_VERSION",
            format!("unsupported config version {} (expected 1)", config.version),
        ));
    }

    if parse_default_action(&config.defaults.action).is_none() {
        issues.push(ValidationIssue::error(
            "INVALID_DEFAULT_ACTION",
            format!(
                "default action '{}' is not one of allow, prompt, deny",
                config.defaults.action
            ),
        ));
    }

    for (name, server) in &config.servers {
        if server.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
            issues.push(ValidationIssue::error(
                "MISSING_COMMAND",
                format!("server '{name}' has no upstream command"),
            ));
        }

        for (index, rule) in server.policies.iter().enumerate() {
            validate_rule(name, index, rule, &mut issues);
        }
    }

    issues
}

fn parse_default_action(text: &str) -> Option<DecisionAction> {
    match text {
        "allow" => Some(DecisionAction::Allow),
        "prompt" => Some(DecisionAction::Prompt),
        "deny" => Some(DecisionAction::Deny),
        _ => None,
    }
}

fn validate_rule(
    server: &str,
    index: usize,
    rule: &PolicyRuleConfig,
    issues: &mut Vec<ValidationIssue>,
) {
    let at = format!("server '{server}' rule #{index}");

    if let Some(ref action) = rule.action {
        if parse_action(action).is_none() {
            issues.push(ValidationIssue::error(
                "INVALID_POLICY_ACTION",
                format!("{at}: action '{action}' is not one of allow, prompt, deny, smart"),
            ));
        }
    }

    for pattern in &rule.tools.0 {
        if pattern.is_empty() {
            issues.push(ValidationIssue::error(
                "INVALID_TOOL_PATTERN",
                format!("{at}: empty tool pattern"),
            ));
        } else if pattern.chars().count() > 256 {
            issues.push(ValidationIssue::error(
                "INVALID_TOOL_PATTERN",
                format!("{at}: tool pattern exceeds 256 characters"),
            ));
        } else if pattern.contains(FORBIDDEN_PATTERN_CHARS) {
            issues.push(ValidationIssue::error(
                "INVALID_TOOL_PATTERN",
                format!("{at}: tool pattern '{pattern}' contains a forbidden character"),
            ));
        } else if Regex::new(&glob_to_regex_source(pattern)).is_err() {
            issues.push(ValidationIssue::error(
                "INVALID_TOOL_PATTERN",
                format!("{at}: tool pattern '{pattern}' failed to compile"),
            ));
        }
    }

    for pattern in rule.paths.allow.iter().chain(rule.paths.deny.iter()) {
        if pattern.is_empty() {
            issues.push(ValidationIssue::error(
                "INVALID_PATH_PATTERN",
                format!("{at}: empty path pattern"),
            ));
        } else if pattern.chars().count() > 1024 {
            issues.push(ValidationIssue::error(
                "INVALID_PATH_PATTERN",
                format!("{at}: path pattern exceeds 1024 characters"),
            ));
        } else if pattern.contains('\0') {
            issues.push(ValidationIssue::error(
                "INVALID_PATH_PATTERN",
                format!("{at}: path pattern contains NUL"),
            ));
        }
    }

    if rule.analyzer.is_some() {
        issues.push(ValidationIssue::warning(
            "DEPRECATED_ANALYZER",
            format!("{at}: legacy analyzer field is ignored"),
        ));
    }

    if rule.action.is_none() && rule.paths.is_empty() && rule.tools.0.is_empty() {
        issues.push(ValidationIssue::warning(
            "EMPTY_POLICY",
            format!("{at}: rule defines no action, no paths, and no tools"),
        ));
    }

    for allow in &rule.paths.allow {
        for deny in &rule.paths.deny {
            if strip_glob(allow) == strip_glob(deny) {
                issues.push(ValidationIssue::warning(
                    "CONFLICTING_PATHS",
                    format!("{at}: allow '{allow}' and deny '{deny}' cover the same path"),
                ));
            }
        }
    }
}

/// Strip trailing wildcard/separator noise so `/tmp`, `/tmp/` and `/tmp/*`
/// compare as the same covered path.
fn strip_glob(pattern: &str) -> &str {
    pattern.trim_end_matches('*').trim_end_matches('/')
}

// ============================================================
// Tests
// ============================================================
