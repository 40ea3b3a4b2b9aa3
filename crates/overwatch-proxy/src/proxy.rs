//! Per-server proxy core.
//!
//! One instance per upstream server. Owns the client transport, the spawned
//! child process, and the upstream transport bound to the child's stdio, and
//! drives all of them from a single task: every state transition happens
//! between I/O readiness events, so the pending table, circuit breaker, and
//! counters never race.
//!
//! Message flow (client → upstream): size limit → circuit breaker →
//! counters → notifications pass through → `tools/call` enters the security
//! pipeline (shadowing flags, policy, session grants, approval) → forward
//! with a per-request timer. Responses flow back upstream → client, feeding
//! the breaker and clearing timers. A periodic sweep reaps anything the
//! per-request timers miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use overwatch_policy::engine::{DecisionAction, PolicyEngine};
use overwatch_policy::session::{CreateGrantOptions, GrantScope, SessionCache};
use overwatch_security::audit::log_best_effort;
use overwatch_security::shadowing::ShadowingDetector;
use overwatch_types::errors::OverwatchError;
use overwatch_types::records::{
    ApprovalRequest, AuditDecision, FailMode, NewAuditEntry, ProxyStats, RecommendedAction,
    RiskLevel, ShadowingReport, ToolDescriptor,
};
use overwatch_types::rpc::{codes, request_key, tool_call_parts, JsonRpcMessage};
use overwatch_types::traits::{
    ApprovalHandler, AuditSink, ProxyTransport, TransportError, TransportEvent,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::env::inherited_environment;
use crate::transport::{FramedTransport, TransportLimits};

// ============================================================
// Configuration
// ============================================================

/// Per-core configuration.
#[derive(Debug, Clone)]
pub struct ProxyCoreConfig {
    pub server_name: String,
    /// Upstream command and arguments.
    pub command: String,
    pub args: Vec<String>,
    /// Operator env overrides, merged in after sanitization.
    pub env: HashMap<String, String>,
    pub fail_mode: FailMode,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Safety-net sweep period.
    pub sweep_interval: Duration,
    pub max_message_size: usize,
    pub breaker: CircuitBreakerConfig,
    pub recovery_enabled: bool,
    pub max_recovery_attempts: u32,
    /// SIGTERM grace before SIGKILL at shutdown.
    pub shutdown_grace: Duration,
}

impl ProxyCoreConfig {
    pub fn new(server_name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            fail_mode: FailMode::Closed,
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            max_message_size: 10 * 1024 * 1024,
            breaker: CircuitBreakerConfig::default(),
            recovery_enabled: true,
            max_recovery_attempts: 5,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Recovery backoff: `min(1000 · 2^(attempt-1), 16000)` ms for 1-based
/// attempts.
fn recovery_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let ms = 1_000u64.saturating_mul(1u64 << shift).min(16_000);
    Duration::from_millis(ms)
}

// ============================================================
// Events, commands, counters
// ============================================================

/// Typed fan-out from one core. Subscribers never reenter the state machine.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// A relayed message exceeded the size limit (upstream → client frames
    /// are forwarded anyway).
    MessageTooLarge { direction: Direction, size: usize },
    /// A frame-level transport fault.
    TransportFault { direction: Direction, error: String },
    UpstreamDown { fail_mode: FailMode },
    RecoveryAttempt { attempt: u32 },
    RecoverySuccess { attempt: u32 },
    RecoveryError { attempt: u32, error: String },
    RecoveryFailed,
    /// A shadowing detection surfaced during registration or a list refresh.
    ShadowingAlert(ShadowingReport),
    Warning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Control messages from the orchestrator.
pub enum ProxyCommand {
    Shutdown(oneshot::Sender<()>),
}

/// Shared counters; the orchestrator keeps a clone for `stats`.
#[derive(Default)]
pub struct ProxyCounters {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    requests_timed_out: AtomicU64,
    messages_relayed: AtomicU64,
}

impl ProxyCounters {
    pub fn snapshot(&self) -> ProxyStats {
        ProxyStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
        }
    }
}

// ============================================================
// Pending table
// ============================================================

enum PendingKind {
    Plain,
    ToolsList,
    ToolCall {
        tool: String,
        risk: RiskLevel,
        session_id: Option<String>,
    },
}

struct PendingRequest {
    id: serde_json::Value,
    started_at: Instant,
    deadline: Instant,
    timer: JoinHandle<()>,
    kind: PendingKind,
}

// ============================================================
// Dependencies
// ============================================================

/// Shared singletons handed to every core by the orchestrator.
#[derive(Clone)]
pub struct ProxyDeps {
    pub policy: Arc<PolicyEngine>,
    pub sessions: Arc<SessionCache>,
    pub audit: Arc<dyn AuditSink>,
    pub detector: Option<Arc<ShadowingDetector>>,
    pub approval: Arc<dyn ApprovalHandler>,
}

// ============================================================
// ProxyCore
// ============================================================

pub struct ProxyCore {
    config: ProxyCoreConfig,
    client: Box<dyn ProxyTransport>,
    upstream: Option<Box<dyn ProxyTransport>>,
    child: Option<tokio::process::Child>,
    deps: ProxyDeps,
    breaker: CircuitBreaker,
    pending: HashMap<String, PendingRequest>,
    counters: Arc<ProxyCounters>,
    events: broadcast::Sender<ProxyEvent>,
    timer_tx: mpsc::UnboundedSender<String>,
    timer_rx: mpsc::UnboundedReceiver<String>,
    /// Latest advertised tool definitions, for call-time mutation checks.
    advertised: HashMap<String, ToolDescriptor>,
    /// Tools flagged by the detector; the strongest recommendation wins.
    flagged: HashMap<String, RecommendedAction>,
    /// Whether this server's tools have been registered with the detector.
    registered: bool,
    shutting_down: bool,
}

enum Tick {
    Client(Option<TransportEvent>),
    Upstream(Option<TransportEvent>),
    Timeout(Option<String>),
    Sweep,
    Command(Option<ProxyCommand>),
}

async fn upstream_recv(upstream: &mut Option<Box<dyn ProxyTransport>>) -> Option<TransportEvent> {
    match upstream.as_mut() {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

impl ProxyCore {
    /// Build a core over an already-connected client transport. The upstream
    /// comes from [`start_upstream`](Self::start_upstream), or from
    /// [`set_upstream`](Self::set_upstream) in tests.
    pub fn new(config: ProxyCoreConfig, client: Box<dyn ProxyTransport>, deps: ProxyDeps) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            client,
            upstream: None,
            child: None,
            deps,
            breaker,
            pending: HashMap::new(),
            counters: Arc::new(ProxyCounters::default()),
            events,
            timer_tx,
            timer_rx,
            advertised: HashMap::new(),
            flagged: HashMap::new(),
            registered: false,
            shutting_down: false,
        }
    }

    pub fn counters(&self) -> Arc<ProxyCounters> {
        self.counters.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Attach a pre-built upstream transport (tests, embedding).
    pub fn set_upstream(&mut self, upstream: Box<dyn ProxyTransport>) {
        self.upstream = Some(upstream);
    }

    /// Spawn the upstream child with a sanitized environment and bind its
    /// stdio.
    pub async fn start_upstream(&mut self) -> Result<(), OverwatchError> {
        let env = inherited_environment(&self.config.env);
        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env_clear()
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            OverwatchError::Upstream(format!(
                "failed to spawn '{}' for server '{}': {e}",
                self.config.command, self.config.server_name
            ))
        })?;

        let limits = TransportLimits {
            max_message_size: self.config.max_message_size,
            ..TransportLimits::default()
        };
        let transport = FramedTransport::over_child(&mut child, limits)?;
        info!(
            server = %self.config.server_name,
            command = %self.config.command,
            pid = child.id().unwrap_or(0),
            "upstream child spawned"
        );
        self.child = Some(child);
        self.upstream = Some(Box::new(transport));
        Ok(())
    }

    /// Drive the core until shutdown. Consumes the core; control flows
    /// through `commands` and the event channel.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ProxyCommand>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            let tick = tokio::select! {
                event = self.client.recv() => Tick::Client(event),
                event = upstream_recv(&mut self.upstream) => Tick::Upstream(event),
                key = self.timer_rx.recv() => Tick::Timeout(key),
                _ = sweep.tick() => Tick::Sweep,
                command = commands.recv() => Tick::Command(command),
            };

            match tick {
                Tick::Client(Some(TransportEvent::Message(msg))) => {
                    self.handle_client_message(msg).await;
                }
                Tick::Client(Some(TransportEvent::Error(e))) => {
                    self.handle_transport_fault(Direction::ClientToUpstream, e);
                }
                Tick::Client(None) => {
                    info!(server = %self.config.server_name, "client stream closed");
                    self.shutdown().await;
                    return;
                }
                Tick::Upstream(Some(TransportEvent::Message(msg))) => {
                    self.handle_upstream_message(msg).await;
                }
                Tick::Upstream(Some(TransportEvent::Error(e))) => {
                    self.handle_transport_fault(Direction::UpstreamToClient, e);
                }
                Tick::Upstream(None) => {
                    self.handle_upstream_failure("upstream stream closed").await;
                }
                Tick::Timeout(Some(key)) => {
                    self.handle_request_timeout(&key, "request timed out").await;
                }
                Tick::Timeout(None) => {}
                Tick::Sweep => {
                    self.sweep_pending().await;
                }
                Tick::Command(Some(ProxyCommand::Shutdown(ack))) => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    return;
                }
                Tick::Command(None) => {}
            }

            if self.shutting_down {
                return;
            }
        }
    }

    // ── Client → upstream ────────────────────────────────────

    async fn handle_client_message(&mut self, msg: JsonRpcMessage) {
        // 1. Size limit on the serialized message.
        let serialized_len = serde_json::to_string(&msg).map(|s| s.len()).unwrap_or(0);
        if serialized_len > self.config.max_message_size {
            if msg.is_request() {
                self.reply_error(
                    msg.id.clone().unwrap_or_default(),
                    codes::REQUEST_TOO_LARGE,
                    format!(
                        "Request of {serialized_len} bytes exceeds limit of {}",
                        self.config.max_message_size
                    ),
                    None,
                )
                .await;
            }
            return;
        }

        // 2. Circuit breaker.
        if !self.breaker.can_execute() {
            if msg.is_request() {
                self.reply_error(
                    msg.id.clone().unwrap_or_default(),
                    codes::CIRCUIT_BREAKER_OPEN,
                    "Upstream temporarily unavailable: too many recent failures",
                    None,
                )
                .await;
            }
            return;
        }

        // 3. Count everything that passed the gates.
        self.counters.requests_total.fetch_add(1, Ordering::Relaxed);

        // 4. Notifications (and client-side responses) pass through.
        if !msg.is_request() {
            self.forward_untracked(msg).await;
            return;
        }

        // 5./6. Requests: tool calls enter the pipeline, the rest forward
        // with tracking.
        if msg.is_tool_call() {
            self.handle_tool_call(msg).await;
        } else {
            let kind = if msg.method.as_deref() == Some("tools/list") {
                PendingKind::ToolsList
            } else {
                PendingKind::Plain
            };
            self.forward_tracked(msg, kind).await;
        }
    }

    async fn handle_tool_call(&mut self, msg: JsonRpcMessage) {
        let Some((tool, args)) = tool_call_parts(msg.params.as_ref()) else {
            // Malformed tools/call params; let the upstream answer it.
            self.forward_tracked(msg, PendingKind::Plain).await;
            return;
        };
        let id = msg.id.clone().unwrap_or_default();
        let server = self.config.server_name.clone();

        // Shadowing: call-time mutation check against the registered
        // fingerprint, plus any standing flag from registration.
        let mut forced_prompt = false;
        if let Some(detector) = self.deps.detector.clone() {
            if let Some(descriptor) = self.advertised.get(&tool).cloned() {
                if let Some(report) = detector.check_for_mutation(&server, &descriptor) {
                    let action = report.recommended_action;
                    let reason = report.message.clone();
                    let _ = self.events.send(ProxyEvent::ShadowingAlert(report));
                    match action {
                        RecommendedAction::Deny => {
                            self.deny_tool_call(id, &tool, args, RiskLevel::Dangerous, &reason)
                                .await;
                            return;
                        }
                        RecommendedAction::Prompt => forced_prompt = true,
                        RecommendedAction::Allow => {}
                    }
                }
            }
            match self.flagged.get(&tool).copied() {
                Some(RecommendedAction::Deny) => {
                    self.deny_tool_call(
                        id,
                        &tool,
                        args,
                        RiskLevel::Dangerous,
                        "tool definition flagged by shadowing detector",
                    )
                    .await;
                    return;
                }
                Some(RecommendedAction::Prompt) => forced_prompt = true,
                _ => {}
            }
        }

        // Policy decision.
        let decision = self.deps.policy.evaluate(&server, &tool, args.as_ref());
        let mut session_id = None;

        let allowed = match (decision.action, forced_prompt) {
            (DecisionAction::Deny, _) => {
                self.deny_tool_call(id, &tool, args, decision.risk_level, &decision.reason)
                    .await;
                return;
            }
            (DecisionAction::Allow, false) => true,
            (DecisionAction::Allow, true) | (DecisionAction::Prompt, _) => {
                // Session grants short-circuit the prompt.
                if let Some(grant) = self.deps.sessions.check(&tool, Some(&server)).await {
                    debug!(tool = %tool, grant = %grant.id, "session grant satisfied prompt");
                    session_id = Some(grant.id);
                    true
                } else {
                    match self
                        .request_approval(&tool, args.clone(), decision.risk_level, &decision.reason)
                        .await
                    {
                        ApprovalOutcome::Approved { grant_id } => {
                            session_id = grant_id;
                            true
                        }
                        ApprovalOutcome::Denied { reason } => {
                            self.deny_tool_call(id, &tool, args, decision.risk_level, &reason)
                                .await;
                            return;
                        }
                    }
                }
            }
        };

        if allowed {
            log_best_effort(
                self.deps.audit.as_ref(),
                NewAuditEntry {
                    server: Some(server),
                    tool: tool.clone(),
                    args: args.clone(),
                    risk_level: decision.risk_level,
                    decision: AuditDecision::Allowed,
                    session_id: session_id.clone(),
                    duration_ms: None,
                    error: None,
                },
            )
            .await;
            self.forward_tracked(
                msg,
                PendingKind::ToolCall {
                    tool,
                    risk: decision.risk_level,
                    session_id,
                },
            )
            .await;
        }
    }

    async fn request_approval(
        &mut self,
        tool: &str,
        args: Option<serde_json::Value>,
        risk: RiskLevel,
        reason: &str,
    ) -> ApprovalOutcome {
        let request = ApprovalRequest {
            id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            server: Some(self.config.server_name.clone()),
            tool: tool.to_string(),
            args: args.clone(),
            risk_level: risk,
            reason: Some(reason.to_string()),
        };

        match self.deps.approval.request_approval(request).await {
            Ok(response) if response.approved => {
                let grant_id = match response.session_duration {
                    Some(duration) => {
                        let mut options = CreateGrantOptions::new(
                            GrantScope::Exact,
                            tool,
                            duration.into(),
                        );
                        options.server = Some(self.config.server_name.clone());
                        options.tool_name = Some(tool.to_string());
                        options.tool_args = args;
                        options.risk_level = Some(risk);
                        options.reason = response.reason.clone();
                        options.source = Some("approval".to_string());
                        Some(self.deps.sessions.create(options).await.id)
                    }
                    None => None,
                };
                ApprovalOutcome::Approved { grant_id }
            }
            Ok(response) => ApprovalOutcome::Denied {
                reason: response.reason.unwrap_or_else(|| "User denied".to_string()),
            },
            Err(e) => {
                warn!(
                    server = %self.config.server_name,
                    tool,
                    error = %e,
                    fail_mode = ?self.config.fail_mode,
                    "approval handler failed"
                );
                match self.config.fail_mode {
                    FailMode::Open => ApprovalOutcome::Approved { grant_id: None },
                    FailMode::Closed | FailMode::Readonly => ApprovalOutcome::Denied {
                        reason: "User denied".to_string(),
                    },
                }
            }
        }
    }

    /// Deny reply plus the denied audit entry, in that audit-first order.
    async fn deny_tool_call(
        &mut self,
        id: serde_json::Value,
        tool: &str,
        args: Option<serde_json::Value>,
        risk: RiskLevel,
        reason: &str,
    ) {
        log_best_effort(
            self.deps.audit.as_ref(),
            NewAuditEntry {
                server: Some(self.config.server_name.clone()),
                tool: tool.to_string(),
                args,
                risk_level: risk,
                decision: AuditDecision::Denied,
                session_id: None,
                duration_ms: None,
                error: Some(reason.to_string()),
            },
        )
        .await;
        self.reply_error(
            id,
            codes::TOOL_DENIED,
            format!("Tool call denied: {reason}"),
            Some(serde_json::json!({"riskLevel": risk.as_str()})),
        )
        .await;
    }

    // ── Forwarding ───────────────────────────────────────────

    async fn forward_untracked(&mut self, msg: JsonRpcMessage) {
        let Some(upstream) = self.upstream.as_mut() else {
            debug!("dropping message: no upstream");
            return;
        };
        if let Err(e) = upstream.send(msg).await {
            self.handle_upstream_failure(&format!("write error: {e}")).await;
            return;
        }
        self.counters.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    async fn forward_tracked(&mut self, msg: JsonRpcMessage, kind: PendingKind) {
        let Some(id) = msg.id.clone() else { return };
        let key = request_key(&id);

        // At most one in-flight entry per id.
        if self.pending.contains_key(&key) {
            self.reply_error(
                id,
                -32600,
                "Invalid request: duplicate request id",
                None,
            )
            .await;
            return;
        }

        if self.upstream.is_none() {
            self.reply_upstream_unavailable(id).await;
            return;
        }
        if let Some(upstream) = self.upstream.as_mut() {
            if let Err(e) = upstream.send(msg).await {
                let reason = format!("write error: {e}");
                self.reply_upstream_unavailable(id).await;
                self.handle_upstream_failure(&reason).await;
                return;
            }
        }
        self.counters.messages_relayed.fetch_add(1, Ordering::Relaxed);

        let timeout = self.config.request_timeout;
        let timer_tx = self.timer_tx.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(timer_key);
        });

        let now = Instant::now();
        self.pending.insert(
            key,
            PendingRequest {
                id,
                started_at: now,
                deadline: now + timeout,
                timer,
                kind,
            },
        );
    }

    // ── Upstream → client ────────────────────────────────────

    async fn handle_upstream_message(&mut self, msg: JsonRpcMessage) {
        let serialized_len = serde_json::to_string(&msg).map(|s| s.len()).unwrap_or(0);
        if serialized_len > self.config.max_message_size {
            // Forwarded anyway; surfaced for observers.
            let _ = self.events.send(ProxyEvent::MessageTooLarge {
                direction: Direction::UpstreamToClient,
                size: serialized_len,
            });
        }

        if msg.is_response() {
            if let Some(id) = msg.id.as_ref() {
                let key = request_key(id);
                if let Some(entry) = self.pending.remove(&key) {
                    entry.timer.abort();
                    self.breaker.record_success();
                    let elapsed = entry.started_at.elapsed();
                    debug!(
                        server = %self.config.server_name,
                        key = %key,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "upstream response relayed"
                    );
                    if let PendingKind::ToolsList = entry.kind {
                        self.process_tools_list(&msg);
                    }
                }
            }
        }

        if self.client.send(msg).await.is_err() {
            warn!(server = %self.config.server_name, "failed to relay to client");
            return;
        }
        self.counters.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Register or re-check advertised tools from a `tools/list` response.
    fn process_tools_list(&mut self, msg: &JsonRpcMessage) {
        let Some(tools) = msg
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
        else {
            return;
        };

        // Cache the advertised definitions for call-time checks.
        let mut descriptors = Vec::new();
        for raw in tools {
            if let Ok(descriptor) = serde_json::from_value::<ToolDescriptor>(raw.clone()) {
                descriptors.push(descriptor);
            }
        }

        if let Some(detector) = self.deps.detector.clone() {
            if !self.registered {
                let report = detector.register_tools(&self.config.server_name, tools);
                self.registered = true;
                info!(
                    server = %self.config.server_name,
                    tools = report.tools_registered,
                    findings = report.reports.len(),
                    "registered advertised tools"
                );
                for finding in report.reports {
                    self.note_flag(&finding);
                    let _ = self.events.send(ProxyEvent::ShadowingAlert(finding));
                }
            } else {
                // A later list is not re-registered: the original
                // fingerprints stay authoritative so a swap keeps alarming.
                for descriptor in &descriptors {
                    if let Some(report) =
                        detector.check_for_mutation(&self.config.server_name, descriptor)
                    {
                        self.note_flag(&report);
                        let _ = self.events.send(ProxyEvent::ShadowingAlert(report));
                    }
                }
            }
        }

        self.advertised = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
    }

    /// Remember the strongest recommendation per tool.
    fn note_flag(&mut self, report: &ShadowingReport) {
        let new = report.recommended_action;
        if new == RecommendedAction::Allow {
            return;
        }
        let entry = self.flagged.entry(report.tool.clone()).or_insert(new);
        if *entry == RecommendedAction::Prompt && new == RecommendedAction::Deny {
            *entry = new;
        }
    }

    // ── Timeouts ─────────────────────────────────────────────

    async fn handle_request_timeout(&mut self, key: &str, why: &str) {
        let Some(entry) = self.pending.remove(key) else {
            // Response or another completion path won the race.
            return;
        };
        entry.timer.abort();
        self.counters.requests_timed_out.fetch_add(1, Ordering::Relaxed);
        self.breaker.record_failure();
        warn!(
            server = %self.config.server_name,
            key,
            elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
            "request timed out"
        );

        if let PendingKind::ToolCall { tool, risk, session_id } = &entry.kind {
            log_best_effort(
                self.deps.audit.as_ref(),
                NewAuditEntry {
                    server: Some(self.config.server_name.clone()),
                    tool: tool.clone(),
                    args: None,
                    risk_level: *risk,
                    decision: AuditDecision::Denied,
                    session_id: session_id.clone(),
                    duration_ms: Some(entry.started_at.elapsed().as_millis() as u64),
                    error: Some(why.to_string()),
                },
            )
            .await;
        }
        self.reply_error(
            entry.id,
            codes::REQUEST_TIMEOUT,
            format!("No response within {:?}", self.config.request_timeout),
            None,
        )
        .await;
    }

    /// Safety net behind the per-request timers.
    async fn sweep_pending(&mut self) {
        let now = Instant::now();
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| now >= entry.deadline)
            .map(|(key, _)| key.clone())
            .collect();
        for key in overdue {
            self.handle_request_timeout(&key, "request reaped by sweep").await;
        }
    }

    // ── Upstream failure & recovery ──────────────────────────

    async fn handle_upstream_failure(&mut self, reason: &str) {
        if self.shutting_down {
            return;
        }
        warn!(
            server = %self.config.server_name,
            reason,
            fail_mode = ?self.config.fail_mode,
            "upstream failed"
        );
        self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(ProxyEvent::UpstreamDown {
            fail_mode: self.config.fail_mode,
        });

        // Close out every in-flight request per the fail mode.
        let entries: Vec<PendingRequest> = self.pending.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.timer.abort();
            match self.config.fail_mode {
                FailMode::Closed => {
                    self.reply_upstream_unavailable(entry.id).await;
                }
                FailMode::Readonly => {
                    let _ = self.events.send(ProxyEvent::Warning(format!(
                        "upstream down with request {} in flight",
                        request_key(&entry.id)
                    )));
                }
                FailMode::Open => {}
            }
        }

        // Tear down the dead upstream.
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close().await;
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }

        if self.config.recovery_enabled {
            self.attempt_recovery().await;
        }
    }

    async fn attempt_recovery(&mut self) {
        for attempt in 1..=self.config.max_recovery_attempts {
            if self.shutting_down {
                return;
            }
            tokio::time::sleep(recovery_delay(attempt)).await;
            let _ = self.events.send(ProxyEvent::RecoveryAttempt { attempt });
            info!(
                server = %self.config.server_name,
                attempt,
                "attempting upstream recovery"
            );

            // Kill whatever is left of the previous child before respawning.
            if let Some(mut child) = self.child.take() {
                let _ = child.start_kill();
            }
            if let Some(mut upstream) = self.upstream.take() {
                upstream.close().await;
            }

            match self.start_upstream().await {
                Ok(()) => {
                    info!(server = %self.config.server_name, attempt, "upstream recovered");
                    self.breaker.reset();
                    let _ = self.events.send(ProxyEvent::RecoverySuccess { attempt });
                    return;
                }
                Err(e) => {
                    warn!(
                        server = %self.config.server_name,
                        attempt,
                        error = %e,
                        "recovery attempt failed"
                    );
                    let _ = self.events.send(ProxyEvent::RecoveryError {
                        attempt,
                        error: e.to_string(),
                    });
                }
            }
        }
        error!(
            server = %self.config.server_name,
            attempts = self.config.max_recovery_attempts,
            "upstream recovery exhausted"
        );
        let _ = self.events.send(ProxyEvent::RecoveryFailed);
    }

    // ── Shutdown ─────────────────────────────────────────────

    /// Graceful, idempotent shutdown: cancel timers, answer every pending
    /// request, close both transports, then SIGTERM → (grace) → SIGKILL the
    /// child. Returns once the child has exited.
    pub async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(server = %self.config.server_name, "shutting down proxy core");

        let entries: Vec<PendingRequest> = self.pending.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.timer.abort();
            if let PendingKind::ToolCall { tool, risk, session_id } = &entry.kind {
                log_best_effort(
                    self.deps.audit.as_ref(),
                    NewAuditEntry {
                        server: Some(self.config.server_name.clone()),
                        tool: tool.clone(),
                        args: None,
                        risk_level: *risk,
                        decision: AuditDecision::Denied,
                        session_id: session_id.clone(),
                        duration_ms: Some(entry.started_at.elapsed().as_millis() as u64),
                        error: Some("server shutting down".to_string()),
                    },
                )
                .await;
            }
            self.reply_error(
                entry.id,
                codes::SERVER_SHUTTING_DOWN,
                "Proxy is shutting down",
                None,
            )
            .await;
        }

        self.client.close().await;
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close().await;
        }

        if let Some(mut child) = self.child.take() {
            terminate_child(&mut child, self.config.shutdown_grace).await;
        }
        self.deps.approval.close().await;
    }

    // ── Replies ──────────────────────────────────────────────

    async fn reply_error(
        &mut self,
        id: serde_json::Value,
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let reply = JsonRpcMessage::error_response(id, code, message, data);
        if let Err(e) = self.client.send(reply).await {
            warn!(server = %self.config.server_name, error = %e, "failed to send error reply");
        }
    }

    async fn reply_upstream_unavailable(&mut self, id: serde_json::Value) {
        self.reply_error(
            id,
            codes::UPSTREAM_UNAVAILABLE,
            "Upstream is not serving requests",
            None,
        )
        .await;
    }

    fn handle_transport_fault(&mut self, direction: Direction, fault: TransportError) {
        warn!(
            server = %self.config.server_name,
            ?direction,
            error = %fault,
            "transport fault"
        );
        let event = match fault {
            TransportError::MessageTooLarge { size, .. } => {
                ProxyEvent::MessageTooLarge { direction, size }
            }
            other => ProxyEvent::TransportFault {
                direction,
                error: other.to_string(),
            },
        };
        let _ = self.events.send(event);
    }
}

enum ApprovalOutcome {
    Approved { grant_id: Option<String> },
    Denied { reason: String },
}

/// SIGTERM, wait for the grace period, then SIGKILL.
async fn terminate_child(child: &mut tokio::process::Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "upstream child exited");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "failed to wait for upstream child");
        }
        Err(_) => {
            warn!("upstream child ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

// ============================================================
// Tests
// ============================================================
