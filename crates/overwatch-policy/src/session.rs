//! Session grant cache.
//!
//! Remembers prior approvals as scoped, time-bounded, revocable grants so a
//! matching future call skips the prompt. Shared across proxy cores; all
//! mutations are serialized behind one `RwLock`, so a concurrent revoke can
//! never race a match into both succeeding on the same grant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use overwatch_types::records::{RiskLevel, SessionDuration};

use crate::session_store::SqliteSessionStore;

// ============================================================
// Grants
// ============================================================

/// What a grant covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantScope {
    /// Pattern must equal the tool name.
    Exact,
    /// Pattern is a `*`-glob over tool names.
    Tool,
    /// Every tool on the grant's server (or everywhere, if unconstrained).
    Server,
}

impl GrantScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantScope::Exact => "exact",
            GrantScope::Tool => "tool",
            GrantScope::Server => "server",
        }
    }
}

/// How long a grant lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantDuration {
    Once,
    FiveMin,
    FifteenMin,
    Session,
    Millis(u64),
}

impl From<SessionDuration> for GrantDuration {
    fn from(d: SessionDuration) -> Self {
        match d {
            SessionDuration::Once => GrantDuration::Once,
            SessionDuration::FiveMin => GrantDuration::FiveMin,
            SessionDuration::FifteenMin => GrantDuration::FifteenMin,
            SessionDuration::Session => GrantDuration::Session,
        }
    }
}

/// Approval metadata carried by a grant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantAudit {
    pub approver: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<serde_json::Value>,
    pub risk_level: Option<RiskLevel>,
    pub reason: Option<String>,
    pub source: Option<String>,
}

impl GrantAudit {
    fn is_empty(&self) -> bool {
        self.approver.is_none()
            && self.tool_name.is_none()
            && self.tool_args.is_none()
            && self.risk_level.is_none()
            && self.reason.is_none()
            && self.source.is_none()
    }
}

/// Revocation stamp. Set at most once per grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRevocation {
    pub revoked_at: DateTime<Utc>,
    pub revoked_by: Option<String>,
    pub reason: Option<String>,
}

/// One approval grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionGrant {
    /// 128-bit random identifier, hex.
    pub id: String,
    pub scope: GrantScope,
    pub pattern: String,
    /// When set, the grant only covers this server.
    pub server: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Approval metadata, present iff any audit option was given.
    pub audit: Option<GrantAudit>,
    /// Number of calls this grant has approved. Only mutated by `check`.
    pub use_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revocation: Option<GrantRevocation>,
}

impl SessionGrant {
    /// Active iff unexpired and unrevoked.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at && self.revocation.is_none()
    }
}

/// Options for [`SessionCache::create`].
#[derive(Debug, Clone)]
pub struct CreateGrantOptions {
    pub scope: GrantScope,
    pub pattern: String,
    pub duration: GrantDuration,
    pub server: Option<String>,
    pub approver: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<serde_json::Value>,
    pub risk_level: Option<RiskLevel>,
    pub reason: Option<String>,
    pub source: Option<String>,
}

impl CreateGrantOptions {
    /// A grant with only the required fields.
    pub fn new(scope: GrantScope, pattern: impl Into<String>, duration: GrantDuration) -> Self {
        Self {
            scope,
            pattern: pattern.into(),
            duration,
            server: None,
            approver: None,
            tool_name: None,
            tool_args: None,
            risk_level: None,
            reason: None,
            source: None,
        }
    }
}

/// Aggregate counters for the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub revoked: usize,
    /// Sum of `use_count` across all grants.
    pub total_approvals: u64,
    pub by_scope: HashMap<String, u64>,
    pub by_server: HashMap<String, u64>,
    pub last_cleanup: Option<DateTime<Utc>>,
}

// ============================================================
// Cache
// ============================================================

struct CacheState {
    /// Insertion order; matching scans newest first.
    grants: Vec<SessionGrant>,
    last_cleanup: Option<DateTime<Utc>>,
}

/// The shared grant cache.
pub struct SessionCache {
    state: RwLock<CacheState>,
    /// Lifetime of `session`-duration grants.
    session_duration: chrono::Duration,
    /// Optional write-through persistence. Store failures never fail a call.
    store: Option<Arc<SqliteSessionStore>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState {
                grants: Vec::new(),
                last_cleanup: None,
            }),
            session_duration: chrono::Duration::hours(24),
            store: None,
        }
    }

    /// Override the lifetime of `session`-duration grants.
    pub fn with_session_duration(mut self, duration: Duration) -> Self {
        self.session_duration =
            chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(24));
        self
    }

    /// Attach write-through persistence.
    pub fn with_store(mut self, store: Arc<SqliteSessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load active grants from the store into the cache.
    pub async fn hydrate(&self) -> Result<usize, overwatch_types::OverwatchError> {
        let Some(ref store) = self.store else {
            return Ok(0);
        };
        let grants = store.load_active(Utc::now()).await?;
        let count = grants.len();
        let mut state = self.state.write().await;
        state.grants = grants;
        info!(count, "hydrated session grants from store");
        Ok(count)
    }

    /// Find the first active grant covering `(tool, server)`, newest first.
    ///
    /// A match consumes one approval: `use_count` is incremented and
    /// `last_used_at` stamped at match time, regardless of whether the
    /// forwarded call later succeeds upstream.
    pub async fn check(&self, tool: &str, server: Option<&str>) -> Option<SessionGrant> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let grant = state
            .grants
            .iter_mut()
            .rev()
            .filter(|g| g.is_active(now))
            .find(|g| grant_matches(g, tool, server))?;

        grant.use_count += 1;
        grant.last_used_at = Some(now);
        let snapshot = grant.clone();
        drop(state);

        debug!(
            grant = %snapshot.id,
            tool,
            use_count = snapshot.use_count,
            "session grant matched"
        );
        if let Some(ref store) = self.store {
            if let Err(e) = store
                .record_use(&snapshot.id, snapshot.use_count, now)
                .await
            {
                error!(error = %e, "failed to persist grant usage");
            }
        }
        Some(snapshot)
    }

    /// Create a grant. `once` lives one second; `session` lives the
    /// configured session duration; numeric durations are milliseconds.
    pub async fn create(&self, options: CreateGrantOptions) -> SessionGrant {
        let now = Utc::now();
        let lifetime = match options.duration {
            GrantDuration::Once => chrono::Duration::seconds(1),
            GrantDuration::FiveMin => chrono::Duration::minutes(5),
            GrantDuration::FifteenMin => chrono::Duration::minutes(15),
            GrantDuration::Session => self.session_duration,
            GrantDuration::Millis(ms) => chrono::Duration::milliseconds(ms as i64),
        };

        let audit = GrantAudit {
            approver: options.approver,
            tool_name: options.tool_name,
            tool_args: options.tool_args,
            risk_level: options.risk_level,
            reason: options.reason,
            source: options.source,
        };
        let grant = SessionGrant {
            id: Uuid::new_v4().simple().to_string(),
            scope: options.scope,
            pattern: options.pattern,
            server: options.server,
            created_at: now,
            expires_at: now + lifetime,
            audit: (!audit.is_empty()).then_some(audit),
            use_count: 0,
            last_used_at: None,
            revocation: None,
        };

        self.state.write().await.grants.push(grant.clone());
        info!(
            grant = %grant.id,
            scope = grant.scope.as_str(),
            pattern = %grant.pattern,
            expires_at = %grant.expires_at,
            "session grant created"
        );
        if let Some(ref store) = self.store {
            if let Err(e) = store.insert(&grant).await {
                error!(error = %e, "failed to persist grant");
            }
        }
        grant
    }

    /// Revoke one grant by id. Returns false if unknown or already revoked.
    pub async fn revoke(&self, id: &str, by: Option<&str>, reason: Option<&str>) -> bool {
        let revocation = GrantRevocation {
            revoked_at: Utc::now(),
            revoked_by: by.map(String::from),
            reason: reason.map(String::from),
        };
        let mut state = self.state.write().await;
        let Some(grant) = state
            .grants
            .iter_mut()
            .find(|g| g.id == id && g.revocation.is_none())
        else {
            return false;
        };
        grant.revocation = Some(revocation.clone());
        let id = grant.id.clone();
        drop(state);

        info!(grant = %id, by = by.unwrap_or("-"), "session grant revoked");
        self.persist_revocation(&id, &revocation).await;
        true
    }

    /// Bulk-revoke active grants whose stored pattern equals `pattern`.
    pub async fn revoke_by_pattern(
        &self,
        pattern: &str,
        by: Option<&str>,
        reason: Option<&str>,
    ) -> usize {
        self.revoke_where(by, reason, |g| g.pattern == pattern).await
    }

    /// Bulk-revoke active grants whose server equals `server`.
    pub async fn revoke_by_server(
        &self,
        server: &str,
        by: Option<&str>,
        reason: Option<&str>,
    ) -> usize {
        self.revoke_where(by, reason, |g| g.server.as_deref() == Some(server))
            .await
    }

    /// Revoke every active grant.
    pub async fn revoke_all(&self, by: Option<&str>, reason: Option<&str>) -> usize {
        self.revoke_where(by, reason, |_| true).await
    }

    async fn revoke_where<F>(&self, by: Option<&str>, reason: Option<&str>, predicate: F) -> usize
    where
        F: Fn(&SessionGrant) -> bool,
    {
        let now = Utc::now();
        let revocation = GrantRevocation {
            revoked_at: now,
            revoked_by: by.map(String::from),
            reason: reason.map(String::from),
        };

        let mut revoked_ids = Vec::new();
        {
            let mut state = self.state.write().await;
            for grant in state
                .grants
                .iter_mut()
                .filter(|g| g.is_active(now) && predicate(g))
            {
                grant.revocation = Some(revocation.clone());
                revoked_ids.push(grant.id.clone());
            }
        }

        for id in &revoked_ids {
            self.persist_revocation(id, &revocation).await;
        }
        if !revoked_ids.is_empty() {
            info!(count = revoked_ids.len(), "bulk-revoked session grants");
        }
        revoked_ids.len()
    }

    /// Physically prune expired grants. Returns the count pruned.
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let before = state.grants.len();
        state.grants.retain(|g| now < g.expires_at);
        state.last_cleanup = Some(now);
        let pruned = before - state.grants.len();
        drop(state);

        if pruned > 0 {
            debug!(pruned, "pruned expired session grants");
        }
        if let Some(ref store) = self.store {
            if let Err(e) = store.prune_expired(now).await {
                error!(error = %e, "failed to prune expired grants from store");
            }
        }
        pruned
    }

    /// Active grants, newest first.
    pub async fn list(&self) -> Vec<SessionGrant> {
        let now = Utc::now();
        let state = self.state.read().await;
        state
            .grants
            .iter()
            .rev()
            .filter(|g| g.is_active(now))
            .cloned()
            .collect()
    }

    /// A grant by id, active or not.
    pub async fn get(&self, id: &str) -> Option<SessionGrant> {
        let state = self.state.read().await;
        state.grants.iter().find(|g| g.id == id).cloned()
    }

    pub async fn stats(&self) -> SessionStats {
        let now = Utc::now();
        let state = self.state.read().await;
        let mut stats = SessionStats {
            total: state.grants.len(),
            active: 0,
            expired: 0,
            revoked: 0,
            total_approvals: 0,
            by_scope: HashMap::new(),
            by_server: HashMap::new(),
            last_cleanup: state.last_cleanup,
        };
        for grant in &state.grants {
            if grant.is_active(now) {
                stats.active += 1;
            }
            if now >= grant.expires_at {
                stats.expired += 1;
            }
            if grant.revocation.is_some() {
                stats.revoked += 1;
            }
            stats.total_approvals += grant.use_count;
            *stats
                .by_scope
                .entry(grant.scope.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(ref server) = grant.server {
                *stats.by_server.entry(server.clone()).or_insert(0) += 1;
            }
        }
        stats
    }

    async fn persist_revocation(&self, id: &str, revocation: &GrantRevocation) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.record_revocation(id, revocation).await {
                error!(error = %e, "failed to persist grant revocation");
            }
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope matching. The server constraint applies to every scope.
fn grant_matches(grant: &SessionGrant, tool: &str, server: Option<&str>) -> bool {
    if let Some(ref grant_server) = grant.server {
        if server != Some(grant_server.as_str()) {
            return false;
        }
    }
    match grant.scope {
        GrantScope::Exact => grant.pattern == tool,
        GrantScope::Tool => tool_glob_matches(&grant.pattern, tool),
        GrantScope::Server => true,
    }
}

/// `*`-glob matching for tool-scope patterns: bare `*` matches all; a leading
/// and/or trailing `*` match suffix/prefix/substring; otherwise exact.
fn tool_glob_matches(pattern: &str, tool: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.starts_with('*'), pattern.ends_with('*')) {
        (true, true) => tool.contains(&pattern[1..pattern.len() - 1]),
        (true, false) => tool.ends_with(&pattern[1..]),
        (false, true) => tool.starts_with(&pattern[..pattern.len() - 1]),
        (false, false) => pattern == tool,
    }
}

// ============================================================
// Cleanup task
// ============================================================

/// Handle for the background cleanup tick. Aborting (or dropping) the handle
/// stops the task, so the cache never pins the process open.
pub struct CleanupTask {
    handle: JoinHandle<()>,
}

impl CleanupTask {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a periodic cleanup tick (default every 60 s).
///
/// The task holds only a `Weak` reference: dropping the cache ends the loop
/// on the next tick.
pub fn start_cleanup_task(cache: &Arc<SessionCache>, interval: Duration) -> CleanupTask {
    let weak = Arc::downgrade(cache);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(cache) = weak.upgrade() else { break };
            cache.cleanup().await;
        }
    });
    CleanupTask { handle }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(scope: GrantScope, pattern: &str, duration: GrantDuration) -> CreateGrantOptions {
        CreateGrantOptions::new(scope, pattern, duration)
    }

    // ── Grant honors and revokes ─────────────────────────────

    #[tokio::test]
    async fn test_grant_honored_then_revoked() {
        let cache = SessionCache::new();
        let grant = cache
            .create(opts(GrantScope::Tool, "read_*", GrantDuration::FiveMin))
            .await;

        let matched = cache.check("read_file", None).await.expect("should match");
        assert_eq!(matched.id, grant.id);
        assert_eq!(matched.use_count, 1);

        assert!(cache.revoke(&grant.id, Some("admin"), Some("policy change")).await);
        assert!(cache.check("read_file", None).await.is_none());

        let stored = cache.get(&grant.id).await.unwrap();
        let revocation = stored.revocation.unwrap();
        assert_eq!(revocation.revoked_by.as_deref(), Some("admin"));
        assert_eq!(revocation.reason.as_deref(), Some("policy change"));
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let cache = SessionCache::new();
        let grant = cache
            .create(opts(GrantScope::Exact, "t", GrantDuration::FiveMin))
            .await;
        assert!(cache.revoke(&grant.id, None, None).await);
        assert!(!cache.revoke(&grant.id, None, None).await);
        assert!(!cache.revoke("missing", None, None).await);
    }

    // ── Matching semantics ───────────────────────────────────

    #[tokio::test]
    async fn test_exact_scope() {
        let cache = SessionCache::new();
        cache
            .create(opts(GrantScope::Exact, "read_file", GrantDuration::FiveMin))
            .await;
        assert!(cache.check("read_file", None).await.is_some());
        assert!(cache.check("read_files", None).await.is_none());
    }

    #[tokio::test]
    async fn test_tool_scope_glob_forms() {
        let cache = SessionCache::new();
        cache
            .create(opts(GrantScope::Tool, "*", GrantDuration::FiveMin))
            .await;
        assert!(cache.check("anything", None).await.is_some());

        let cache = SessionCache::new();
        cache
            .create(opts(GrantScope::Tool, "read_*", GrantDuration::FiveMin))
            .await;
        assert!(cache.check("read_file", None).await.is_some());
        assert!(cache.check("write_file", None).await.is_none());

        let cache = SessionCache::new();
        cache
            .create(opts(GrantScope::Tool, "*_file", GrantDuration::FiveMin))
            .await;
        assert!(cache.check("read_file", None).await.is_some());
        assert!(cache.check("read_dir", None).await.is_none());

        let cache = SessionCache::new();
        cache
            .create(opts(GrantScope::Tool, "*file*", GrantDuration::FiveMin))
            .await;
        assert!(cache.check("read_file_v2", None).await.is_some());
        assert!(cache.check("read_dir", None).await.is_none());
    }

    #[tokio::test]
    async fn test_server_scope_and_constraint() {
        let cache = SessionCache::new();
        let mut options = opts(GrantScope::Server, "", GrantDuration::FiveMin);
        options.server = Some("fs".to_string());
        cache.create(options).await;

        assert!(cache.check("anything", Some("fs")).await.is_some());
        assert!(cache.check("anything", Some("web")).await.is_none());
        assert!(cache.check("anything", None).await.is_none());

        // Unconstrained server scope covers every server.
        let cache = SessionCache::new();
        cache
            .create(opts(GrantScope::Server, "", GrantDuration::FiveMin))
            .await;
        assert!(cache.check("anything", Some("web")).await.is_some());
        assert!(cache.check("anything", None).await.is_some());
    }

    #[tokio::test]
    async fn test_server_constraint_applies_to_tool_scope() {
        let cache = SessionCache::new();
        let mut options = opts(GrantScope::Tool, "read_*", GrantDuration::FiveMin);
        options.server = Some("fs".to_string());
        cache.create(options).await;

        assert!(cache.check("read_file", Some("fs")).await.is_some());
        assert!(cache.check("read_file", Some("web")).await.is_none());
    }

    #[tokio::test]
    async fn test_most_recent_grant_wins() {
        let cache = SessionCache::new();
        let older = cache
            .create(opts(GrantScope::Tool, "read_*", GrantDuration::FiveMin))
            .await;
        let newer = cache
            .create(opts(GrantScope::Exact, "read_file", GrantDuration::FiveMin))
            .await;

        let matched = cache.check("read_file", None).await.unwrap();
        assert_eq!(matched.id, newer.id);
        assert_ne!(matched.id, older.id);
    }

    #[tokio::test]
    async fn test_use_count_accumulates_per_match() {
        let cache = SessionCache::new();
        let grant = cache
            .create(opts(GrantScope::Exact, "t", GrantDuration::FiveMin))
            .await;
        for expected in 1..=3u64 {
            let matched = cache.check("t", None).await.unwrap();
            assert_eq!(matched.use_count, expected);
            assert!(matched.last_used_at.is_some());
        }
        // Non-matching checks do not touch the counter.
        assert!(cache.check("other", None).await.is_none());
        assert_eq!(cache.get(&grant.id).await.unwrap().use_count, 3);
    }

    // ── Durations & expiry ───────────────────────────────────

    #[tokio::test]
    async fn test_duration_mapping() {
        let cache = SessionCache::new();
        let once = cache
            .create(opts(GrantScope::Exact, "a", GrantDuration::Once))
            .await;
        assert_eq!(once.expires_at - once.created_at, chrono::Duration::seconds(1));

        let five = cache
            .create(opts(GrantScope::Exact, "b", GrantDuration::FiveMin))
            .await;
        assert_eq!(five.expires_at - five.created_at, chrono::Duration::minutes(5));

        let fifteen = cache
            .create(opts(GrantScope::Exact, "c", GrantDuration::FifteenMin))
            .await;
        assert_eq!(
            fifteen.expires_at - fifteen.created_at,
            chrono::Duration::minutes(15)
        );

        let session = cache
            .create(opts(GrantScope::Exact, "d", GrantDuration::Session))
            .await;
        assert_eq!(
            session.expires_at - session.created_at,
            chrono::Duration::hours(24)
        );

        let custom = cache
            .create(opts(GrantScope::Exact, "e", GrantDuration::Millis(2_500)))
            .await;
        assert_eq!(
            custom.expires_at - custom.created_at,
            chrono::Duration::milliseconds(2_500)
        );
    }

    #[tokio::test]
    async fn test_expired_grant_ignored_and_pruned() {
        let cache = SessionCache::new();
        cache
            .create(opts(GrantScope::Exact, "t", GrantDuration::Millis(0)))
            .await;

        assert!(cache.check("t", None).await.is_none());
        assert!(cache.list().await.is_empty());

        let pruned = cache.cleanup().await;
        assert_eq!(pruned, 1);
        assert_eq!(cache.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_grant_id_is_128_bit_hex() {
        let cache = SessionCache::new();
        let grant = cache
            .create(opts(GrantScope::Exact, "t", GrantDuration::Once))
            .await;
        assert_eq!(grant.id.len(), 32);
        assert!(grant.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_audit_block_only_with_audit_options() {
        let cache = SessionCache::new();
        let bare = cache
            .create(opts(GrantScope::Exact, "t", GrantDuration::Once))
            .await;
        assert!(bare.audit.is_none());

        let mut options = opts(GrantScope::Exact, "t", GrantDuration::Once);
        options.approver = Some("admin".to_string());
        options.risk_level = Some(RiskLevel::Write);
        let audited = cache.create(options).await;
        let audit = audited.audit.unwrap();
        assert_eq!(audit.approver.as_deref(), Some("admin"));
        assert_eq!(audit.risk_level, Some(RiskLevel::Write));
    }

    // ── Bulk revocation ──────────────────────────────────────

    #[tokio::test]
    async fn test_revoke_by_pattern() {
        let cache = SessionCache::new();
        cache
            .create(opts(GrantScope::Tool, "read_*", GrantDuration::FiveMin))
            .await;
        cache
            .create(opts(GrantScope::Tool, "read_*", GrantDuration::FiveMin))
            .await;
        cache
            .create(opts(GrantScope::Tool, "write_*", GrantDuration::FiveMin))
            .await;

        assert_eq!(cache.revoke_by_pattern("read_*", Some("admin"), None).await, 2);
        assert!(cache.check("read_file", None).await.is_none());
        assert!(cache.check("write_file", None).await.is_some());
        // Already revoked grants are not re-revoked.
        assert_eq!(cache.revoke_by_pattern("read_*", None, None).await, 0);
    }

    #[tokio::test]
    async fn test_revoke_by_server() {
        let cache = SessionCache::new();
        let mut fs_grant = opts(GrantScope::Server, "", GrantDuration::FiveMin);
        fs_grant.server = Some("fs".to_string());
        cache.create(fs_grant).await;
        cache
            .create(opts(GrantScope::Tool, "read_*", GrantDuration::FiveMin))
            .await;

        assert_eq!(cache.revoke_by_server("fs", None, None).await, 1);
        assert!(cache.check("x", Some("fs")).await.is_none());
        assert!(cache.check("read_file", None).await.is_some());
    }

    #[tokio::test]
    async fn test_revoke_all() {
        let cache = SessionCache::new();
        for i in 0..3 {
            cache
                .create(opts(
                    GrantScope::Exact,
                    &format!("t{i}"),
                    GrantDuration::FiveMin,
                ))
                .await;
        }
        assert_eq!(cache.revoke_all(Some("admin"), Some("lockdown")).await, 3);
        assert_eq!(cache.stats().await.revoked, 3);
    }

    // ── Stats ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stats() {
        let cache = SessionCache::new();
        let mut fs_grant = opts(GrantScope::Exact, "a", GrantDuration::FiveMin);
        fs_grant.server = Some("fs".to_string());
        cache.create(fs_grant).await;
        cache
            .create(opts(GrantScope::Tool, "read_*", GrantDuration::FiveMin))
            .await;
        let revoked = cache
            .create(opts(GrantScope::Server, "", GrantDuration::FiveMin))
            .await;

        cache.check("a", Some("fs")).await.unwrap();
        cache.check("read_x", None).await.unwrap();
        cache.check("read_y", None).await.unwrap();
        cache.revoke(&revoked.id, None, None).await;

        let stats = cache.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.revoked, 1);
        assert_eq!(stats.total_approvals, 3);
        assert_eq!(stats.by_scope["exact"], 1);
        assert_eq!(stats.by_scope["tool"], 1);
        assert_eq!(stats.by_scope["server"], 1);
        assert_eq!(stats.by_server["fs"], 1);
        assert!(stats.last_cleanup.is_none());

        cache.cleanup().await;
        assert!(cache.stats().await.last_cleanup.is_some());
    }

    // ── Cleanup task ─────────────────────────────────────────

    #[tokio::test]
    async fn test_cleanup_task_prunes_and_stops_with_cache() {
        let cache = Arc::new(SessionCache::new());
        cache
            .create(opts(GrantScope::Exact, "t", GrantDuration::Millis(0)))
            .await;

        let task = start_cleanup_task(&cache, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.stats().await.total, 0);
        drop(task);
    }

    #[tokio::test]
    async fn test_tool_glob_matches() {
        assert!(tool_glob_matches("*", "anything"));
        assert!(tool_glob_matches("read_*", "read_file"));
        assert!(!tool_glob_matches("read_*", "reread"));
        assert!(tool_glob_matches("*_file", "read_file"));
        assert!(tool_glob_matches("*file*", "my_file_tool"));
        assert!(tool_glob_matches("exact", "exact"));
        assert!(!tool_glob_matches("exact", "exactly"));
    }
}
