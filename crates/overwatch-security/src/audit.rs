//! Append-only audit trail.
//!
//! Two backends behind the [`AuditSink`] trait:
//!
//! - [`InMemoryAuditSink`]: a `Vec<AuditEntry>` behind `Arc<RwLock>`, with
//!   live tail subscribers. The default, and the mock for other modules.
//! - [`SqliteAuditStore`]: embedded SQLite, append-only INSERT, indexed
//!   queries. Schema migrations are additive only.
//!
//! Both run entries through a [`Redactor`] before storage when one is
//! configured. Export helpers ([`export_json`], [`export_csv`],
//! [`export_cef`]) are synchronous functions over query results.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use overwatch_types::errors::OverwatchError;
use overwatch_types::records::{
    AuditDecision, AuditEntry, AuditFilter, AuditStats, NewAuditEntry, RiskLevel,
};
use overwatch_types::traits::AuditSink;

use crate::redact::Redactor;

// ============================================================
// SQL Migration
// ============================================================

/// Migration for the `audit_entries` table and its indexes.
pub const CREATE_AUDIT_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_entries (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    server TEXT,
    tool TEXT NOT NULL,
    args TEXT,
    risk_level TEXT NOT NULL,
    decision TEXT NOT NULL,
    session_id TEXT,
    duration INTEGER,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_entries_timestamp ON audit_entries (timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_entries_server ON audit_entries (server);
CREATE INDEX IF NOT EXISTS idx_audit_entries_risk_level ON audit_entries (risk_level);
CREATE INDEX IF NOT EXISTS idx_audit_entries_decision ON audit_entries (decision);
"#;

/// Run the audit migrations against the given pool.
pub async fn run_audit_migrations(pool: &SqlitePool) -> Result<(), OverwatchError> {
    sqlx::raw_sql(CREATE_AUDIT_ENTRIES_TABLE)
        .execute(pool)
        .await
        .map_err(|e| OverwatchError::Database(format!("failed to run audit migrations: {e}")))?;
    info!("audit_entries table and indexes created or already exist");
    Ok(())
}

// ============================================================
// Shared helpers
// ============================================================

fn finalize(entry: NewAuditEntry, redactor: Option<&Redactor>) -> AuditEntry {
    let (args, error) = match redactor {
        Some(r) => (
            entry.args.as_ref().map(|a| r.redact_value(a)),
            entry.error.as_deref().map(|e| r.redact_text(e)),
        ),
        None => (entry.args, entry.error),
    };
    AuditEntry {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        server: entry.server,
        tool: entry.tool,
        args,
        risk_level: entry.risk_level,
        decision: entry.decision,
        session_id: entry.session_id,
        duration_ms: entry.duration_ms,
        error,
    }
}

/// Check whether an entry matches the given filter criteria.
fn matches_filter(entry: &AuditEntry, filter: &AuditFilter) -> bool {
    if let Some(since) = filter.since {
        if entry.timestamp < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if entry.timestamp >= until {
            return false;
        }
    }
    if let Some(ref server) = filter.server {
        if entry.server.as_deref() != Some(server.as_str()) {
            return false;
        }
    }
    if let Some(ref tool) = filter.tool {
        if entry.tool != *tool {
            return false;
        }
    }
    if let Some(risk) = filter.risk_level {
        if entry.risk_level != risk {
            return false;
        }
    }
    if let Some(decision) = filter.decision {
        if entry.decision != decision {
            return false;
        }
    }
    true
}

/// Compute aggregate statistics over entries in insertion order.
fn compute_stats(entries: &[AuditEntry]) -> AuditStats {
    let mut stats = AuditStats {
        total: 0,
        allowed: 0,
        denied: 0,
        by_risk_level: Default::default(),
        by_server: Default::default(),
        top_tools: Vec::new(),
    };

    // Tool counts keep first-seen order so ties in the top-10 are stable.
    let mut tool_index: std::collections::HashMap<String, usize> = Default::default();
    let mut tool_counts: Vec<(String, u64)> = Vec::new();

    for entry in entries {
        stats.total += 1;
        match entry.decision {
            AuditDecision::Allowed => stats.allowed += 1,
            AuditDecision::Denied => stats.denied += 1,
        }
        *stats
            .by_risk_level
            .entry(entry.risk_level.as_str().to_string())
            .or_insert(0) += 1;
        if let Some(ref server) = entry.server {
            *stats.by_server.entry(server.clone()).or_insert(0) += 1;
        }
        match tool_index.get(&entry.tool) {
            Some(&i) => tool_counts[i].1 += 1,
            None => {
                tool_index.insert(entry.tool.clone(), tool_counts.len());
                tool_counts.push((entry.tool.clone(), 1));
            }
        }
    }

    // Stable sort: equal counts keep insertion order.
    tool_counts.sort_by(|a, b| b.1.cmp(&a.1));
    tool_counts.truncate(10);
    stats.top_tools = tool_counts;
    stats
}

// ============================================================
// InMemoryAuditSink
// ============================================================

/// In-memory audit sink with live tail subscribers.
#[derive(Clone)]
pub struct InMemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<AuditEntry>>>>,
    redactor: Option<Arc<Redactor>>,
}

impl std::fmt::Debug for InMemoryAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAuditSink")
            .field("redactor", &self.redactor.is_some())
            .finish_non_exhaustive()
    }
}

impl InMemoryAuditSink {
    /// Create a sink without redaction.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            redactor: None,
        }
    }

    /// Create a sink that redacts args and error strings before storage.
    pub fn with_redactor(redactor: Arc<Redactor>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            redactor: Some(redactor),
        }
    }

    /// Subscribe to a live tail of appended entries.
    ///
    /// Subscribers are notified in insertion order at append time; the send
    /// is non-blocking and a dropped receiver unsubscribes itself.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<AuditEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Snapshot of all stored entries in insertion order.
    pub async fn all_entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    /// Count of stored entries.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn log(&self, entry: NewAuditEntry) -> Result<AuditEntry, OverwatchError> {
        let entry = finalize(entry, self.redactor.as_deref());
        self.entries.write().await.push(entry.clone());

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|tx| tx.send(entry.clone()).is_ok());

        Ok(entry)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, OverwatchError> {
        let entries = self.entries.read().await;
        let mut results: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| matches_filter(e, filter))
            .cloned()
            .collect();

        // Newest first.
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        if let Some(limit) = filter.limit {
            if limit > 0 {
                results.truncate(limit);
            }
        }
        Ok(results)
    }

    async fn stats(&self, since: Option<DateTime<Utc>>) -> Result<AuditStats, OverwatchError> {
        let entries = self.entries.read().await;
        match since {
            Some(since) => {
                let bounded: Vec<AuditEntry> = entries
                    .iter()
                    .filter(|e| e.timestamp >= since)
                    .cloned()
                    .collect();
                Ok(compute_stats(&bounded))
            }
            None => Ok(compute_stats(&entries)),
        }
    }
}

// ============================================================
// SqliteAuditStore
// ============================================================

/// Embedded SQLite audit store.
///
/// Append-only: `log` performs INSERT only, never UPDATE or DELETE.
pub struct SqliteAuditStore {
    pool: SqlitePool,
    redactor: Option<Arc<Redactor>>,
}

impl SqliteAuditStore {
    /// Open (or create) the store at `path` and run migrations.
    pub async fn open(path: &str, redactor: Option<Arc<Redactor>>) -> Result<Self, OverwatchError> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| OverwatchError::Database(format!("failed to open audit store: {e}")))?;
        run_audit_migrations(&pool).await?;
        Ok(Self { pool, redactor })
    }

    /// Wrap an existing pool. The caller runs [`run_audit_migrations`].
    pub fn with_pool(pool: SqlitePool, redactor: Option<Arc<Redactor>>) -> Self {
        Self { pool, redactor }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry, OverwatchError> {
        let id: String = row.get("id");
        let timestamp_ms: i64 = row.get("timestamp");
        let args_text: Option<String> = row.get("args");
        let risk_text: String = row.get("risk_level");
        let decision_text: String = row.get("decision");
        let duration: Option<i64> = row.get("duration");

        let id = Uuid::parse_str(&id)
            .map_err(|e| OverwatchError::Audit(format!("bad audit entry id '{id}': {e}")))?;
        let timestamp = Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .ok_or_else(|| OverwatchError::Audit(format!("bad timestamp {timestamp_ms}")))?;
        let args = args_text
            .map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(|e| OverwatchError::Audit(format!("bad args json: {e}")))?;
        let risk_level = risk_level_from_str(&risk_text)?;
        let decision = decision_from_str(&decision_text)?;

        Ok(AuditEntry {
            id,
            timestamp,
            server: row.get("server"),
            tool: row.get("tool"),
            args,
            risk_level,
            decision,
            session_id: row.get("session_id"),
            duration_ms: duration.map(|d| d as u64),
            error: row.get("error"),
        })
    }
}

fn risk_level_from_str(s: &str) -> Result<RiskLevel, OverwatchError> {
    match s {
        "safe" => Ok(RiskLevel::Safe),
        "read" => Ok(RiskLevel::Read),
        "write" => Ok(RiskLevel::Write),
        "destructive" => Ok(RiskLevel::Destructive),
        "dangerous" => Ok(RiskLevel::Dangerous),
        other => Err(OverwatchError::Audit(format!("unknown risk level: {other}"))),
    }
}

fn decision_from_str(s: &str) -> Result<AuditDecision, OverwatchError> {
    match s {
        "allowed" => Ok(AuditDecision::Allowed),
        "denied" => Ok(AuditDecision::Denied),
        other => Err(OverwatchError::Audit(format!("unknown decision: {other}"))),
    }
}

#[async_trait]
impl AuditSink for SqliteAuditStore {
    async fn log(&self, entry: NewAuditEntry) -> Result<AuditEntry, OverwatchError> {
        let entry = finalize(entry, self.redactor.as_deref());
        let args_text = entry
            .args
            .as_ref()
            .map(|a| serde_json::to_string(a))
            .transpose()
            .map_err(OverwatchError::from)?;

        sqlx::query(
            r#"INSERT INTO audit_entries
               (id, timestamp, server, tool, args, risk_level, decision, session_id, duration, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.timestamp.timestamp_millis())
        .bind(&entry.server)
        .bind(&entry.tool)
        .bind(args_text)
        .bind(entry.risk_level.as_str())
        .bind(entry.decision.as_str())
        .bind(&entry.session_id)
        .bind(entry.duration_ms.map(|d| d as i64))
        .bind(&entry.error)
        .execute(&self.pool)
        .await
        .map_err(|e| OverwatchError::Database(format!("failed to insert audit entry: {e}")))?;

        Ok(entry)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, OverwatchError> {
        let mut conditions: Vec<&str> = Vec::new();
        if filter.since.is_some() {
            conditions.push("timestamp >= ?");
        }
        if filter.until.is_some() {
            conditions.push("timestamp < ?");
        }
        if filter.server.is_some() {
            conditions.push("server = ?");
        }
        if filter.tool.is_some() {
            conditions.push("tool = ?");
        }
        if filter.risk_level.is_some() {
            conditions.push("risk_level = ?");
        }
        if filter.decision.is_some() {
            conditions.push("decision = ?");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit_clause = match filter.limit {
            Some(limit) if limit > 0 => format!("LIMIT {limit}"),
            _ => String::new(),
        };
        let query_str = format!(
            "SELECT id, timestamp, server, tool, args, risk_level, decision, session_id, duration, error
             FROM audit_entries {where_clause} ORDER BY timestamp DESC {limit_clause}"
        );

        let mut query = sqlx::query(&query_str);
        if let Some(since) = filter.since {
            query = query.bind(since.timestamp_millis());
        }
        if let Some(until) = filter.until {
            query = query.bind(until.timestamp_millis());
        }
        if let Some(ref server) = filter.server {
            query = query.bind(server);
        }
        if let Some(ref tool) = filter.tool {
            query = query.bind(tool);
        }
        if let Some(risk) = filter.risk_level {
            query = query.bind(risk.as_str());
        }
        if let Some(decision) = filter.decision {
            query = query.bind(decision.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OverwatchError::Database(format!("failed to query audit entries: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(Self::row_to_entry(row)?);
        }
        Ok(entries)
    }

    async fn stats(&self, since: Option<DateTime<Utc>>) -> Result<AuditStats, OverwatchError> {
        // Stats are computed over the fetched window with the same helper the
        // in-memory sink uses, so both backends agree on tie-breaking.
        let query_str = match since {
            Some(_) => {
                "SELECT id, timestamp, server, tool, args, risk_level, decision, session_id, duration, error
                 FROM audit_entries WHERE timestamp >= ? ORDER BY timestamp ASC"
            }
            None => {
                "SELECT id, timestamp, server, tool, args, risk_level, decision, session_id, duration, error
                 FROM audit_entries ORDER BY timestamp ASC"
            }
        };
        let mut query = sqlx::query(query_str);
        if let Some(since) = since {
            query = query.bind(since.timestamp_millis());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OverwatchError::Database(format!("failed to query audit stats: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(Self::row_to_entry(row)?);
        }
        Ok(compute_stats(&entries))
    }
}

// ============================================================
// Export
// ============================================================

/// Pretty-printed JSON array.
pub fn export_json(entries: &[AuditEntry]) -> Result<String, OverwatchError> {
    serde_json::to_string_pretty(entries).map_err(OverwatchError::from)
}

/// CSV with a fixed header; every value is double-quoted, empty fields are
/// emitted as `""`, timestamps are ISO-8601 UTC.
pub fn export_csv(entries: &[AuditEntry]) -> String {
    let mut out = String::from("id,timestamp,server,tool,risk_level,decision,duration\n");
    for entry in entries {
        let fields = [
            entry.id.to_string(),
            entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            entry.server.clone().unwrap_or_default(),
            entry.tool.clone(),
            entry.risk_level.as_str().to_string(),
            entry.decision.as_str().to_string(),
            entry
                .duration_ms
                .map(|d| d.to_string())
                .unwrap_or_default(),
        ];
        let row: Vec<String> = fields
            .iter()
            .map(|f| format!("\"{}\"", f.replace('"', "\"\"")))
            .collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Common Event Format, one record per entry.
pub fn export_cef(entries: &[AuditEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let mut extension = format!(
            "rt={} cs1={} cs1Label=Tool",
            entry.timestamp.timestamp_millis(),
            cef_escape(&entry.tool),
        );
        if let Some(ref server) = entry.server {
            extension.push_str(&format!(" cs2={} cs2Label=Server", cef_escape(server)));
        }
        extension.push_str(&format!(" outcome={}", entry.decision.as_str()));

        out.push_str(&format!(
            "CEF:0|DotsetLabs|Overwatch|1.0|{}|MCP Tool Call|{}|{}\n",
            entry.risk_level.as_str(),
            entry.risk_level.cef_severity(),
            extension,
        ));
    }
    out
}

/// Escape CEF extension values (backslash, equals, newline).
fn cef_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('=', "\\=")
        .replace('\n', "\\n")
}

/// Log an entry, swallowing (but recording) sink failures.
///
/// Storage errors are non-fatal to request flow; callers on the hot path use
/// this wrapper instead of propagating.
pub async fn log_best_effort(sink: &dyn AuditSink, entry: NewAuditEntry) {
    if let Err(e) = sink.log(entry).await {
        error!(error = %e, "failed to write audit entry");
    }
}

// ============================================================
// Tests
// ============================================================
