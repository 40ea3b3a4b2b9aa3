//! Embedded SQLite persistence for session grants.
//!
//! Write-through backend for [`SessionCache`](crate::session::SessionCache):
//! the in-memory cache stays authoritative, the store makes grants survive a
//! restart. Migrations are additive column changes only.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::info;

use overwatch_types::errors::OverwatchError;
use overwatch_types::records::RiskLevel;

use crate::session::{GrantAudit, GrantRevocation, GrantScope, SessionGrant};

/// Migration for the `sessions` table and its indexes.
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    pattern TEXT NOT NULL,
    server TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    approver TEXT,
    tool_name TEXT,
    tool_args TEXT,
    risk_level TEXT,
    reason TEXT,
    source TEXT,
    use_count INTEGER NOT NULL DEFAULT 0,
    last_used_at INTEGER,
    revoked_at INTEGER,
    revoked_by TEXT,
    revoke_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions (expires_at);
CREATE INDEX IF NOT EXISTS idx_sessions_server ON sessions (server);
CREATE INDEX IF NOT EXISTS idx_sessions_scope ON sessions (scope);
CREATE INDEX IF NOT EXISTS idx_sessions_approver ON sessions (approver);
CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions (created_at);
"#;

/// Run the session migrations against the given pool.
pub async fn run_session_migrations(pool: &SqlitePool) -> Result<(), OverwatchError> {
    sqlx::raw_sql(CREATE_SESSIONS_TABLE)
        .execute(pool)
        .await
        .map_err(|e| OverwatchError::Database(format!("failed to run session migrations: {e}")))?;
    info!("sessions table and indexes created or already exist");
    Ok(())
}

/// SQLite-backed grant persistence.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (or create) the store at `path` and run migrations.
    pub async fn open(path: &str) -> Result<Self, OverwatchError> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| OverwatchError::Database(format!("failed to open session store: {e}")))?;
        run_session_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool. The caller runs [`run_session_migrations`].
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a freshly created grant.
    pub async fn insert(&self, grant: &SessionGrant) -> Result<(), OverwatchError> {
        let audit = grant.audit.clone().unwrap_or_default();
        let tool_args = audit
            .tool_args
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(OverwatchError::from)?;

        sqlx::query(
            r#"INSERT INTO sessions
               (id, scope, pattern, server, created_at, expires_at,
                approver, tool_name, tool_args, risk_level, reason, source,
                use_count, last_used_at, revoked_at, revoked_by, revoke_reason)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&grant.id)
        .bind(grant.scope.as_str())
        .bind(&grant.pattern)
        .bind(&grant.server)
        .bind(grant.created_at.timestamp_millis())
        .bind(grant.expires_at.timestamp_millis())
        .bind(&audit.approver)
        .bind(&audit.tool_name)
        .bind(tool_args)
        .bind(audit.risk_level.map(|r| r.as_str().to_string()))
        .bind(&audit.reason)
        .bind(&audit.source)
        .bind(grant.use_count as i64)
        .bind(grant.last_used_at.map(|t| t.timestamp_millis()))
        .bind(grant.revocation.as_ref().map(|r| r.revoked_at.timestamp_millis()))
        .bind(grant.revocation.as_ref().and_then(|r| r.revoked_by.clone()))
        .bind(grant.revocation.as_ref().and_then(|r| r.reason.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| OverwatchError::Database(format!("failed to insert grant: {e}")))?;
        Ok(())
    }

    /// Record a consumed approval.
    pub async fn record_use(
        &self,
        id: &str,
        use_count: u64,
        last_used_at: DateTime<Utc>,
    ) -> Result<(), OverwatchError> {
        sqlx::query("UPDATE sessions SET use_count = ?, last_used_at = ? WHERE id = ?")
            .bind(use_count as i64)
            .bind(last_used_at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OverwatchError::Database(format!("failed to record grant use: {e}")))?;
        Ok(())
    }

    /// Stamp a revocation.
    pub async fn record_revocation(
        &self,
        id: &str,
        revocation: &GrantRevocation,
    ) -> Result<(), OverwatchError> {
        sqlx::query(
            "UPDATE sessions SET revoked_at = ?, revoked_by = ?, revoke_reason = ?
             WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(revocation.revoked_at.timestamp_millis())
        .bind(&revocation.revoked_by)
        .bind(&revocation.reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OverwatchError::Database(format!("failed to record revocation: {e}")))?;
        Ok(())
    }

    /// Load unexpired, unrevoked grants in creation order.
    pub async fn load_active(&self, now: DateTime<Utc>) -> Result<Vec<SessionGrant>, OverwatchError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions
             WHERE expires_at > ? AND revoked_at IS NULL
             ORDER BY created_at ASC",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OverwatchError::Database(format!("failed to load grants: {e}")))?;

        rows.iter().map(row_to_grant).collect()
    }

    /// Delete expired rows. Returns the count removed.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, OverwatchError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| OverwatchError::Database(format!("failed to prune grants: {e}")))?;
        Ok(result.rows_affected())
    }
}

fn row_to_grant(row: &sqlx::sqlite::SqliteRow) -> Result<SessionGrant, OverwatchError> {
    let scope_text: String = row.get("scope");
    let scope = match scope_text.as_str() {
        "exact" => GrantScope::Exact,
        "tool" => GrantScope::Tool,
        "server" => GrantScope::Server,
        other => {
            return Err(OverwatchError::Session(format!("unknown grant scope: {other}")));
        }
    };

    let created_at = millis_to_utc(row.get("created_at"))?;
    let expires_at = millis_to_utc(row.get("expires_at"))?;
    let last_used_at = row
        .get::<Option<i64>, _>("last_used_at")
        .map(millis_to_utc)
        .transpose()?;

    let tool_args: Option<String> = row.get("tool_args");
    let risk_level: Option<String> = row.get("risk_level");
    let audit = GrantAudit {
        approver: row.get("approver"),
        tool_name: row.get("tool_name"),
        tool_args: tool_args
            .map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(|e| OverwatchError::Session(format!("bad tool_args json: {e}")))?,
        risk_level: risk_level
            .map(|r| match r.as_str() {
                "safe" => Ok(RiskLevel::Safe),
                "read" => Ok(RiskLevel::Read),
                "write" => Ok(RiskLevel::Write),
                "destructive" => Ok(RiskLevel::Destructive),
                "dangerous" => Ok(RiskLevel::Dangerous),
                other => Err(OverwatchError::Session(format!("unknown risk level: {other}"))),
            })
            .transpose()?,
        reason: row.get("reason"),
        source: row.get("source"),
    };
    let has_audit = audit.approver.is_some()
        || audit.tool_name.is_some()
        || audit.tool_args.is_some()
        || audit.risk_level.is_some()
        || audit.reason.is_some()
        || audit.source.is_some();

    let revocation = row
        .get::<Option<i64>, _>("revoked_at")
        .map(|ms| -> Result<GrantRevocation, OverwatchError> {
            Ok(GrantRevocation {
                revoked_at: millis_to_utc(ms)?,
                revoked_by: row.get("revoked_by"),
                reason: row.get("revoke_reason"),
            })
        })
        .transpose()?;

    Ok(SessionGrant {
        id: row.get("id"),
        scope,
        pattern: row.get("pattern"),
        server: row.get("server"),
        created_at,
        expires_at,
        audit: has_audit.then_some(audit),
        use_count: row.get::<i64, _>("use_count") as u64,
        last_used_at,
        revocation,
    })
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, OverwatchError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| OverwatchError::Session(format!("bad timestamp {ms}")))
}
