//! SQLite persistence for tenants, dashboard sessions, audit entries,
//! security events and intercepted mail.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};
use tokio::sync::Mutex;

use watchsec_core::types::{
    AuditRecord, DashboardSession, MailLogRecord, SecurityEvent, Tenant, TenantId,
};

use crate::error::{PersistError, StoreError};
use crate::ports::{AuditLog, EventStore, MailStore, SessionVerifier, TenantDirectory};

/// Synchronous sqlite store. Wrap it in [`SqliteBackend`] for async callers.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given filesystem path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Create the schema if it does not already exist.
    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenants (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                name     TEXT NOT NULL,
                api_key  TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS dashboard_sessions (
                token      TEXT PRIMARY KEY,
                username   TEXT NOT NULL,
                tenant_id  INTEGER
            );
            CREATE TABLE IF NOT EXISTS audit_logs (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id  INTEGER NOT NULL,
                actor      TEXT NOT NULL,
                action     TEXT NOT NULL,
                target     TEXT NOT NULL,
                details    TEXT NOT NULL,
                timestamp  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS security_events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id   TEXT NOT NULL,
                type       TEXT NOT NULL,
                details    TEXT NOT NULL,
                timestamp  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS security_events_agent
                ON security_events (agent_id, timestamp);
            CREATE TABLE IF NOT EXISTS mail_logs (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                sender        TEXT NOT NULL,
                recipient     TEXT NOT NULL,
                subject       TEXT NOT NULL DEFAULT '',
                body_preview  TEXT NOT NULL,
                timestamp     TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Insert a tenant, or rename the tenant that already owns `api_key`.
    pub fn upsert_tenant(&self, name: &str, api_key: &str) -> Result<TenantId> {
        self.conn.execute(
            "INSERT INTO tenants (name, api_key) VALUES (?1, ?2)
             ON CONFLICT(api_key) DO UPDATE SET name = excluded.name",
            params![name, api_key],
        )?;
        self.conn.query_row(
            "SELECT id FROM tenants WHERE api_key = ?1",
            params![api_key],
            |row| row.get(0),
        )
    }

    pub fn tenant_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>> {
        self.conn
            .query_row(
                "SELECT id, name FROM tenants WHERE api_key = ?1",
                params![api_key],
                |row| {
                    Ok(Tenant {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    pub fn insert_session(
        &self,
        token: &str,
        username: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO dashboard_sessions (token, username, tenant_id)
             VALUES (?1, ?2, ?3)",
            params![token, username, tenant_id],
        )?;
        Ok(())
    }

    pub fn session_by_token(&self, token: &str) -> Result<Option<DashboardSession>> {
        self.conn
            .query_row(
                "SELECT username, tenant_id FROM dashboard_sessions WHERE token = ?1",
                params![token],
                |row| {
                    Ok(DashboardSession {
                        username: row.get(0)?,
                        tenant_id: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    pub fn append_audit(&self, rec: &AuditRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit_logs (tenant_id, actor, action, target, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.tenant_id,
                rec.actor,
                rec.action,
                rec.target,
                rec.details,
                rec.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT tenant_id, actor, action, target, details, timestamp
             FROM audit_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ts: String = row.get(5)?;
            Ok(AuditRecord {
                tenant_id: row.get(0)?,
                actor: row.get(1)?,
                action: row.get(2)?,
                target: row.get(3)?,
                details: row.get(4)?,
                timestamp: parse_ts(&ts),
            })
        })?;
        rows.collect()
    }

    pub fn insert_security_event(&self, ev: &SecurityEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO security_events (agent_id, type, details, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![ev.agent_id, ev.event_type, ev.details, ev.timestamp.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent security events for one agent, newest first.
    pub fn recent_security_events(&self, agent_id: &str, limit: usize) -> Result<Vec<SecurityEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, type, details, timestamp FROM security_events
             WHERE agent_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, limit as i64], |row| {
            let ts: String = row.get(3)?;
            Ok(SecurityEvent {
                agent_id: row.get(0)?,
                event_type: row.get(1)?,
                details: row.get(2)?,
                timestamp: parse_ts(&ts),
            })
        })?;
        rows.collect()
    }

    pub fn insert_mail_log(&self, rec: &MailLogRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO mail_logs (sender, recipient, subject, body_preview, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                rec.sender,
                rec.recipient,
                rec.subject,
                rec.body_preview,
                rec.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent intercepted messages, newest first.
    pub fn recent_mail_logs(&self, limit: usize) -> Result<Vec<MailLogRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT sender, recipient, subject, body_preview, timestamp
             FROM mail_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ts: String = row.get(4)?;
            Ok(MailLogRecord {
                sender: row.get(0)?,
                recipient: row.get(1)?,
                subject: row.get(2)?,
                body_preview: row.get(3)?,
                timestamp: parse_ts(&ts),
            })
        })?;
        rows.collect()
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ---------------------------------------------------------------------------
// Async adapter
// ---------------------------------------------------------------------------

/// Shares one [`Store`] between async tasks; every call runs on the blocking
/// pool.
#[derive(Clone)]
pub struct SqliteBackend {
    store: Arc<Mutex<Store>>,
}

impl SqliteBackend {
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    pub fn open(path: &Path) -> std::result::Result<Self, StoreError> {
        Ok(Self::new(Store::open(path)?))
    }

    /// Run `f` against the store on a blocking thread.
    pub async fn with_store<T, F>(&self, f: F) -> std::result::Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let value = tokio::task::spawn_blocking(move || {
            let guard = store.blocking_lock();
            f(&guard)
        })
        .await??;
        Ok(value)
    }
}

#[async_trait]
impl TenantDirectory for SqliteBackend {
    async fn tenant_by_api_key(&self, api_key: &str) -> std::result::Result<Option<Tenant>, PersistError> {
        let key = api_key.to_string();
        Ok(self.with_store(move |s| s.tenant_by_api_key(&key)).await?)
    }
}

#[async_trait]
impl SessionVerifier for SqliteBackend {
    async fn verify_session(
        &self,
        token: &str,
    ) -> std::result::Result<Option<DashboardSession>, PersistError> {
        let token = token.to_string();
        Ok(self.with_store(move |s| s.session_by_token(&token)).await?)
    }
}

#[async_trait]
impl AuditLog for SqliteBackend {
    async fn append_audit(&self, record: AuditRecord) -> std::result::Result<(), PersistError> {
        Ok(self.with_store(move |s| s.append_audit(&record)).await?)
    }
}

#[async_trait]
impl EventStore for SqliteBackend {
    async fn insert_security_event(&self, event: SecurityEvent) -> std::result::Result<(), PersistError> {
        Ok(self.with_store(move |s| s.insert_security_event(&event)).await?)
    }

    async fn recent_security_events(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> std::result::Result<Vec<SecurityEvent>, PersistError> {
        let agent_id = agent_id.to_string();
        Ok(self
            .with_store(move |s| s.recent_security_events(&agent_id, limit))
            .await?)
    }
}

#[async_trait]
impl MailStore for SqliteBackend {
    async fn insert_mail_log(&self, record: MailLogRecord) -> std::result::Result<(), PersistError> {
        Ok(self.with_store(move |s| s.insert_mail_log(&record)).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(agent: &str, kind: &str, ts: DateTime<Utc>) -> SecurityEvent {
        SecurityEvent {
            agent_id: agent.into(),
            event_type: kind.into(),
            details: format!("{kind} details"),
            timestamp: ts,
        }
    }

    #[test]
    fn open_in_memory_creates_schema() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.tenant_by_api_key("missing").unwrap().is_none());
        assert!(store.recent_mail_logs(10).unwrap().is_empty());
    }

    #[test]
    fn tenant_lookup_by_api_key() {
        let store = Store::open_in_memory().unwrap();
        let id = store.upsert_tenant("Acme", "key-acme").unwrap();
        let tenant = store.tenant_by_api_key("key-acme").unwrap().unwrap();
        assert_eq!(tenant.id, id);
        assert_eq!(tenant.name, "Acme");
        assert!(store.tenant_by_api_key("key-other").unwrap().is_none());
    }

    #[test]
    fn upsert_tenant_keeps_id() {
        let store = Store::open_in_memory().unwrap();
        let first = store.upsert_tenant("Acme", "k").unwrap();
        let second = store.upsert_tenant("Acme Corp", "k").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.tenant_by_api_key("k").unwrap().unwrap().name, "Acme Corp");
    }

    #[test]
    fn session_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.insert_session("tok", "alice", Some(4)).unwrap();
        let session = store.session_by_token("tok").unwrap().unwrap();
        assert_eq!(session.username, "alice");
        assert_eq!(session.tenant_id, Some(4));
        assert!(store.session_by_token("nope").unwrap().is_none());
    }

    #[test]
    fn security_events_newest_first_per_agent() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        store.insert_security_event(&event("a1", "USB", t0)).unwrap();
        store
            .insert_security_event(&event("a1", "Process", t0 + Duration::seconds(5)))
            .unwrap();
        store.insert_security_event(&event("a2", "USB", t0)).unwrap();

        let events = store.recent_security_events("a1", 100).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "Process");
        assert_eq!(events[1].event_type, "USB");
        assert_eq!(store.recent_security_events("a1", 1).unwrap().len(), 1);
    }

    #[test]
    fn audit_and_mail_are_appended() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .append_audit(&AuditRecord::for_command(1, "root", "a1", "Restart", None, now))
            .unwrap();
        store
            .insert_mail_log(&MailLogRecord {
                sender: "a@x".into(),
                recipient: "b@y".into(),
                subject: "hi".into(),
                body_preview: "hello".into(),
                timestamp: now,
            })
            .unwrap();
        let audit = store.recent_audit(10).unwrap();
        assert_eq!(audit[0].action, "Execute Command: Restart");
        let mail = store.recent_mail_logs(10).unwrap();
        assert_eq!(mail[0].sender, "a@x");
        assert_eq!(mail[0].timestamp.timestamp(), now.timestamp());
    }

    #[test]
    fn file_backed_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");
        {
            let store = Store::open(&path).unwrap();
            store.upsert_tenant("Acme", "k").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert!(store.tenant_by_api_key("k").unwrap().is_some());
    }

    #[tokio::test]
    async fn backend_implements_collaborators() {
        let backend = SqliteBackend::new(Store::open_in_memory().unwrap());
        backend
            .with_store(|s| s.upsert_tenant("Acme", "k").map(|_| ()))
            .await
            .unwrap();

        let tenant = TenantDirectory::tenant_by_api_key(&backend, "k").await.unwrap();
        assert_eq!(tenant.unwrap().name, "Acme");

        backend
            .insert_security_event(event("a1", "USB", Utc::now()))
            .await
            .unwrap();
        let stored = backend
            .with_store(|s| s.recent_security_events("a1", 10))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }
}
