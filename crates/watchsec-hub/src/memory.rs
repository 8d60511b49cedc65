//! In-memory collaborator double used by the hub's unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use watchsec_core::types::{
    AuditRecord, DashboardSession, MailLogRecord, SecurityEvent, Tenant, TenantId,
};

use crate::error::PersistError;
use crate::ports::{AuditLog, EventStore, FrameStore, MailStore, SessionVerifier, TenantDirectory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFrame {
    pub agent_id: String,
    pub date: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct MemoryBackend {
    tenants: Mutex<HashMap<String, Tenant>>,
    sessions: Mutex<HashMap<String, DashboardSession>>,
    audits: Mutex<Vec<AuditRecord>>,
    events: Mutex<Vec<SecurityEvent>>,
    mails: Mutex<Vec<MailLogRecord>>,
    frames: Mutex<Vec<SavedFrame>>,
    fail_lookups: AtomicBool,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    pub fn add_tenant(&self, name: &str, api_key: &str) -> TenantId {
        let mut tenants = self.tenants.lock().unwrap();
        let id = tenants.len() as TenantId + 1;
        tenants.insert(
            api_key.to_string(),
            Tenant {
                id,
                name: name.to_string(),
            },
        );
        id
    }

    pub fn add_session(&self, token: &str, username: &str) {
        self.sessions.lock().unwrap().insert(
            token.to_string(),
            DashboardSession {
                username: username.to_string(),
                tenant_id: None,
            },
        );
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every write sleep first.
    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    pub fn audits(&self) -> Vec<AuditRecord> {
        self.audits.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn mails(&self) -> Vec<MailLogRecord> {
        self.mails.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<SavedFrame> {
        self.frames.lock().unwrap().clone()
    }

    fn check_lookup(&self) -> Result<(), PersistError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("lookup disabled".into()));
        }
        Ok(())
    }

    async fn before_write(&self) -> Result<(), PersistError> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for MemoryBackend {
    async fn tenant_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>, PersistError> {
        self.check_lookup()?;
        Ok(self.tenants.lock().unwrap().get(api_key).cloned())
    }
}

#[async_trait]
impl SessionVerifier for MemoryBackend {
    async fn verify_session(&self, token: &str) -> Result<Option<DashboardSession>, PersistError> {
        self.check_lookup()?;
        Ok(self.sessions.lock().unwrap().get(token).cloned())
    }
}

#[async_trait]
impl AuditLog for MemoryBackend {
    async fn append_audit(&self, record: AuditRecord) -> Result<(), PersistError> {
        self.before_write().await?;
        self.audits.lock().unwrap().push(record);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryBackend {
    async fn insert_security_event(&self, event: SecurityEvent) -> Result<(), PersistError> {
        self.before_write().await?;
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn recent_security_events(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, PersistError> {
        self.check_lookup()?;
        let mut events: Vec<SecurityEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }
}

#[async_trait]
impl MailStore for MemoryBackend {
    async fn insert_mail_log(&self, record: MailLogRecord) -> Result<(), PersistError> {
        self.before_write().await?;
        self.mails.lock().unwrap().push(record);
        Ok(())
    }
}

#[async_trait]
impl FrameStore for MemoryBackend {
    async fn save_frame(
        &self,
        agent_id: &str,
        date: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PersistError> {
        self.before_write().await?;
        self.frames.lock().unwrap().push(SavedFrame {
            agent_id: agent_id.to_string(),
            date: date.to_string(),
            filename: filename.to_string(),
            bytes,
        });
        Ok(())
    }
}
