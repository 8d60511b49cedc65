//! Collaborator interfaces the hub consumes.
//!
//! The relational store, the document store and the screenshot volume all
//! live behind these traits. Production wiring uses
//! [`crate::store::SqliteBackend`] and [`crate::frames::FsFrameStore`].

use async_trait::async_trait;

use watchsec_core::types::{AuditRecord, DashboardSession, MailLogRecord, SecurityEvent, Tenant};

use crate::error::PersistError;

/// Resolves an agent's tenant credential.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>, PersistError>;
}

/// Verifies a dashboard session token issued by the API layer.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify_session(&self, token: &str) -> Result<Option<DashboardSession>, PersistError>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append_audit(&self, record: AuditRecord) -> Result<(), PersistError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_security_event(&self, event: SecurityEvent) -> Result<(), PersistError>;

    /// Up to `limit` stored events for `agent_id`, newest first.
    async fn recent_security_events(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, PersistError>;
}

#[async_trait]
pub trait MailStore: Send + Sync {
    async fn insert_mail_log(&self, record: MailLogRecord) -> Result<(), PersistError>;
}

/// Blob storage for persisted screen frames.
#[async_trait]
pub trait FrameStore: Send + Sync {
    async fn save_frame(
        &self,
        agent_id: &str,
        date: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PersistError>;
}
