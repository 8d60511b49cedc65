use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a tenant row in the relational store.
pub type TenantId = i64;

/// A tenant resolved from an agent's API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
}

/// A dashboard login established outside the hub (JWT issuance lives in the
/// API layer); the hub only verifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSession {
    pub username: String,
    pub tenant_id: Option<TenantId>,
}

/// Role a hub connection was admitted with. Fixed for the connection lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ConnectionRole {
    Dashboard { username: String },
    Agent { tenant_id: TenantId },
}

impl ConnectionRole {
    pub fn is_dashboard(&self) -> bool {
        matches!(self, ConnectionRole::Dashboard { .. })
    }

    /// Short label used in logs and in the `Connected` handshake reply.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionRole::Dashboard { .. } => "dashboard",
            ConnectionRole::Agent { .. } => "agent",
        }
    }
}

/// Security event raised by an agent. Persisted once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

/// One intercepted message, written when a DATA block completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailLogRecord {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body_preview: String,
    pub timestamp: DateTime<Utc>,
}

/// Audit trail entry appended before any operator command leaves the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub tenant_id: TenantId,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Audit entry for an operator command sent to `agent_id`.
    pub fn for_command(
        tenant_id: TenantId,
        actor: &str,
        agent_id: &str,
        command: &str,
        target: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            actor: actor.to_string(),
            action: format!("Execute Command: {command}"),
            target: agent_id.to_string(),
            details: format!("Target: {}", target.unwrap_or("")),
            timestamp,
        }
    }
}
