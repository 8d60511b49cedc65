//! Operator command routing. Audit first, deliver second.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use watchsec_core::config::CommandDelivery;
use watchsec_core::types::{AuditRecord, TenantId};

use crate::error::DispatchError;
use crate::gateway::ConnectionGateway;
use crate::ports::AuditLog;
use crate::protocol::{CommandPush, HubPush, KillPush};

/// An operator command, already authorised at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub agent_id: String,
    pub command: String,
    #[serde(default)]
    pub target: Option<String>,
    pub actor: String,
    pub tenant_id: TenantId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReceipt {
    pub delivery: CommandDelivery,
    /// Connections the command was queued for.
    pub delivered: usize,
}

pub struct CommandRouter {
    gateway: Arc<ConnectionGateway>,
    audit: Arc<dyn AuditLog>,
    delivery: CommandDelivery,
}

impl CommandRouter {
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        audit: Arc<dyn AuditLog>,
        delivery: CommandDelivery,
    ) -> Self {
        Self {
            gateway,
            audit,
            delivery,
        }
    }

    /// Append the audit record, then deliver. Nothing is delivered when the
    /// audit append fails.
    pub async fn dispatch(&self, req: CommandRequest) -> Result<DispatchReceipt, DispatchError> {
        let record = AuditRecord::for_command(
            req.tenant_id,
            &req.actor,
            &req.agent_id,
            &req.command,
            req.target.as_deref(),
            Utc::now(),
        );
        self.audit
            .append_audit(record)
            .await
            .map_err(DispatchError::Audit)?;

        let push = HubPush::ReceiveCommand(CommandPush {
            agent_id: req.agent_id.clone(),
            command: req.command.clone(),
            target: req.target.clone(),
        });
        let delivered = match self.delivery {
            CommandDelivery::Group => self.gateway.send_to_group(&req.agent_id, &push),
            CommandDelivery::Broadcast => self.gateway.broadcast_to_all(&push),
        };

        tracing::info!(
            agent_id = %req.agent_id,
            command = %req.command,
            actor = %req.actor,
            delivered,
            "commands: dispatched"
        );
        Ok(DispatchReceipt {
            delivery: self.delivery,
            delivered,
        })
    }

    /// Forward a dashboard kill request to the target agent's group.
    pub fn kill_process(&self, target_agent_id: &str, pid: u32) -> usize {
        let delivered = self
            .gateway
            .send_to_group(target_agent_id, &HubPush::KillProcess(KillPush { pid }));
        tracing::info!(agent_id = %target_agent_id, pid, delivered, "commands: kill process forwarded");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Admission;
    use crate::memory::MemoryBackend;
    use watchsec_core::types::ConnectionRole;

    fn request(agent: &str) -> CommandRequest {
        CommandRequest {
            agent_id: agent.into(),
            command: "LockScreen".into(),
            target: Some("session-1".into()),
            actor: "admin@acme".into(),
            tenant_id: 1,
        }
    }

    fn agent_in(group: &str) -> Admission {
        Admission {
            role: ConnectionRole::Agent { tenant_id: 1 },
            group: Some(group.into()),
        }
    }

    fn router(backend: &Arc<MemoryBackend>, delivery: CommandDelivery) -> (Arc<ConnectionGateway>, CommandRouter) {
        let gateway = Arc::new(ConnectionGateway::new(backend.clone(), backend.clone(), 8));
        let router = CommandRouter::new(gateway.clone(), backend.clone(), delivery);
        (gateway, router)
    }

    #[tokio::test]
    async fn group_delivery_reaches_only_target() {
        let backend = Arc::new(MemoryBackend::default());
        let (gateway, router) = router(&backend, CommandDelivery::Group);
        let (_, mut target) = gateway.register(&agent_in("a1"));
        let (_, mut other) = gateway.register(&agent_in("a2"));

        let receipt = router.dispatch(request("a1")).await.unwrap();
        assert_eq!(receipt.delivered, 1);

        let frame: serde_json::Value = serde_json::from_str(&target.recv().await.unwrap()).unwrap();
        assert_eq!(frame["method"], "ReceiveCommand");
        assert_eq!(frame["params"]["agentId"], "a1");
        assert_eq!(frame["params"]["target"], "session-1");
        assert!(other.try_recv().is_err());

        let audits = backend.audits();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, "Execute Command: LockScreen");
        assert_eq!(audits[0].target, "a1");
        assert_eq!(audits[0].details, "Target: session-1");
        assert_eq!(audits[0].actor, "admin@acme");
    }

    #[tokio::test]
    async fn broadcast_delivery_reaches_everyone() {
        let backend = Arc::new(MemoryBackend::default());
        let (gateway, router) = router(&backend, CommandDelivery::Broadcast);
        let (_, mut a1) = gateway.register(&agent_in("a1"));
        let (_, mut a2) = gateway.register(&agent_in("a2"));

        let receipt = router.dispatch(request("a1")).await.unwrap();
        assert_eq!(receipt.delivered, 2);
        assert!(a1.try_recv().is_ok());
        assert!(a2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn audit_failure_blocks_delivery() {
        let backend = Arc::new(MemoryBackend::default());
        backend.fail_writes(true);
        let (gateway, router) = router(&backend, CommandDelivery::Group);
        let (_, mut target) = gateway.register(&agent_in("a1"));

        let err = router.dispatch(request("a1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Audit(_)));
        assert!(target.try_recv().is_err());
    }

    #[tokio::test]
    async fn kill_process_goes_to_group() {
        let backend = Arc::new(MemoryBackend::default());
        let (gateway, router) = router(&backend, CommandDelivery::Broadcast);
        let (_, mut a1) = gateway.register(&agent_in("a1"));
        let (_, mut a2) = gateway.register(&agent_in("a2"));

        assert_eq!(router.kill_process("a1", 4242), 1);
        assert!(a1.try_recv().unwrap().contains("4242"));
        assert!(a2.try_recv().is_err());
    }

    #[test]
    fn request_parses_from_admin_params() {
        let req: CommandRequest = serde_json::from_value(serde_json::json!({
            "agentId": "a1",
            "command": "Restart",
            "actor": "root",
            "tenantId": 3
        }))
        .unwrap();
        assert_eq!(req.target, None);
        assert_eq!(req.tenant_id, 3);
    }
}
