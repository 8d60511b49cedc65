//! Security event intake: arm evidence capture, store, re-broadcast.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use watchsec_core::types::SecurityEvent;

use crate::capture::CaptureEngine;
use crate::gateway::ConnectionGateway;
use crate::ports::EventStore;
use crate::protocol::{EventPush, HubPush};

#[derive(Debug)]
pub struct EventOutcome {
    pub event: SecurityEvent,
    pub delivered: usize,
    /// Detached persistence task.
    pub persist: JoinHandle<()>,
}

pub struct EventBroadcaster {
    gateway: Arc<ConnectionGateway>,
    capture: Arc<CaptureEngine>,
    store: Arc<dyn EventStore>,
}

impl EventBroadcaster {
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        capture: Arc<CaptureEngine>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            gateway,
            capture,
            store,
        }
    }

    pub fn on_security_event(&self, agent_id: &str, event_type: &str, details: &str) -> EventOutcome {
        self.on_security_event_at(agent_id, event_type, details, Utc::now())
    }

    /// The stored record and the broadcast carry the same `now`.
    pub fn on_security_event_at(
        &self,
        agent_id: &str,
        event_type: &str,
        details: &str,
        now: DateTime<Utc>,
    ) -> EventOutcome {
        self.capture.arm(agent_id);

        let event = SecurityEvent {
            agent_id: agent_id.to_string(),
            event_type: event_type.to_string(),
            details: details.to_string(),
            timestamp: now,
        };

        let store = Arc::clone(&self.store);
        let record = event.clone();
        let persist = tokio::spawn(async move {
            let agent_id = record.agent_id.clone();
            if let Err(e) = store.insert_security_event(record).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "events: failed to persist security event");
            }
        });

        let delivered = self.gateway.broadcast_to_all(&HubPush::ReceiveEvent(EventPush {
            agent_id: event.agent_id.clone(),
            event_type: event.event_type.clone(),
            details: event.details.clone(),
            timestamp: event.timestamp,
        }));
        tracing::info!(
            agent_id = %agent_id,
            event_type = %event_type,
            delivered,
            "events: security event received"
        );

        EventOutcome {
            event,
            delivered,
            persist,
        }
    }
}
