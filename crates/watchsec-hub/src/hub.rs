//! Shared hub state handed to every connection handler.

use std::sync::Arc;

use chrono::Duration;

use watchsec_core::capture::DEFAULT_CAPTURE_INTERVAL_SECS;
use watchsec_core::config::HubConfig;

use crate::capture::CaptureEngine;
use crate::commands::CommandRouter;
use crate::events::EventBroadcaster;
use crate::gateway::{ConnectionGateway, ConnectionId};
use crate::ports::{AuditLog, EventStore, FrameStore, SessionVerifier, TenantDirectory};

/// The external collaborators the hub depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub tenants: Arc<dyn TenantDirectory>,
    pub sessions: Arc<dyn SessionVerifier>,
    pub audit: Arc<dyn AuditLog>,
    pub events: Arc<dyn EventStore>,
    pub frames: Arc<dyn FrameStore>,
}

#[derive(Clone)]
pub struct Hub {
    pub gateway: Arc<ConnectionGateway>,
    pub capture: Arc<CaptureEngine>,
    pub events: Arc<EventBroadcaster>,
    pub commands: Arc<CommandRouter>,
}

impl Hub {
    pub fn new(config: &HubConfig, collaborators: Collaborators) -> Self {
        let gateway = Arc::new(ConnectionGateway::new(
            collaborators.tenants,
            collaborators.sessions,
            config.hub.outbound_queue,
        ));
        let interval = config.capture.interval().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "capture: using default interval");
            Duration::seconds(DEFAULT_CAPTURE_INTERVAL_SECS)
        });
        let capture = Arc::new(
            CaptureEngine::new(
                Arc::clone(&gateway),
                collaborators.frames,
                interval,
                config.capture.extension.clone(),
            )
            .with_max_tracked_agents(config.capture.max_tracked_agents),
        );
        let events = Arc::new(EventBroadcaster::new(
            Arc::clone(&gateway),
            Arc::clone(&capture),
            collaborators.events,
        ));
        let commands = Arc::new(CommandRouter::new(
            Arc::clone(&gateway),
            collaborators.audit,
            config.commands.delivery,
        ));
        Self {
            gateway,
            capture,
            events,
            commands,
        }
    }

    /// Drop a connection. When it was the agent's last one, the agent's
    /// cached frame and idle throttle state go with it.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some(agent_id) = self.gateway.unregister(id) {
            self.capture.evict(&agent_id);
        }
    }
}

#[cfg(test)]
impl Hub {
    /// Hub over one in-memory backend with default settings.
    pub fn in_memory(backend: &Arc<crate::memory::MemoryBackend>) -> Self {
        Self::new(
            &HubConfig::default(),
            Collaborators {
                tenants: backend.clone(),
                sessions: backend.clone(),
                audit: backend.clone(),
                events: backend.clone(),
                frames: backend.clone(),
            },
        )
    }
}
