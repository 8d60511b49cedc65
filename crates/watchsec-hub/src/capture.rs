//! Live frame fan-out and throttled evidence persistence.

use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;

use watchsec_core::agent_id::validate_agent_id;
use watchsec_core::capture::{
    CaptureKind, CaptureSlot, DEFAULT_MAX_TRACKED_AGENTS, FrameLocation,
};

use crate::error::PersistError;
use crate::gateway::ConnectionGateway;
use crate::ports::FrameStore;
use crate::protocol::{HubPush, ScreenParams};

/// What happened to one submitted frame.
#[derive(Debug)]
pub struct FrameOutcome {
    /// Connections the live frame was queued for.
    pub delivered: usize,
    /// Set when the frame was selected for persistence.
    pub capture: Option<CaptureKind>,
    /// Detached persistence task, if one was spawned.
    pub persist: Option<JoinHandle<()>>,
}

pub struct CaptureEngine {
    gateway: Arc<ConnectionGateway>,
    frames: Arc<dyn FrameStore>,
    slots: DashMap<String, Arc<Mutex<CaptureSlot>>>,
    latest: DashMap<String, Arc<String>>,
    interval: Duration,
    extension: String,
    max_tracked: usize,
}

impl CaptureEngine {
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        frames: Arc<dyn FrameStore>,
        interval: Duration,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            frames,
            slots: DashMap::new(),
            latest: DashMap::new(),
            interval,
            extension: extension.into(),
            max_tracked: DEFAULT_MAX_TRACKED_AGENTS,
        }
    }

    /// Cap the number of agent ids with capture state. Frames from ids past
    /// the cap are still broadcast but neither cached nor persisted.
    pub fn with_max_tracked_agents(mut self, max: usize) -> Self {
        self.max_tracked = max.max(1);
        self
    }

    /// Per-agent slot, created on first use while under the cap. The map
    /// guard is released before the caller locks it, so agents never contend
    /// with each other.
    fn slot(&self, agent_id: &str) -> Option<Arc<Mutex<CaptureSlot>>> {
        if let Some(slot) = self.slots.get(agent_id) {
            return Some(Arc::clone(&slot));
        }
        if self.slots.len() >= self.max_tracked {
            tracing::warn!(
                agent_id = %agent_id,
                limit = self.max_tracked,
                "capture: tracked agent limit reached, capture state not kept"
            );
            return None;
        }
        Some(Arc::clone(&self.slots.entry(agent_id.to_string()).or_default()))
    }

    /// Arm a forced capture: the agent's next frame is persisted as an alert.
    pub fn arm(&self, agent_id: &str) {
        if !validate_agent_id(agent_id) {
            return;
        }
        if let Some(slot) = self.slot(agent_id) {
            slot.lock().unwrap_or_else(PoisonError::into_inner).arm();
        }
    }

    /// Forget an agent that has no live connection left. An armed slot is
    /// kept so the alert capture still happens when the agent reconnects.
    pub fn evict(&self, agent_id: &str) {
        self.latest.remove(agent_id);
        self.slots.remove_if(agent_id, |_, slot| {
            !slot.lock().unwrap_or_else(PoisonError::into_inner).is_armed()
        });
    }

    /// Number of agent ids with throttle state.
    pub fn tracked_agents(&self) -> usize {
        self.slots.len()
    }

    /// Most recent frame received from `agent_id`, base64-encoded.
    pub fn latest_frame(&self, agent_id: &str) -> Option<Arc<String>> {
        self.latest.get(agent_id).map(|f| Arc::clone(&f))
    }

    pub fn on_frame(&self, agent_id: &str, image: String) -> FrameOutcome {
        self.on_frame_at(agent_id, image, Utc::now())
    }

    /// Broadcast a frame, then decide whether it is persisted.
    pub fn on_frame_at(&self, agent_id: &str, image: String, now: DateTime<Utc>) -> FrameOutcome {
        let delivered = self.gateway.broadcast_to_all(&HubPush::ReceiveScreen(ScreenParams {
            agent_id: agent_id.to_string(),
            image: image.clone(),
        }));
        let live_only = FrameOutcome {
            delivered,
            capture: None,
            persist: None,
        };

        if !validate_agent_id(agent_id) {
            tracing::debug!(agent_id = %agent_id, "capture: agent id not storable, frame not persisted");
            return live_only;
        }
        let Some(slot) = self.slot(agent_id) else {
            return live_only;
        };

        let image = Arc::new(image);
        self.latest.insert(agent_id.to_string(), Arc::clone(&image));

        let capture = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluate(now, self.interval);

        let persist = capture.map(|kind| {
            let location = FrameLocation::new(now, kind, &self.extension);
            let frames = Arc::clone(&self.frames);
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = persist_frame(frames.as_ref(), &agent_id, &location, &image).await {
                    tracing::warn!(
                        agent_id = %agent_id,
                        filename = %location.filename,
                        error = %e,
                        "capture: failed to persist frame"
                    );
                } else {
                    tracing::debug!(agent_id = %agent_id, filename = %location.filename, "capture: frame persisted");
                }
            })
        });

        FrameOutcome {
            delivered,
            capture,
            persist,
        }
    }
}

async fn persist_frame(
    frames: &dyn FrameStore,
    agent_id: &str,
    location: &FrameLocation,
    image: &str,
) -> Result<(), PersistError> {
    let bytes = STANDARD.decode(image)?;
    frames
        .save_frame(agent_id, &location.date, &location.filename, bytes)
        .await
}
