//! Screen-capture throttle: decides which live frames become evidence on disk.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default spacing between routine persisted frames for one agent.
pub const DEFAULT_CAPTURE_INTERVAL_SECS: i64 = 30;

/// Default cap on agent ids the hub keeps capture state for.
pub const DEFAULT_MAX_TRACKED_AGENTS: usize = 10_000;

/// Why a frame is being persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// The throttle interval elapsed.
    Routine,
    /// A security event armed a forced capture.
    Alert,
}

/// Per-agent throttle state.
///
/// `force_capture` is one-shot: the next [`CaptureSlot::evaluate`] consumes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSlot {
    last_persisted_at: Option<DateTime<Utc>>,
    force_capture: bool,
}

impl CaptureSlot {
    pub fn last_persisted_at(&self) -> Option<DateTime<Utc>> {
        self.last_persisted_at
    }

    pub fn is_armed(&self) -> bool {
        self.force_capture
    }

    /// Arm a forced capture for the next frame.
    pub fn arm(&mut self) {
        self.force_capture = true;
    }

    /// Decide whether the frame arriving at `now` is persisted.
    ///
    /// Clears the forced-capture flag unconditionally. When a capture is
    /// returned the slot records `now` as the last persisted instant.
    pub fn evaluate(&mut self, now: DateTime<Utc>, interval: Duration) -> Option<CaptureKind> {
        let forced = std::mem::take(&mut self.force_capture);
        let due = match self.last_persisted_at {
            None => true,
            Some(last) => now.signed_duration_since(last) >= interval,
        };

        let kind = if forced {
            CaptureKind::Alert
        } else if due {
            CaptureKind::Routine
        } else {
            return None;
        };
        self.last_persisted_at = Some(now);
        Some(kind)
    }
}

/// Storage location of one persisted frame, relative to the screenshot root:
/// `<agent_id>/<yyyyMMdd>/<HHmmss>[_ALERT].<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLocation {
    pub date: String,
    pub filename: String,
}

impl FrameLocation {
    pub fn new(now: DateTime<Utc>, kind: CaptureKind, extension: &str) -> Self {
        let suffix = match kind {
            CaptureKind::Alert => "_ALERT",
            CaptureKind::Routine => "",
        };
        Self {
            date: now.format("%Y%m%d").to_string(),
            filename: format!("{}{suffix}.{extension}", now.format("%H%M%S")),
        }
    }
}
