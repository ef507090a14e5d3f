//! Client-facing event stream (the "door" of a session).
//!
//! Everything a client observes about a session flows through a [`Door`]:
//! executor state changes, textual output, macro results, per-macro status
//! records and opaque record data (e.g. scan rows). The default
//! implementation broadcasts [`DoorEvent`]s over a `tokio::sync::broadcast`
//! channel; clients subscribe and consume at their own pace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::status::{ExecutorState, MacroStatus};

/// One event forwarded to session clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DoorEvent {
    /// Session-level executor state change.
    State {
        /// New state.
        state: ExecutorState,
    },
    /// One line of textual macro output.
    Output {
        /// The line, without trailing newline.
        line: String,
    },
    /// Result values of a finished top-level macro.
    Result {
        /// Stringified result values.
        values: Vec<String>,
    },
    /// Per-macro status record.
    MacroStatus {
        /// The record.
        status: MacroStatus,
    },
    /// Opaque structured data forwarded by a macro.
    RecordData {
        /// Emission time.
        timestamp: DateTime<Utc>,
        /// Optional codec hint for the payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        codec: Option<String>,
        /// The payload.
        payload: serde_json::Value,
    },
}

/// Sink for session events. One per session; the executor holds it as
/// `Arc<dyn Door>` so tests can substitute their own.
pub trait Door: Send + Sync {
    /// Report a session-level executor state change.
    fn send_state(&self, state: ExecutorState);

    /// Forward one line of macro output.
    fn send_output(&self, line: &str);

    /// Forward the result values of a finished top-level macro.
    fn send_result(&self, values: &[String]);

    /// Forward one per-macro status record.
    fn send_macro_status(&self, status: &MacroStatus);

    /// Forward opaque record data, timestamped at emission.
    fn send_record_data(&self, payload: serde_json::Value, codec: Option<&str>);
}

/// Broadcast-channel door. Events sent while no client is subscribed are
/// dropped silently.
pub struct BroadcastDoor {
    sender: broadcast::Sender<DoorEvent>,
}

impl BroadcastDoor {
    /// Create a door with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DoorEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, event: DoorEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }
}

impl Door for BroadcastDoor {
    fn send_state(&self, state: ExecutorState) {
        debug!(state = %state, "Door state change");
        self.emit(DoorEvent::State { state });
    }

    fn send_output(&self, line: &str) {
        self.emit(DoorEvent::Output {
            line: line.to_string(),
        });
    }

    fn send_result(&self, values: &[String]) {
        debug!(?values, "Door result");
        self.emit(DoorEvent::Result {
            values: values.to_vec(),
        });
    }

    fn send_macro_status(&self, status: &MacroStatus) {
        debug!(id = status.id, event = %status.event, step = status.step, "Macro status");
        self.emit(DoorEvent::MacroStatus {
            status: status.clone(),
        });
    }

    fn send_record_data(&self, payload: serde_json::Value, codec: Option<&str>) {
        self.emit(DoorEvent::RecordData {
            timestamp: Utc::now(),
            codec: codec.map(str::to_string),
            payload,
        });
    }
}
