//! Forward Event System
//!
//! Status changes of port forwards are published on a broadcast channel.
//! Sending never blocks and never fails the caller; with no subscribers the
//! event is simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::manager::{ForwardStats, ForwardStatus};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwardEvent {
    /// Forward status changed (created, stopped, error, etc.)
    StatusChanged {
        forward_id: String,
        connection_id: String,
        status: ForwardStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StatsUpdated {
        forward_id: String,
        connection_id: String,
        stats: ForwardStats,
    },
    /// All forwards of a connection went away with the transport
    SessionSuspended {
        connection_id: String,
        forward_ids: Vec<String>,
    },
}

#[derive(Clone)]
pub struct ForwardEventEmitter {
    tx: broadcast::Sender<ForwardEvent>,
    connection_id: String,
}

impl ForwardEventEmitter {
    pub fn new(connection_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            connection_id: connection_id.into(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ForwardEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn emit_status_changed(&self, forward_id: &str, status: ForwardStatus, error: Option<String>) {
        self.emit(ForwardEvent::StatusChanged {
            forward_id: forward_id.to_string(),
            connection_id: self.connection_id.clone(),
            status,
            error,
        });
    }

    pub fn emit_stats_updated(&self, forward_id: &str, stats: ForwardStats) {
        self.emit(ForwardEvent::StatsUpdated {
            forward_id: forward_id.to_string(),
            connection_id: self.connection_id.clone(),
            stats,
        });
    }

    pub fn emit_session_suspended(&self, forward_ids: Vec<String>) {
        self.emit(ForwardEvent::SessionSuspended {
            connection_id: self.connection_id.clone(),
            forward_ids,
        });
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl std::fmt::Debug for ForwardEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardEventEmitter")
            .field("connection_id", &self.connection_id)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
