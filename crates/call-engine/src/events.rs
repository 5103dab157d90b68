//! Observable call events for UI layers.

use tokio::sync::broadcast;

use crate::media::ConnectionState;
use crate::negotiation::NegotiationState;

/// Coarse connection quality derived from smoothed packet loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkQuality {
    Good,
    Medium,
    Poor,
}

impl LinkQuality {
    pub fn label(self) -> &'static str {
        match self {
            LinkQuality::Good => "good",
            LinkQuality::Medium => "medium",
            LinkQuality::Poor => "poor",
        }
    }
}

/// Display snapshot: a short status line, the room id once known, and
/// the last quality class.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub room_id: Option<String>,
    pub status: String,
    pub quality: Option<LinkQuality>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    NegotiationChanged(NegotiationState),
    ConnectionChanged(ConnectionState),
    QualityChanged(LinkQuality),
    /// The relay tier is unavailable; candidates are limited to
    /// host/STUN paths until the next successful credential fetch.
    IceDegraded { reason: String },
    Status(StatusUpdate),
}

/// Broadcast fan-out for call events. Emitting with no subscribers is
/// fine; the event is dropped.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<CallEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
