//! Adapter seams for local capture and the underlying peer connection.
//!
//! The engine never talks to a media stack directly. It drives these
//! traits, which the `call-webrtc` crate implements for real transport
//! and [`mock`] implements for deterministic tests.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use signal_store::{CandidatePayload, SdpPayload};
use tokio::sync::mpsc;

use crate::error::CallResult;
use crate::ice::IceServer;

pub mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to one local capture track.
pub trait LocalTrack: Send + Sync {
    fn kind(&self) -> TrackKind;
    fn id(&self) -> &str;
    fn set_enabled(&self, enabled: bool);
    fn enabled(&self) -> bool;
    fn stop(&self);

    /// Backend handle for transport adapters that need the concrete
    /// track type back, e.g. to attach it to a peer connection.
    fn backing(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// The local tracks backing one session. Cloning shares the underlying
/// track handles.
#[derive(Clone)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    fn track_of(&self, kind: TrackKind) -> Option<&Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    /// Flips the enabled flag on the track of the given kind. Returns
    /// the new state, or `None` when no such track exists.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let track = self.track_of(kind)?;
        let next = !track.enabled();
        track.set_enabled(next);
        Some(next)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Produces the local tracks for a session.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fails with [`crate::CallError::MediaUnavailable`] when capture
    /// is denied or absent.
    async fn acquire(&self) -> CallResult<LocalMedia>;
}

/// Connection state as reported by the transport, normalised across
/// backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Raw transport counters for one sampling instant. Counters are
/// cumulative; consumers diff successive samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportSample {
    pub packets_sent: u64,
    pub packets_lost: i64,
    pub round_trip_time: Option<f64>,
}

/// Messages from the peer connection into the session driver.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered candidate ready to publish.
    Candidate(CandidatePayload),
    StateChanged(ConnectionState),
}

/// Live peer connection. `close` must be safe to call more than once.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> CallResult<SdpPayload>;
    async fn create_answer(&self) -> CallResult<SdpPayload>;
    async fn set_local_description(&self, desc: SdpPayload) -> CallResult<()>;
    async fn set_remote_description(&self, desc: SdpPayload) -> CallResult<()>;
    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> CallResult<()>;
    async fn transport_stats(&self) -> CallResult<TransportSample>;
    fn connection_state(&self) -> ConnectionState;
    async fn close(&self);
}

/// A freshly built connection plus its event feed.
pub struct PeerSession {
    pub handle: Arc<dyn PeerHandle>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Builds peer connections for sessions.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, media: &LocalMedia, servers: &[IceServer]) -> CallResult<PeerSession>;
}
