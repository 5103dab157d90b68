//! Deterministic media and connection doubles for tests. Tests drive
//! connection state and candidate discovery explicitly and inspect
//! what the engine applied.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_store::{CandidatePayload, SdpPayload};
use tokio::sync::mpsc;

use super::{
    ConnectionState, LocalMedia, LocalTrack, MediaSource, PeerConnector, PeerEvent, PeerHandle,
    PeerSession, TrackKind, TransportSample,
};
use crate::error::{CallError, CallResult};
use crate::ice::IceServer;

pub struct MockTrack {
    kind: TrackKind,
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(kind: TrackKind, id: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            id: id.to_string(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for MockTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Hands out one mock audio and one mock video track per acquire.
/// `deny` models missing capture permission.
pub struct MockMediaSource {
    deny: bool,
    acquires: AtomicUsize,
    last_tracks: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            acquires: AtomicUsize::new(0),
            last_tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            acquires: AtomicUsize::new(0),
            last_tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn last_tracks(&self) -> Vec<Arc<MockTrack>> {
        self.last_tracks.lock().clone()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self) -> CallResult<LocalMedia> {
        if self.deny {
            return Err(CallError::MediaUnavailable(
                "capture permission denied".to_string(),
            ));
        }
        self.acquires.fetch_add(1, Ordering::SeqCst);
        let audio = MockTrack::new(TrackKind::Audio, "mock-audio");
        let video = MockTrack::new(TrackKind::Video, "mock-video");
        *self.last_tracks.lock() = vec![audio.clone(), video.clone()];
        Ok(LocalMedia::new(vec![audio, video]))
    }
}

/// Scripted peer connection. Descriptor creation is deterministic, so
/// tests can match specific offers and answers by sequence number.
pub struct MockPeer {
    state: Mutex<ConnectionState>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    offer_seq: AtomicUsize,
    answer_seq: AtomicUsize,
    created_offers: Mutex<Vec<SdpPayload>>,
    local_descriptions: Mutex<Vec<SdpPayload>>,
    remote_descriptions: Mutex<Vec<SdpPayload>>,
    applied_candidates: Mutex<Vec<CandidatePayload>>,
    reject_candidates_containing: Mutex<Option<String>>,
    reject_remote_sdp_containing: Mutex<Option<String>>,
    sample: Mutex<TransportSample>,
    closed: AtomicBool,
}

impl MockPeer {
    fn new(events_tx: mpsc::UnboundedSender<PeerEvent>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnectionState::New),
            events_tx,
            offer_seq: AtomicUsize::new(0),
            answer_seq: AtomicUsize::new(0),
            created_offers: Mutex::new(Vec::new()),
            local_descriptions: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            applied_candidates: Mutex::new(Vec::new()),
            reject_candidates_containing: Mutex::new(None),
            reject_remote_sdp_containing: Mutex::new(None),
            sample: Mutex::new(TransportSample::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Records the new state and pushes it through the event feed, the
    /// way a transport callback would.
    pub fn emit_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let _ = self.events_tx.send(PeerEvent::StateChanged(state));
    }

    /// Simulates local candidate discovery.
    pub fn emit_candidate(&self, candidate: CandidatePayload) {
        let _ = self.events_tx.send(PeerEvent::Candidate(candidate));
    }

    pub fn reject_candidates_containing(&self, needle: &str) {
        *self.reject_candidates_containing.lock() = Some(needle.to_string());
    }

    pub fn reject_remote_sdp_containing(&self, needle: &str) {
        *self.reject_remote_sdp_containing.lock() = Some(needle.to_string());
    }

    pub fn set_sample(&self, sample: TransportSample) {
        *self.sample.lock() = sample;
    }

    pub fn created_offers(&self) -> Vec<SdpPayload> {
        self.created_offers.lock().clone()
    }

    pub fn local_descriptions(&self) -> Vec<SdpPayload> {
        self.local_descriptions.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SdpPayload> {
        self.remote_descriptions.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<CandidatePayload> {
        self.applied_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerHandle for MockPeer {
    async fn create_offer(&self, ice_restart: bool) -> CallResult<SdpPayload> {
        let seq = self.offer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let marker = if ice_restart { " ice-restart" } else { "" };
        let offer = SdpPayload::offer(format!("v=0 mock-offer-{seq}{marker}"));
        self.created_offers.lock().push(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> CallResult<SdpPayload> {
        let seq = self.answer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SdpPayload::answer(format!("v=0 mock-answer-{seq}")))
    }

    async fn set_local_description(&self, desc: SdpPayload) -> CallResult<()> {
        self.local_descriptions.lock().push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SdpPayload) -> CallResult<()> {
        if let Some(needle) = self.reject_remote_sdp_containing.lock().as_deref() {
            if desc.sdp.contains(needle) {
                return Err(CallError::Setup(format!("rejected {}", desc.sdp)));
            }
        }
        self.remote_descriptions.lock().push(desc);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> CallResult<()> {
        if let Some(needle) = self.reject_candidates_containing.lock().as_deref() {
            if candidate.candidate.contains(needle) {
                return Err(CallError::CandidateApply(format!(
                    "rejected {}",
                    candidate.candidate
                )));
            }
        }
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    async fn transport_stats(&self) -> CallResult<TransportSample> {
        Ok(*self.sample.lock())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Closed;
    }
}

/// Connector that records every peer it builds so tests can drive them
/// after the fact.
#[derive(Default)]
pub struct MockConnector {
    peers: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peer(&self, index: usize) -> Option<Arc<MockPeer>> {
        self.peers.lock().get(index).cloned()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, _media: &LocalMedia, _servers: &[IceServer]) -> CallResult<PeerSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = MockPeer::new(tx);
        self.peers.lock().push(peer.clone());
        Ok(PeerSession {
            handle: peer,
            events: rx,
        })
    }
}
