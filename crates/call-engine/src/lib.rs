//! Peer call core: offer/answer negotiation, candidate buffering,
//! connection recovery, and session lifecycle over a pluggable
//! signaling store.
//!
//! The crate is transport-agnostic. [`CallManager`] drives the
//! [`media::PeerConnector`] and [`media::MediaSource`] seams; the
//! `call-webrtc` crate binds them to a real WebRTC stack, and
//! [`media::mock`] provides scripted doubles for tests.
//!
//! A two-party call works like this: the initiator calls
//! [`CallManager::start_as_initiator`], which opens a room in the
//! store with the offer and returns the room id; the responder calls
//! [`CallManager::join_as_responder`] with that id. Both sides then
//! exchange trickled candidates through the store while a per-call
//! driver task supervises connectivity, restarting ICE after outages
//! until the attempt budget runs out.

pub mod candidates;
pub mod config;
pub mod error;
pub mod events;
pub mod ice;
pub mod media;
pub mod negotiation;
pub mod session;
pub mod supervisor;

pub use candidates::CandidateBuffer;
pub use config::CallConfig;
pub use error::{CallError, CallResult};
pub use events::{CallEvent, EventHub, LinkQuality, StatusUpdate};
pub use ice::{HttpTurnSource, IceConfigSource, IceProvider, IceSelection, IceServer};
pub use media::{
    ConnectionState, LocalMedia, LocalTrack, MediaSource, PeerConnector, PeerEvent, PeerHandle,
    PeerSession, TrackKind, TransportSample,
};
pub use negotiation::{CallRole, NegotiationEngine, NegotiationState};
pub use session::CallManager;
pub use supervisor::{QualityMeter, ReconnectionSupervisor, SupervisorAction};
