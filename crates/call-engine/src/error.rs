use signal_store::StoreError;
use thiserror::Error;

use crate::negotiation::NegotiationState;

/// Failure taxonomy for call setup, negotiation, and recovery.
#[derive(Debug, Error)]
pub enum CallError {
    /// Local capture devices are missing or permission was denied.
    /// Fatal to starting a session; never retried automatically.
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    /// Contract violation: the operation arrived in a state that cannot
    /// accept it.
    #[error("{op} not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: NegotiationState,
    },
    /// A descriptor carried the wrong negotiation-type tag.
    #[error("expected {expected} descriptor, got {got:?}")]
    NegotiationMismatch { expected: &'static str, got: String },
    #[error("signaling store: {0}")]
    Store(#[from] StoreError),
    /// Per-candidate application failure. Callers skip the record and
    /// keep going.
    #[error("candidate apply failed: {0}")]
    CandidateApply(String),
    /// Peer connection construction or descriptor exchange failed.
    #[error("connection setup failed: {0}")]
    Setup(String),
}

pub type CallResult<T> = Result<T, CallError>;
