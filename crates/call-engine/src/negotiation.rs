//! Offer/answer negotiation state machine, one instance per session
//! side.
//!
//! The engine owns no tasks and takes no locks; the session driver
//! feeds it store notifications, peer events, and supervisor decisions
//! from a single loop. Store writes always happen before the state
//! they announce, so a crash can leave a stale document but never a
//! phantom one.

use std::sync::Arc;

use signal_store::{
    CandidatePayload, CandidateSide, RoomDocument, RoomPatch, SdpPayload, SignalingStore,
};
use tracing::{debug, error, warn};

use crate::candidates::CandidateBuffer;
use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, EventHub};
use crate::media::{ConnectionState, PeerHandle};

/// Which end of the negotiation this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Responder,
}

impl CallRole {
    /// Collection this side appends its own candidates to.
    pub fn local_side(self) -> CandidateSide {
        match self {
            CallRole::Initiator => CandidateSide::Caller,
            CallRole::Responder => CandidateSide::Callee,
        }
    }

    /// Collection this side consumes.
    pub fn remote_side(self) -> CandidateSide {
        self.local_side().other()
    }
}

/// Negotiation progress. `CreatingOffer..AwaitingAnswer` is the
/// initiator path and `ProcessingOffer..AnswerSent` the responder
/// path; both converge on `Connected`. `Failed` and `Closed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    CreatingOffer,
    OfferSent,
    AwaitingAnswer,
    ProcessingOffer,
    CreatingAnswer,
    AnswerSent,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

pub struct NegotiationEngine {
    role: CallRole,
    store: Arc<dyn SignalingStore>,
    peer: Arc<dyn PeerHandle>,
    events: EventHub,
    state: NegotiationState,
    room_id: Option<String>,
    buffer: CandidateBuffer,
    local_set: bool,
    remote_set: bool,
    last_offer_sdp: Option<String>,
    last_answer_sdp: Option<String>,
    connection: ConnectionState,
}

impl NegotiationEngine {
    pub fn new(
        role: CallRole,
        store: Arc<dyn SignalingStore>,
        peer: Arc<dyn PeerHandle>,
        events: EventHub,
    ) -> Self {
        Self {
            role,
            store,
            peer,
            events,
            state: NegotiationState::Idle,
            room_id: None,
            buffer: CandidateBuffer::new(),
            local_set: false,
            remote_set: false,
            last_offer_sdp: None,
            last_answer_sdp: None,
            connection: ConnectionState::New,
        }
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// Responder sessions learn their room id before processing the
    /// stored offer.
    pub fn attach_room(&mut self, room_id: String) {
        self.room_id = Some(room_id);
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state == next {
            return;
        }
        debug!(from = ?self.state, to = ?next, "negotiation state");
        self.state = next;
        self.events.emit(CallEvent::NegotiationChanged(next));
    }

    fn ready_for_candidates(&self) -> bool {
        self.local_set && self.remote_set
    }

    fn require_room(&self, op: &'static str) -> CallResult<String> {
        self.room_id.clone().ok_or(CallError::InvalidState {
            op,
            state: self.state,
        })
    }

    /// Initiator entry point. From `Idle` this creates the local
    /// offer, opens the room with it, and settles in `AwaitingAnswer`;
    /// from `Reconnecting` it publishes an ICE-restart offer into the
    /// existing room. Returns the room id.
    pub async fn create_offer(&mut self) -> CallResult<String> {
        if self.role != CallRole::Initiator {
            return Err(CallError::InvalidState {
                op: "create_offer",
                state: self.state,
            });
        }
        match self.state {
            NegotiationState::Idle => self.initial_offer().await,
            NegotiationState::Reconnecting => self.restart_offer().await,
            state => Err(CallError::InvalidState {
                op: "create_offer",
                state,
            }),
        }
    }

    async fn initial_offer(&mut self) -> CallResult<String> {
        self.set_state(NegotiationState::CreatingOffer);
        let offer = self.peer.create_offer(false).await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.local_set = true;
        // one write opens the room with the offer already in place
        let room_id = self
            .store
            .create_room(RoomDocument::with_offer(offer.clone()))
            .await?;
        self.last_offer_sdp = Some(offer.sdp);
        self.room_id = Some(room_id.clone());
        self.set_state(NegotiationState::OfferSent);
        self.set_state(NegotiationState::AwaitingAnswer);
        Ok(room_id)
    }

    async fn restart_offer(&mut self) -> CallResult<String> {
        let room_id = self.require_room("create_offer")?;
        let offer = self.peer.create_offer(true).await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.local_set = true;
        // wait for this round's fresh answer; the write below retires
        // the stored one, and last_answer_sdp stays so a late rewrite
        // of it still dedupes as a replay
        self.remote_set = false;
        self.store
            .update_room(&room_id, RoomPatch::restart_offer(offer.clone()))
            .await?;
        self.last_offer_sdp = Some(offer.sdp);
        debug!(room_id = %room_id, "restart offer published");
        Ok(room_id)
    }

    /// Responder entry point: apply the stored offer, produce the
    /// answer, and publish it. Valid from `Idle` for the first round
    /// and from `Reconnecting` when the initiator restarted ICE.
    pub async fn accept_offer(&mut self, offer: SdpPayload) -> CallResult<()> {
        if self.role != CallRole::Responder {
            return Err(CallError::InvalidState {
                op: "accept_offer",
                state: self.state,
            });
        }
        if !matches!(
            self.state,
            NegotiationState::Idle | NegotiationState::Reconnecting
        ) {
            return Err(CallError::InvalidState {
                op: "accept_offer",
                state: self.state,
            });
        }
        if !offer.is_offer() {
            return Err(CallError::NegotiationMismatch {
                expected: "offer",
                got: offer.typ.clone(),
            });
        }
        let room_id = self.require_room("accept_offer")?;
        self.set_state(NegotiationState::ProcessingOffer);
        self.peer.set_remote_description(offer.clone()).await?;
        self.remote_set = true;
        self.last_offer_sdp = Some(offer.sdp);
        self.set_state(NegotiationState::CreatingAnswer);
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        self.local_set = true;
        self.store
            .update_room(&room_id, RoomPatch::answer(answer.clone()))
            .await?;
        self.last_answer_sdp = Some(answer.sdp);
        self.set_state(NegotiationState::AnswerSent);
        self.drain_buffer().await;
        Ok(())
    }

    /// Initiator side of answer arrival. Replays of the answer already
    /// applied are no-ops, as are late answers after the connection
    /// came up; anything else out of order is a contract violation.
    pub async fn apply_answer(&mut self, answer: SdpPayload) -> CallResult<()> {
        if self.role != CallRole::Initiator {
            return Err(CallError::InvalidState {
                op: "apply_answer",
                state: self.state,
            });
        }
        if self.last_answer_sdp.as_deref() == Some(answer.sdp.as_str()) {
            debug!("duplicate answer ignored");
            return Ok(());
        }
        match self.state {
            NegotiationState::AwaitingAnswer | NegotiationState::Reconnecting => {}
            NegotiationState::Connected => {
                warn!("late answer while connected ignored");
                return Ok(());
            }
            state => {
                return Err(CallError::InvalidState {
                    op: "apply_answer",
                    state,
                })
            }
        }
        if !answer.is_answer() {
            return Err(CallError::NegotiationMismatch {
                expected: "answer",
                got: answer.typ.clone(),
            });
        }
        self.peer.set_remote_description(answer.clone()).await?;
        self.remote_set = true;
        self.last_answer_sdp = Some(answer.sdp);
        self.drain_buffer().await;
        Ok(())
    }

    /// Remote candidate from the feed. Applied immediately once both
    /// descriptions are in place, buffered otherwise. Application
    /// failures are logged and skipped, never fatal.
    pub async fn submit_candidate(&mut self, candidate: CandidatePayload) {
        if self.state.is_terminal() {
            return;
        }
        if self.ready_for_candidates() {
            if let Err(err) = self.peer.add_remote_candidate(candidate).await {
                warn!(error = %err, "remote candidate failed to apply, skipping");
            }
        } else {
            self.buffer.enqueue(candidate);
            debug!(buffered = self.buffer.len(), "remote candidate buffered");
        }
    }

    async fn drain_buffer(&mut self) {
        if self.buffer.is_empty() || !self.ready_for_candidates() {
            return;
        }
        let peer = self.peer.clone();
        let applied = self
            .buffer
            .drain(|candidate| {
                let peer = peer.clone();
                async move { peer.add_remote_candidate(candidate).await }
            })
            .await;
        debug!(applied, "buffered candidates drained");
    }

    /// Ships a locally gathered candidate to this side's collection.
    /// Best-effort: a failed append is logged and the call continues
    /// on the candidates that did land.
    pub async fn publish_local_candidate(&self, candidate: CandidatePayload) {
        if self.state.is_terminal() {
            return;
        }
        let Some(room_id) = self.room_id.clone() else {
            debug!("local candidate before room exists, dropping");
            return;
        };
        if let Err(err) = self
            .store
            .append_candidate(&room_id, self.role.local_side(), candidate)
            .await
        {
            warn!(room_id = %room_id, error = %err, "candidate publish failed");
        }
    }

    /// Store notification with a fresh room document. Routes answers
    /// to the initiator and revised offers to the responder; replays
    /// of payloads already applied fall out as no-ops, and an answer
    /// is honored only for the offer round the document carries.
    pub async fn on_room_update(&mut self, doc: RoomDocument) {
        match self.role {
            CallRole::Initiator => {
                let Some(answer) = doc.answer else {
                    return;
                };
                // a document still showing a superseded offer is a
                // pre-restart snapshot; its answer negotiates dead ICE
                // credentials
                if doc.offer.as_ref().map(|offer| offer.sdp.as_str())
                    != self.last_offer_sdp.as_deref()
                {
                    debug!("answer for a superseded offer ignored");
                    return;
                }
                if self.last_answer_sdp.as_deref() == Some(answer.sdp.as_str()) {
                    return;
                }
                if let Err(err) = self.apply_answer(answer).await {
                    if self.state == NegotiationState::Reconnecting {
                        // recovery stays watchdog-bounded; the next
                        // round retires this answer with a fresh offer
                        warn!(error = %err, "answer rejected during recovery, awaiting a fresh one");
                    } else {
                        self.abort(&format!("answer rejected: {err}"));
                    }
                }
            }
            CallRole::Responder => {
                let Some(offer) = doc.offer else {
                    return;
                };
                if self.last_offer_sdp.as_deref() == Some(offer.sdp.as_str()) {
                    return;
                }
                debug!("revised offer observed, renegotiating");
                self.begin_reconnect();
                if let Err(err) = self.accept_offer(offer).await {
                    self.abort(&format!("revised offer rejected: {err}"));
                }
            }
        }
    }

    /// Transport connection-state report.
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        debug!(from = %self.connection, to = %state, "connection state");
        self.connection = state;
        self.events.emit(CallEvent::ConnectionChanged(state));
        if state == ConnectionState::Connected && !self.state.is_terminal() {
            self.set_state(NegotiationState::Connected);
        }
    }

    /// Marks the session as recovering. The initiator follows up with
    /// a restart offer; the responder waits for one.
    pub fn begin_reconnect(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.set_state(NegotiationState::Reconnecting);
    }

    /// Contract violation or unrecoverable protocol error.
    pub fn abort(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        error!(reason, "negotiation aborted");
        self.buffer.clear();
        self.set_state(NegotiationState::Failed);
    }

    /// Recovery budget exhausted.
    pub fn fail(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        warn!(reason, "negotiation failed");
        self.buffer.clear();
        self.set_state(NegotiationState::Failed);
    }

    /// Clean teardown.
    pub fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.buffer.clear();
        self.set_state(NegotiationState::Closed);
    }
}
