//! Shared-store signaling primitives for peer call setup.
//!
//! Two peers that cannot yet talk to each other directly coordinate
//! through a room document held in a shared store: the room carries at
//! most one offer and one answer descriptor, plus two append-only
//! candidate collections (one per side). This crate defines that document
//! model, the [`SignalingStore`] adapter trait, an in-process
//! [`MemoryStore`], and an HTTP-backed [`HttpSignalingStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod http;
pub mod memory;

pub use http::HttpSignalingStore;
pub use memory::MemoryStore;

/// Session descriptor as stored in a room document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub typ: String,
    pub sdp: String,
}

impl SdpPayload {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            typ: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            typ: "answer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.typ == "offer"
    }

    pub fn is_answer(&self) -> bool {
        self.typ == "answer"
    }
}

/// One discovered network path, in the wire shape produced by the
/// browser's `RTCIceCandidate.toJSON()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    // serde's camelCase would lowercase the L; the browser emits sdpMLineIndex.
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Which side of the call appended a candidate. Each side only consumes
/// the other side's collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CandidateSide {
    Caller,
    Callee,
}

impl CandidateSide {
    /// Store-visible collection name for this side.
    pub fn collection(self) -> &'static str {
        match self {
            CandidateSide::Caller => "callerCandidates",
            CandidateSide::Callee => "calleeCandidates",
        }
    }

    pub fn from_collection(name: &str) -> Option<Self> {
        match name {
            "callerCandidates" => Some(CandidateSide::Caller),
            "calleeCandidates" => Some(CandidateSide::Callee),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            CandidateSide::Caller => CandidateSide::Callee,
            CandidateSide::Callee => CandidateSide::Caller,
        }
    }
}

/// Room document: at most one offer and one answer at a time. The offer
/// field is owned by the caller side, the answer field by the callee
/// side; neither side writes the other's field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SdpPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SdpPayload>,
}

impl RoomDocument {
    pub fn with_offer(offer: SdpPayload) -> Self {
        Self {
            offer: Some(offer),
            answer: None,
        }
    }
}

/// Merge update for a room document. `Some` fields overwrite, `None`
/// fields keep whatever the store already holds, so writing an answer
/// never clobbers the offer. `clear_answer` removes the stored answer,
/// which `answer: None` alone cannot express.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SdpPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SdpPayload>,
    #[serde(rename = "clearAnswer", default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_answer: bool,
}

impl RoomPatch {
    pub fn offer(offer: SdpPayload) -> Self {
        Self {
            offer: Some(offer),
            answer: None,
            clear_answer: false,
        }
    }

    pub fn answer(answer: SdpPayload) -> Self {
        Self {
            offer: None,
            answer: Some(answer),
            clear_answer: false,
        }
    }

    /// Replaces the offer and retires the stored answer in the same
    /// write. Used when renegotiating: the next answer in the room must
    /// be one written against this offer.
    pub fn restart_offer(offer: SdpPayload) -> Self {
        Self {
            offer: Some(offer),
            answer: None,
            clear_answer: true,
        }
    }

    pub fn apply_to(&self, doc: &mut RoomDocument) {
        if let Some(offer) = &self.offer {
            doc.offer = Some(offer.clone());
        }
        if self.clear_answer {
            doc.answer = None;
        } else if let Some(answer) = &self.answer {
            doc.answer = Some(answer.clone());
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("store read failed: {0}")]
    Read(String),
    #[error("store write failed: {0}")]
    Write(String),
    #[error("invalid store endpoint: {0}")]
    Endpoint(String),
    #[error("store subscription closed")]
    SubscriptionClosed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Live feed of room document states. The current document is delivered
/// first; the channel closes when the room is deleted. Dropping the
/// receiver unsubscribes.
pub type RoomUpdates = mpsc::UnboundedReceiver<RoomDocument>;

/// Live feed of one side's candidates. Already-appended candidates are
/// replayed in arrival order before new ones stream in.
pub type CandidateFeed = mpsc::UnboundedReceiver<CandidatePayload>;

/// Store adapter consumed by the negotiation layer. Implementations must
/// preserve per-side candidate order and deliver replay-then-stream
/// subscription semantics; they are free to choose transport and
/// persistence.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Creates a room holding `initial` and returns its store-assigned id.
    async fn create_room(&self, initial: RoomDocument) -> StoreResult<String>;

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<RoomDocument>>;

    /// Merge-updates the room document. Fails with [`StoreError::RoomNotFound`]
    /// if the room does not exist.
    async fn update_room(&self, room_id: &str, patch: RoomPatch) -> StoreResult<()>;

    async fn subscribe_room(&self, room_id: &str) -> StoreResult<RoomUpdates>;

    async fn append_candidate(
        &self,
        room_id: &str,
        side: CandidateSide,
        candidate: CandidatePayload,
    ) -> StoreResult<()>;

    async fn subscribe_candidates(
        &self,
        room_id: &str,
        side: CandidateSide,
    ) -> StoreResult<CandidateFeed>;

    /// Removes the room document and both candidate collections. Deleting
    /// a room that is already gone is not an error.
    async fn delete_room(&self, room_id: &str) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdp_payload_type_tag_on_wire() {
        let json = serde_json::to_value(SdpPayload::offer("v=0")).expect("serialize");
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn candidate_payload_uses_browser_field_names() {
        let candidate = CandidatePayload {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn patch_merge_keeps_unset_fields() {
        let mut doc = RoomDocument::with_offer(SdpPayload::offer("v=0 offer"));
        RoomPatch::answer(SdpPayload::answer("v=0 answer")).apply_to(&mut doc);
        assert!(doc.offer.is_some());
        assert!(doc.answer.is_some());
    }

    #[test]
    fn restart_patch_replaces_offer_and_drops_answer() {
        let mut doc = RoomDocument::with_offer(SdpPayload::offer("v=0 offer"));
        doc.answer = Some(SdpPayload::answer("v=0 answer"));

        let patch = RoomPatch::restart_offer(SdpPayload::offer("v=0 offer-2"));
        let json = serde_json::to_value(&patch).expect("serialize");
        assert_eq!(json["clearAnswer"], true);

        patch.apply_to(&mut doc);
        assert_eq!(doc.offer, Some(SdpPayload::offer("v=0 offer-2")));
        assert!(doc.answer.is_none());
    }

    #[test]
    fn side_collection_names_round_trip() {
        for side in [CandidateSide::Caller, CandidateSide::Callee] {
            assert_eq!(CandidateSide::from_collection(side.collection()), Some(side));
            assert_eq!(side.other().other(), side);
        }
        assert_eq!(CandidateSide::from_collection("unknown"), None);
    }
}
