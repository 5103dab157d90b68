//! In-process store for tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    CandidateFeed, CandidatePayload, CandidateSide, RoomDocument, RoomPatch, RoomUpdates,
    SignalingStore, StoreError, StoreResult,
};

#[derive(Default)]
struct SideSlot {
    records: Vec<CandidatePayload>,
    watchers: Vec<mpsc::UnboundedSender<CandidatePayload>>,
}

#[derive(Default)]
struct RoomEntry {
    doc: RoomDocument,
    doc_watchers: Vec<mpsc::UnboundedSender<RoomDocument>>,
    caller: SideSlot,
    callee: SideSlot,
}

impl RoomEntry {
    fn side_mut(&mut self, side: CandidateSide) -> &mut SideSlot {
        match side {
            CandidateSide::Caller => &mut self.caller,
            CandidateSide::Callee => &mut self.callee,
        }
    }

    fn side(&self, side: CandidateSide) -> &SideSlot {
        match side {
            CandidateSide::Caller => &self.caller,
            CandidateSide::Callee => &self.callee,
        }
    }
}

/// In-memory [`SignalingStore`]. Deleting a room drops every watcher
/// sender, so subscription feeds observe the deletion as channel close.
#[derive(Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, RoomEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one side's appended candidates, in arrival order.
    pub fn list_candidates(&self, room_id: &str, side: CandidateSide) -> Vec<CandidatePayload> {
        self.rooms
            .read()
            .get(room_id)
            .map(|entry| entry.side(side).records.clone())
            .unwrap_or_default()
    }

    pub fn candidate_count(&self, room_id: &str, side: CandidateSide) -> usize {
        self.rooms
            .read()
            .get(room_id)
            .map(|entry| entry.side(side).records.len())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn create_room(&self, initial: RoomDocument) -> StoreResult<String> {
        let room_id = Uuid::new_v4().to_string();
        let mut rooms = self.rooms.write();
        rooms.insert(
            room_id.clone(),
            RoomEntry {
                doc: initial,
                ..Default::default()
            },
        );
        Ok(room_id)
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<RoomDocument>> {
        Ok(self.rooms.read().get(room_id).map(|entry| entry.doc.clone()))
    }

    async fn update_room(&self, room_id: &str, patch: RoomPatch) -> StoreResult<()> {
        let mut rooms = self.rooms.write();
        let entry = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        patch.apply_to(&mut entry.doc);
        let doc = entry.doc.clone();
        entry.doc_watchers.retain(|tx| tx.send(doc.clone()).is_ok());
        Ok(())
    }

    async fn subscribe_room(&self, room_id: &str) -> StoreResult<RoomUpdates> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write();
        let entry = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        let _ = tx.send(entry.doc.clone());
        entry.doc_watchers.push(tx);
        Ok(rx)
    }

    async fn append_candidate(
        &self,
        room_id: &str,
        side: CandidateSide,
        candidate: CandidatePayload,
    ) -> StoreResult<()> {
        let mut rooms = self.rooms.write();
        let entry = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        let slot = entry.side_mut(side);
        slot.watchers.retain(|tx| tx.send(candidate.clone()).is_ok());
        slot.records.push(candidate);
        Ok(())
    }

    async fn subscribe_candidates(
        &self,
        room_id: &str,
        side: CandidateSide,
    ) -> StoreResult<CandidateFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write();
        let entry = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        let slot = entry.side_mut(side);
        for record in &slot.records {
            let _ = tx.send(record.clone());
        }
        slot.watchers.push(tx);
        Ok(rx)
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<()> {
        self.rooms.write().remove(room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SdpPayload;

    fn candidate(tag: &str) -> CandidatePayload {
        CandidatePayload {
            candidate: format!("candidate:{tag} 1 udp 2122260223 192.0.2.1 54321 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn room_create_update_merge() {
        let store = MemoryStore::new();
        let room_id = store
            .create_room(RoomDocument::with_offer(SdpPayload::offer("v=0 offer")))
            .await
            .expect("create room");

        store
            .update_room(&room_id, RoomPatch::answer(SdpPayload::answer("v=0 answer")))
            .await
            .expect("write answer");

        let doc = store
            .get_room(&room_id)
            .await
            .expect("read room")
            .expect("room exists");
        assert_eq!(doc.offer, Some(SdpPayload::offer("v=0 offer")));
        assert_eq!(doc.answer, Some(SdpPayload::answer("v=0 answer")));
    }

    #[tokio::test]
    async fn update_missing_room_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_room("missing", RoomPatch::answer(SdpPayload::answer("v=0")))
            .await
            .expect_err("should fail");
        assert!(matches!(err, StoreError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn room_subscription_replays_current_then_streams() {
        let store = MemoryStore::new();
        let room_id = store
            .create_room(RoomDocument::with_offer(SdpPayload::offer("v=0 offer")))
            .await
            .expect("create room");

        let mut updates = store.subscribe_room(&room_id).await.expect("subscribe");
        let first = updates.recv().await.expect("initial document");
        assert!(first.answer.is_none());

        store
            .update_room(&room_id, RoomPatch::answer(SdpPayload::answer("v=0 answer")))
            .await
            .expect("write answer");
        let second = updates.recv().await.expect("updated document");
        assert!(second.answer.is_some());
    }

    #[tokio::test]
    async fn restart_write_notifies_with_the_answer_retired() {
        let store = MemoryStore::new();
        let room_id = store
            .create_room(RoomDocument::with_offer(SdpPayload::offer("v=0 offer")))
            .await
            .expect("create room");
        store
            .update_room(&room_id, RoomPatch::answer(SdpPayload::answer("v=0 answer")))
            .await
            .expect("write answer");

        let mut updates = store.subscribe_room(&room_id).await.expect("subscribe");
        let _ = updates.recv().await.expect("initial document");

        store
            .update_room(
                &room_id,
                RoomPatch::restart_offer(SdpPayload::offer("v=0 offer-2")),
            )
            .await
            .expect("write restart offer");

        let seen = updates.recv().await.expect("restart document");
        assert_eq!(seen.offer, Some(SdpPayload::offer("v=0 offer-2")));
        assert!(seen.answer.is_none());
    }

    #[tokio::test]
    async fn candidate_feed_replays_then_streams_in_order() {
        let store = MemoryStore::new();
        let room_id = store
            .create_room(RoomDocument::default())
            .await
            .expect("create room");

        for tag in ["a", "b"] {
            store
                .append_candidate(&room_id, CandidateSide::Caller, candidate(tag))
                .await
                .expect("append");
        }

        let mut feed = store
            .subscribe_candidates(&room_id, CandidateSide::Caller)
            .await
            .expect("subscribe");
        store
            .append_candidate(&room_id, CandidateSide::Caller, candidate("c"))
            .await
            .expect("append live");

        for tag in ["a", "b", "c"] {
            let got = feed.recv().await.expect("candidate");
            assert_eq!(got, candidate(tag));
        }
        assert_eq!(store.candidate_count(&room_id, CandidateSide::Caller), 3);
        assert_eq!(store.candidate_count(&room_id, CandidateSide::Callee), 0);
    }

    #[tokio::test]
    async fn delete_room_closes_feeds_and_is_idempotent() {
        let store = MemoryStore::new();
        let room_id = store
            .create_room(RoomDocument::with_offer(SdpPayload::offer("v=0")))
            .await
            .expect("create room");
        let mut updates = store.subscribe_room(&room_id).await.expect("subscribe room");
        let mut feed = store
            .subscribe_candidates(&room_id, CandidateSide::Callee)
            .await
            .expect("subscribe candidates");
        let _ = updates.recv().await.expect("initial document");

        store.delete_room(&room_id).await.expect("delete");
        assert!(updates.recv().await.is_none());
        assert!(feed.recv().await.is_none());
        assert!(store.get_room(&room_id).await.expect("read").is_none());

        store.delete_room(&room_id).await.expect("second delete is ok");
    }
}
