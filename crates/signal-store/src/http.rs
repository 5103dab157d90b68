//! HTTP-backed store adapter with polling subscriptions.
//!
//! Endpoint surface, relative to the configured base URL:
//! `POST /rooms`, `GET|PATCH|DELETE /rooms/{id}`, and
//! `POST|GET /rooms/{id}/{callerCandidates|calleeCandidates}` where list
//! reads take an `after=<count>` cursor. Subscriptions are polling tasks
//! feeding unbounded channels; they stop when the receiver is dropped or
//! the room disappears, and are aborted when the store itself is dropped.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    CandidateFeed, CandidatePayload, CandidateSide, RoomDocument, RoomPatch, RoomUpdates,
    SignalingStore, StoreError, StoreResult,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct CreatedRoom {
    room_id: String,
}

pub struct HttpSignalingStore {
    client: Client,
    base: String,
    poll_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpSignalingStore {
    pub fn new(base_url: &str) -> StoreResult<Self> {
        let base = base_url.trim_end_matches('/').to_string();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(StoreError::Endpoint(base));
        }
        Ok(Self {
            client: Client::new(),
            base,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn rooms_url(&self) -> String {
        format!("{}/rooms", self.base)
    }

    fn room_url(&self, room_id: &str) -> String {
        format!("{}/rooms/{}", self.base, room_id)
    }

    fn collection_url(&self, room_id: &str, side: CandidateSide) -> String {
        format!("{}/rooms/{}/{}", self.base, room_id, side.collection())
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    async fn fetch_room(client: &Client, url: &str) -> StoreResult<Option<RoomDocument>> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|err| StoreError::Read(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let doc = response
                    .json::<RoomDocument>()
                    .await
                    .map_err(|err| StoreError::Read(err.to_string()))?;
                Ok(Some(doc))
            }
            status => Err(StoreError::Read(format!("room fetch returned {status}"))),
        }
    }

    async fn fetch_candidates(
        client: &Client,
        url: &str,
        after: usize,
    ) -> StoreResult<Option<Vec<CandidatePayload>>> {
        let response = client
            .get(url)
            .query(&[("after", after)])
            .send()
            .await
            .map_err(|err| StoreError::Read(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let batch = response
                    .json::<Vec<CandidatePayload>>()
                    .await
                    .map_err(|err| StoreError::Read(err.to_string()))?;
                Ok(Some(batch))
            }
            status => Err(StoreError::Read(format!(
                "candidate fetch returned {status}"
            ))),
        }
    }
}

impl Drop for HttpSignalingStore {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingStore for HttpSignalingStore {
    async fn create_room(&self, initial: RoomDocument) -> StoreResult<String> {
        let response = self
            .client
            .post(self.rooms_url())
            .json(&initial)
            .send()
            .await
            .map_err(|err| StoreError::Write(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Write(format!(
                "room create returned {}",
                response.status()
            )));
        }
        let created = response
            .json::<CreatedRoom>()
            .await
            .map_err(|err| StoreError::Read(err.to_string()))?;
        Ok(created.room_id)
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<RoomDocument>> {
        Self::fetch_room(&self.client, &self.room_url(room_id)).await
    }

    async fn update_room(&self, room_id: &str, patch: RoomPatch) -> StoreResult<()> {
        let response = self
            .client
            .patch(self.room_url(room_id))
            .json(&patch)
            .send()
            .await
            .map_err(|err| StoreError::Write(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::RoomNotFound(room_id.to_string())),
            status if status.is_success() => Ok(()),
            status => Err(StoreError::Write(format!("room update returned {status}"))),
        }
    }

    async fn subscribe_room(&self, room_id: &str) -> StoreResult<RoomUpdates> {
        let url = self.room_url(room_id);
        let current = Self::fetch_room(&self.client, &url)
            .await?
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(current.clone());

        let client = self.client.clone();
        let poll_interval = self.poll_interval;
        let room = room_id.to_string();
        let handle = tokio::spawn(async move {
            let mut last = current;
            loop {
                sleep(poll_interval).await;
                if tx.is_closed() {
                    break;
                }
                match Self::fetch_room(&client, &url).await {
                    Ok(Some(doc)) => {
                        if doc != last {
                            if tx.send(doc.clone()).is_err() {
                                break;
                            }
                            last = doc;
                        }
                    }
                    // Room deleted; closing the channel is the signal.
                    Ok(None) => break,
                    Err(err) => {
                        warn!(room_id = %room, error = %err, "room poll failed");
                    }
                }
            }
            debug!(room_id = %room, "room poller stopped");
        });
        self.track(handle);
        Ok(rx)
    }

    async fn append_candidate(
        &self,
        room_id: &str,
        side: CandidateSide,
        candidate: CandidatePayload,
    ) -> StoreResult<()> {
        let response = self
            .client
            .post(self.collection_url(room_id, side))
            .json(&candidate)
            .send()
            .await
            .map_err(|err| StoreError::Write(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::RoomNotFound(room_id.to_string())),
            status if status.is_success() => Ok(()),
            status => Err(StoreError::Write(format!(
                "candidate append returned {status}"
            ))),
        }
    }

    async fn subscribe_candidates(
        &self,
        room_id: &str,
        side: CandidateSide,
    ) -> StoreResult<CandidateFeed> {
        if self.get_room(room_id).await?.is_none() {
            return Err(StoreError::RoomNotFound(room_id.to_string()));
        }

        let url = self.collection_url(room_id, side);
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let poll_interval = self.poll_interval;
        let room = room_id.to_string();
        let collection = side.collection();
        let handle = tokio::spawn(async move {
            let mut seen = 0usize;
            loop {
                match Self::fetch_candidates(&client, &url, seen).await {
                    Ok(Some(batch)) => {
                        for candidate in batch {
                            seen += 1;
                            if tx.send(candidate).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(room_id = %room, collection, error = %err, "candidate poll failed");
                    }
                }
                if tx.is_closed() {
                    break;
                }
                sleep(poll_interval).await;
            }
            debug!(room_id = %room, collection, "candidate poller stopped");
        });
        self.track(handle);
        Ok(rx)
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<()> {
        let response = self
            .client
            .delete(self.room_url(room_id))
            .send()
            .await
            .map_err(|err| StoreError::Write(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(StoreError::Write(format!("room delete returned {status}"))),
        }
    }
}
