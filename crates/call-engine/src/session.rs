//! Session lifecycle: the public call surface and the per-call driver
//! loop.
//!
//! [`CallManager`] owns at most one live call. Each call runs a driver
//! task that multiplexes the store feeds, transport events, supervisor
//! deadlines, and the stats tick over a single `select!` loop, so the
//! negotiation engine never needs internal locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_store::{CandidateFeed, RoomUpdates, SignalingStore};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, EventHub, LinkQuality, StatusUpdate};
use crate::ice::{IceConfigSource, IceProvider};
use crate::media::{
    ConnectionState, LocalMedia, MediaSource, PeerConnector, PeerEvent, PeerHandle, TrackKind,
};
use crate::negotiation::{CallRole, NegotiationEngine, NegotiationState};
use crate::supervisor::{QualityMeter, ReconnectionSupervisor, SupervisorAction};

struct ActiveCall {
    role: CallRole,
    room_id: String,
    peer: Arc<dyn PeerHandle>,
    media: LocalMedia,
    driver: JoinHandle<()>,
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Owns at most one live call and exposes the UI-facing operations.
pub struct CallManager {
    store: Arc<dyn SignalingStore>,
    connector: Arc<dyn PeerConnector>,
    media_source: Arc<dyn MediaSource>,
    ice: Arc<IceProvider>,
    config: CallConfig,
    events: EventHub,
    active: Mutex<Option<ActiveCall>>,
    // bumped on every start and teardown so a stale driver never
    // releases resources a newer call owns
    generation: Arc<AtomicU64>,
}

impl CallManager {
    pub fn new(
        store: Arc<dyn SignalingStore>,
        connector: Arc<dyn PeerConnector>,
        media_source: Arc<dyn MediaSource>,
        config: CallConfig,
    ) -> Self {
        let ice = Arc::new(IceProvider::new(
            config.ice_servers.clone(),
            config.credential_max_age,
        ));
        Self {
            store,
            connector,
            media_source,
            ice,
            config,
            events: EventHub::default(),
            active: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Routes ICE server selection through a credential source, with
    /// the configured servers as the degraded fallback.
    pub fn with_ice_source(mut self, source: Arc<dyn IceConfigSource>) -> Self {
        self.ice = Arc::new(
            IceProvider::new(self.config.ice_servers.clone(), self.config.credential_max_age)
                .with_source(source),
        );
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn current_room(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|call| call.room_id.clone())
    }

    /// Opens a room and starts the offer path. Any previous call is
    /// torn down first. Returns the room id to share with the peer.
    pub async fn start_as_initiator(&self) -> CallResult<String> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let media = self.media_source.acquire().await?;
        let selection = self.ice.select().await;
        if let Some(reason) = selection.degraded {
            self.events.emit(CallEvent::IceDegraded {
                reason: reason.clone(),
            });
            self.emit_status(None, format!("relay unavailable: {reason}"), None);
        }
        let session = match self.connector.connect(&media, &selection.servers).await {
            Ok(session) => session,
            Err(err) => {
                media.stop_all();
                return Err(err);
            }
        };
        let peer = session.handle.clone();

        let mut engine = NegotiationEngine::new(
            CallRole::Initiator,
            self.store.clone(),
            peer.clone(),
            self.events.clone(),
        );
        let room_id = match engine.create_offer().await {
            Ok(room_id) => room_id,
            Err(err) => {
                peer.close().await;
                media.stop_all();
                return Err(err);
            }
        };
        let (room_updates, remote_candidates) =
            match self.open_feeds(&room_id, CallRole::Initiator).await {
                Ok(feeds) => feeds,
                Err(err) => {
                    peer.close().await;
                    media.stop_all();
                    if let Err(err) = self.store.delete_room(&room_id).await {
                        warn!(room_id = %room_id, error = %err, "orphaned room cleanup failed");
                    }
                    return Err(err);
                }
            };

        info!(room_id = %room_id, "call started as initiator");
        self.emit_status(
            Some(room_id.clone()),
            format!("room {room_id} open, waiting for peer"),
            None,
        );

        let driver = self.spawn_driver(
            engine,
            media.clone(),
            peer.clone(),
            session.events,
            room_updates,
            remote_candidates,
            generation,
        );
        *active = Some(ActiveCall {
            role: CallRole::Initiator,
            room_id: room_id.clone(),
            peer,
            media,
            driver,
        });
        Ok(room_id)
    }

    /// Joins an existing room by id. The room is checked before any
    /// capture device is touched, so a bad id never flashes the camera
    /// light.
    pub async fn join_as_responder(&self, room_id: &str) -> CallResult<()> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let doc = self
            .store
            .get_room(room_id)
            .await?
            .ok_or_else(|| CallError::RoomNotFound(room_id.to_string()))?;
        let Some(offer) = doc.offer else {
            return Err(CallError::NegotiationMismatch {
                expected: "offer",
                got: "absent".to_string(),
            });
        };

        let media = self.media_source.acquire().await?;
        let selection = self.ice.select().await;
        if let Some(reason) = selection.degraded {
            self.events.emit(CallEvent::IceDegraded {
                reason: reason.clone(),
            });
            self.emit_status(
                Some(room_id.to_string()),
                format!("relay unavailable: {reason}"),
                None,
            );
        }
        let session = match self.connector.connect(&media, &selection.servers).await {
            Ok(session) => session,
            Err(err) => {
                media.stop_all();
                return Err(err);
            }
        };
        let peer = session.handle.clone();

        let mut engine = NegotiationEngine::new(
            CallRole::Responder,
            self.store.clone(),
            peer.clone(),
            self.events.clone(),
        );
        engine.attach_room(room_id.to_string());
        if let Err(err) = engine.accept_offer(offer).await {
            peer.close().await;
            media.stop_all();
            return Err(err);
        }
        let (room_updates, remote_candidates) =
            match self.open_feeds(room_id, CallRole::Responder).await {
                Ok(feeds) => feeds,
                Err(err) => {
                    peer.close().await;
                    media.stop_all();
                    return Err(err);
                }
            };

        info!(room_id = %room_id, "call joined as responder");
        self.emit_status(Some(room_id.to_string()), "answer sent, connecting".to_string(), None);

        let driver = self.spawn_driver(
            engine,
            media.clone(),
            peer.clone(),
            session.events,
            room_updates,
            remote_candidates,
            generation,
        );
        *active = Some(ActiveCall {
            role: CallRole::Responder,
            room_id: room_id.to_string(),
            peer,
            media,
            driver,
        });
        Ok(())
    }

    /// Ends the active call: stops the driver, closes the connection,
    /// releases capture, and (initiator only) deletes the room. Safe
    /// to call with no call active.
    pub async fn hang_up(&self) {
        let mut active = self.active.lock().await;
        let Some(call) = active.take() else {
            debug!("hang up with no active call");
            return;
        };
        self.teardown(call).await;
        self.events
            .emit(CallEvent::NegotiationChanged(NegotiationState::Closed));
        self.emit_status(None, "call ended".to_string(), None);
    }

    /// Flips the local audio track. `None` when no call is active or
    /// the track is missing.
    pub async fn toggle_local_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio).await
    }

    /// Flips the local video track. `None` when no call is active or
    /// the track is missing.
    pub async fn toggle_local_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let active = self.active.lock().await;
        let call = active.as_ref()?;
        let enabled = call.media.toggle(kind)?;
        debug!(kind = ?kind, enabled, "local track toggled");
        Some(enabled)
    }

    async fn open_feeds(
        &self,
        room_id: &str,
        role: CallRole,
    ) -> CallResult<(RoomUpdates, CandidateFeed)> {
        let updates = self.store.subscribe_room(room_id).await?;
        let candidates = self
            .store
            .subscribe_candidates(room_id, role.remote_side())
            .await?;
        Ok((updates, candidates))
    }

    async fn teardown(&self, call: ActiveCall) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        call.driver.abort();
        call.peer.close().await;
        call.media.stop_all();
        if call.role == CallRole::Initiator {
            if let Err(err) = self.store.delete_room(&call.room_id).await {
                warn!(room_id = %call.room_id, error = %err, "room delete failed");
            }
        }
        info!(room_id = %call.room_id, role = ?call.role, "call torn down");
    }

    fn emit_status(&self, room_id: Option<String>, status: String, quality: Option<LinkQuality>) {
        self.events.emit(CallEvent::Status(StatusUpdate {
            room_id,
            status,
            quality,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_driver(
        &self,
        engine: NegotiationEngine,
        media: LocalMedia,
        peer: Arc<dyn PeerHandle>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        room_updates: RoomUpdates,
        remote_candidates: CandidateFeed,
        generation: u64,
    ) -> JoinHandle<()> {
        let ctx = DriverContext {
            engine,
            supervisor: ReconnectionSupervisor::new(&self.config),
            meter: QualityMeter::new(),
            peer,
            media,
            peer_events,
            room_updates,
            remote_candidates,
            events: self.events.clone(),
            stats_interval: self.config.stats_interval,
            generation: self.generation.clone(),
            my_generation: generation,
        };
        tokio::spawn(run_driver(ctx))
    }
}

struct DriverContext {
    engine: NegotiationEngine,
    supervisor: ReconnectionSupervisor,
    meter: QualityMeter,
    peer: Arc<dyn PeerHandle>,
    media: LocalMedia,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    room_updates: RoomUpdates,
    remote_candidates: CandidateFeed,
    events: EventHub,
    stats_interval: Duration,
    generation: Arc<AtomicU64>,
    my_generation: u64,
}

async fn run_driver(mut ctx: DriverContext) {
    let mut stats = interval(ctx.stats_interval);
    stats.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_negotiation = ctx.engine.state();
    let mut last_quality: Option<LinkQuality> = None;
    let mut room_open = true;
    let mut candidates_open = true;
    let mut peer_open = true;

    ctx.supervisor.negotiation_started(Instant::now());

    loop {
        let deadline = ctx.supervisor.deadline();
        tokio::select! {
            _ = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                match ctx.supervisor.on_deadline(Instant::now()) {
                    SupervisorAction::Restart => restart(&mut ctx).await,
                    SupervisorAction::GiveUp => ctx.engine.fail("restart attempts exhausted"),
                    SupervisorAction::None => {}
                }
            }
            update = ctx.room_updates.recv(), if room_open => {
                match update {
                    Some(doc) => ctx.engine.on_room_update(doc).await,
                    None => {
                        // room deleted by the initiator: the call is over
                        room_open = false;
                        info!("room removed, ending call");
                        ctx.engine.close();
                    }
                }
            }
            candidate = ctx.remote_candidates.recv(), if candidates_open => {
                match candidate {
                    Some(candidate) => ctx.engine.submit_candidate(candidate).await,
                    None => candidates_open = false,
                }
            }
            event = ctx.peer_events.recv(), if peer_open => {
                match event {
                    Some(PeerEvent::Candidate(candidate)) => {
                        ctx.engine.publish_local_candidate(candidate).await;
                    }
                    Some(PeerEvent::StateChanged(state)) => {
                        ctx.engine.on_connection_state(state);
                        match ctx.supervisor.on_connection_state(state, Instant::now()) {
                            SupervisorAction::Restart => restart(&mut ctx).await,
                            SupervisorAction::GiveUp => {
                                ctx.engine.fail("restart attempts exhausted")
                            }
                            SupervisorAction::None => {}
                        }
                    }
                    None => {
                        peer_open = false;
                        debug!("transport event feed closed");
                        ctx.engine.close();
                    }
                }
            }
            _ = stats.tick() => {
                if ctx.engine.connection_state() == ConnectionState::Connected {
                    match ctx.peer.transport_stats().await {
                        Ok(sample) => {
                            if let Some(quality) = ctx.meter.record(sample) {
                                last_quality = Some(quality);
                                ctx.events.emit(CallEvent::QualityChanged(quality));
                                ctx.events.emit(CallEvent::Status(StatusUpdate {
                                    room_id: ctx.engine.room_id().map(str::to_string),
                                    status: format!("connection quality {}", quality.label()),
                                    quality: Some(quality),
                                }));
                            }
                        }
                        Err(err) => debug!(error = %err, "stats sampling failed"),
                    }
                }
            }
        }

        let state = ctx.engine.state();
        if state != last_negotiation {
            last_negotiation = state;
            ctx.events.emit(CallEvent::Status(StatusUpdate {
                room_id: ctx.engine.room_id().map(str::to_string),
                status: status_line(state, ctx.supervisor.attempts()),
                quality: last_quality,
            }));
        }
        if state.is_terminal() {
            break;
        }
    }

    // natural exit (remote hang-up or terminal failure): release the
    // transport and capture unless a newer call already owns them
    if ctx.generation.load(Ordering::SeqCst) == ctx.my_generation {
        ctx.peer.close().await;
        ctx.media.stop_all();
    }
    debug!("call driver stopped");
}

async fn restart(ctx: &mut DriverContext) {
    ctx.engine.begin_reconnect();
    match ctx.engine.role() {
        CallRole::Initiator => {
            if let Err(err) = ctx.engine.create_offer().await {
                // the watchdog re-fires and retries while budget remains
                warn!(error = %err, "restart offer failed");
            }
        }
        CallRole::Responder => {
            debug!("waiting for a revised offer");
        }
    }
}

fn status_line(state: NegotiationState, attempts: u32) -> String {
    match state {
        NegotiationState::Idle => "idle".to_string(),
        NegotiationState::CreatingOffer => "creating offer".to_string(),
        NegotiationState::OfferSent => "offer sent".to_string(),
        NegotiationState::AwaitingAnswer => "waiting for answer".to_string(),
        NegotiationState::ProcessingOffer => "processing offer".to_string(),
        NegotiationState::CreatingAnswer => "creating answer".to_string(),
        NegotiationState::AnswerSent => "answer sent, connecting".to_string(),
        NegotiationState::Connected => "connected".to_string(),
        NegotiationState::Reconnecting => format!("reconnecting, attempt {attempts}"),
        NegotiationState::Failed => "connection failed".to_string(),
        NegotiationState::Closed => "call ended".to_string(),
    }
}
