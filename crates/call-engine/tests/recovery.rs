use std::sync::Arc;
use std::time::Duration;

use call_engine::media::mock::{MockConnector, MockMediaSource, MockPeer};
use call_engine::{
    CallConfig, CallEvent, CallManager, ConnectionState, LinkQuality, NegotiationState,
    TransportSample,
};
use signal_store::memory::MemoryStore;
use signal_store::{RoomPatch, SdpPayload, SignalingStore};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Short watchdog so unanswered negotiations burn through the restart
/// budget within the test.
fn fast_watchdog() -> CallConfig {
    CallConfig {
        disconnect_grace: Duration::from_millis(40),
        connect_timeout: Duration::from_millis(150),
        max_restart_attempts: 2,
        ..CallConfig::default()
    }
}

/// Watchdog cadence of [`fast_watchdog`] with restart attempts to
/// spare, for tests that need rounds to keep coming without ending
/// the call.
fn patient_watchdog() -> CallConfig {
    CallConfig {
        disconnect_grace: Duration::from_millis(40),
        connect_timeout: Duration::from_millis(150),
        max_restart_attempts: 5,
        ..CallConfig::default()
    }
}

/// Short grace with the default ten-second watchdog, so only the grace
/// timer can fire during the test.
fn fast_grace() -> CallConfig {
    CallConfig {
        disconnect_grace: Duration::from_millis(40),
        ..CallConfig::default()
    }
}

fn fast_stats() -> CallConfig {
    CallConfig {
        stats_interval: Duration::from_millis(25),
        ..CallConfig::default()
    }
}

struct Party {
    manager: CallManager,
    connector: Arc<MockConnector>,
}

fn party(store: Arc<MemoryStore>, config: CallConfig) -> Party {
    let connector = MockConnector::new();
    let manager = CallManager::new(store, connector.clone(), MockMediaSource::new(), config);
    Party { manager, connector }
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) {
    let waited = timeout(limit, async {
        loop {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within {limit:?}");
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<CallEvent>,
    what: &str,
    mut accept: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if accept(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event stream closed waiting for {what}")
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn establish(caller: &Party, callee: &Party) -> (String, Arc<MockPeer>, Arc<MockPeer>) {
    let room_id = caller
        .manager
        .start_as_initiator()
        .await
        .expect("start call");
    callee
        .manager
        .join_as_responder(&room_id)
        .await
        .expect("join call");
    let caller_peer = caller.connector.last_peer().expect("caller peer");
    let callee_peer = callee.connector.last_peer().expect("callee peer");
    wait_until(Duration::from_secs(5), || {
        !caller_peer.remote_descriptions().is_empty()
    })
    .await;
    caller_peer.emit_state(ConnectionState::Connected);
    callee_peer.emit_state(ConnectionState::Connected);
    (room_id, caller_peer, callee_peer)
}

#[tokio::test]
async fn unanswered_watchdog_restarts_within_budget_then_fails() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let caller = party(store.clone(), fast_watchdog());
    let mut events = caller.manager.subscribe();

    let room_id = caller
        .manager
        .start_as_initiator()
        .await
        .expect("start call");
    let caller_peer = caller.connector.last_peer().expect("caller peer");

    // nobody ever answers: each expiry buys exactly one restart until
    // the budget is gone
    wait_for_event(&mut events, "reconnecting", |e| {
        matches!(e, CallEvent::NegotiationChanged(NegotiationState::Reconnecting))
    })
    .await;
    wait_for_event(&mut events, "terminal failure", |e| {
        matches!(e, CallEvent::NegotiationChanged(NegotiationState::Failed))
    })
    .await;

    let offers = caller_peer.created_offers();
    assert_eq!(offers.len(), 3, "initial offer plus two restarts");
    assert!(offers[1].sdp.contains("ice-restart"));
    assert!(offers[2].sdp.contains("ice-restart"));

    // failed means failed: the room stops changing
    let settled = store
        .get_room(&room_id)
        .await
        .expect("read")
        .expect("room exists");
    sleep(Duration::from_millis(400)).await;
    assert_eq!(caller_peer.created_offers().len(), 3);
    let later = store
        .get_room(&room_id)
        .await
        .expect("read")
        .expect("room exists");
    assert_eq!(settled, later);
}

#[tokio::test]
async fn pre_restart_answer_is_ignored_and_the_call_still_converges() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let caller = party(store.clone(), patient_watchdog());
    let callee = party(store.clone(), CallConfig::default());
    let mut caller_events = caller.manager.subscribe();

    let room_id = caller
        .manager
        .start_as_initiator()
        .await
        .expect("start call");
    let caller_peer = caller.connector.last_peer().expect("caller peer");
    let first_offer = store
        .get_room(&room_id)
        .await
        .expect("read")
        .expect("room exists")
        .offer
        .expect("offer stored");

    // the first round goes unanswered long enough for the watchdog to
    // publish a restart offer
    wait_for_event(&mut caller_events, "reconnecting", |e| {
        matches!(e, CallEvent::NegotiationChanged(NegotiationState::Reconnecting))
    })
    .await;
    wait_until(Duration::from_secs(5), || {
        caller_peer.created_offers().len() == 2
    })
    .await;

    // a peer that read the first offer answers it only now; the
    // initiator sees the pre-restart snapshot in one delivery
    store
        .update_room(
            &room_id,
            RoomPatch {
                offer: Some(first_offer),
                answer: Some(SdpPayload::answer("v=0 answer-for-round-one")),
                clear_answer: false,
            },
        )
        .await
        .expect("stale snapshot write");
    sleep(Duration::from_millis(50)).await;
    assert!(caller_peer.remote_descriptions().is_empty());

    // the next watchdog round renews the offer and retires the stale
    // answer
    timeout(Duration::from_secs(5), async {
        loop {
            let doc = store
                .get_room(&room_id)
                .await
                .expect("read")
                .expect("room exists");
            if doc.answer.is_none() && doc.offer.expect("offer").sdp.contains("ice-restart") {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("restart write must retire the stale answer");

    // a live responder joins on the renewed offer and the call lands
    callee
        .manager
        .join_as_responder(&room_id)
        .await
        .expect("join call");
    let callee_peer = callee.connector.last_peer().expect("callee peer");
    wait_until(Duration::from_secs(5), || {
        !caller_peer.remote_descriptions().is_empty()
    })
    .await;
    caller_peer.emit_state(ConnectionState::Connected);
    callee_peer.emit_state(ConnectionState::Connected);
    wait_for_event(&mut caller_events, "recovered", |e| {
        matches!(e, CallEvent::NegotiationChanged(NegotiationState::Connected))
    })
    .await;

    let applied = caller_peer.remote_descriptions();
    assert!(!applied.is_empty());
    assert!(applied.iter().all(|desc| !desc.sdp.contains("round-one")));
}

#[tokio::test]
async fn reconnect_within_grace_avoids_a_restart() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let caller = party(store.clone(), fast_grace());
    let callee = party(store.clone(), fast_grace());
    let (_room_id, caller_peer, _callee_peer) = establish(&caller, &callee).await;

    caller_peer.emit_state(ConnectionState::Disconnected);
    sleep(Duration::from_millis(10)).await;
    caller_peer.emit_state(ConnectionState::Connected);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(caller_peer.created_offers().len(), 1);
}

#[tokio::test]
async fn disconnect_past_grace_restarts_and_renegotiates() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let caller = party(store.clone(), fast_grace());
    let callee = party(store.clone(), fast_grace());
    let mut caller_events = caller.manager.subscribe();
    let (room_id, caller_peer, callee_peer) = establish(&caller, &callee).await;
    wait_for_event(&mut caller_events, "first connect", |e| {
        matches!(e, CallEvent::NegotiationChanged(NegotiationState::Connected))
    })
    .await;

    caller_peer.emit_state(ConnectionState::Disconnected);

    wait_for_event(&mut caller_events, "reconnecting", |e| {
        matches!(e, CallEvent::NegotiationChanged(NegotiationState::Reconnecting))
    })
    .await;

    // the revised offer crosses the store and the responder re-answers
    wait_until(Duration::from_secs(5), || {
        callee_peer.remote_descriptions().len() == 2
    })
    .await;
    wait_until(Duration::from_secs(5), || {
        caller_peer.remote_descriptions().len() == 2
    })
    .await;

    caller_peer.emit_state(ConnectionState::Connected);
    callee_peer.emit_state(ConnectionState::Connected);
    wait_for_event(&mut caller_events, "reconnected", |e| {
        matches!(e, CallEvent::NegotiationChanged(NegotiationState::Connected))
    })
    .await;

    let offers = caller_peer.created_offers();
    assert_eq!(offers.len(), 2);
    assert!(offers[1].sdp.contains("ice-restart"));
    let doc = store
        .get_room(&room_id)
        .await
        .expect("read")
        .expect("room exists");
    assert!(doc.offer.expect("offer").sdp.contains("ice-restart"));
    assert!(doc.answer.expect("answer").sdp.contains("answer-2"));
}

#[tokio::test]
async fn recovered_outage_refills_the_restart_budget() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let caller = party(store.clone(), fast_grace());
    let callee = party(store.clone(), fast_grace());
    let mut caller_events = caller.manager.subscribe();
    let (_room_id, caller_peer, callee_peer) = establish(&caller, &callee).await;
    wait_for_event(&mut caller_events, "first connect", |e| {
        matches!(e, CallEvent::NegotiationChanged(NegotiationState::Connected))
    })
    .await;

    for outage in 1..=3u64 {
        caller_peer.emit_state(ConnectionState::Disconnected);
        wait_until(Duration::from_secs(5), || {
            caller_peer.created_offers().len() == 1 + outage as usize
        })
        .await;
        wait_until(Duration::from_secs(5), || {
            callee_peer.remote_descriptions().len() == 1 + outage as usize
        })
        .await;
        caller_peer.emit_state(ConnectionState::Connected);
        callee_peer.emit_state(ConnectionState::Connected);
        wait_for_event(&mut caller_events, "reconnected", |e| {
            matches!(e, CallEvent::NegotiationChanged(NegotiationState::Connected))
        })
        .await;
    }

    // three recovered outages with a budget of two per outage
    assert_eq!(caller_peer.created_offers().len(), 4);
}

#[tokio::test]
async fn packet_loss_drives_quality_classification() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let caller = party(store.clone(), fast_stats());
    let callee = party(store.clone(), fast_stats());
    let mut caller_events = caller.manager.subscribe();
    let (_room_id, caller_peer, _callee_peer) = establish(&caller, &callee).await;

    caller_peer.set_sample(TransportSample {
        packets_sent: 1_000,
        packets_lost: 0,
        round_trip_time: Some(0.025),
    });
    wait_for_event(&mut caller_events, "good quality", |e| {
        matches!(e, CallEvent::QualityChanged(LinkQuality::Good))
    })
    .await;

    caller_peer.set_sample(TransportSample {
        packets_sent: 2_000,
        packets_lost: 600,
        round_trip_time: Some(0.3),
    });
    let event = wait_for_event(&mut caller_events, "poor quality", |e| {
        matches!(e, CallEvent::QualityChanged(LinkQuality::Poor))
    })
    .await;
    assert_eq!(event, CallEvent::QualityChanged(LinkQuality::Poor));

    // the status feed carries the same classification
    wait_for_event(&mut caller_events, "poor status", |e| {
        matches!(
            e,
            CallEvent::Status(update) if update.quality == Some(LinkQuality::Poor)
        )
    })
    .await;
}
