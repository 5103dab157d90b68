//! WebRTC bindings for `call-engine`.
//!
//! Implements the engine's transport seams ([`PeerConnector`] and
//! [`PeerHandle`]) on top of the `webrtc` crate: peer construction,
//! trickle candidate export, SDP payload conversion, and outbound
//! stats sampling. [`StaticMedia`] provides sample-fed local tracks
//! for hosts without a capture pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use call_engine::{
    CallError, CallResult, ConnectionState, IceServer, LocalMedia, PeerConnector, PeerEvent,
    PeerHandle, PeerSession, TransportSample,
};
use signal_store::{CandidatePayload, SdpPayload};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::util::vnet::net::Net;

mod media;

pub use media::{StaticMedia, StaticTrack};

// Tuned for a two-party call: report Disconnected quickly so the
// engine's grace timer starts early, but give ICE a full window before
// declaring failure.
const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Builds real peer connections. An optional virtual network routes
/// all ICE traffic in-process so tests never touch OS sockets.
#[derive(Default)]
pub struct WebRtcConnector {
    vnet: Option<Arc<Net>>,
}

impl WebRtcConnector {
    pub fn new() -> Self {
        Self { vnet: None }
    }

    pub fn with_vnet(vnet: Arc<Net>) -> Self {
        Self { vnet: Some(vnet) }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, media: &LocalMedia, servers: &[IceServer]) -> CallResult<PeerSession> {
        let mut setting = SettingEngine::default();
        if let Some(vnet) = &self.vnet {
            setting.set_vnet(Some(vnet.clone()));
        }
        setting.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );

        let api = build_api(setting)?;
        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(servers))
                .await
                .map_err(to_setup_error)?,
        );

        for track in media.tracks() {
            let backing = track.backing().ok_or_else(|| {
                CallError::Setup(format!("track {} has no transport backing", track.id()))
            })?;
            let sample = backing.downcast::<TrackLocalStaticSample>().map_err(|_| {
                CallError::Setup(format!("track {} is not a webrtc sample track", track.id()))
            })?;
            let rtp_sender = pc.add_track(sample).await.map_err(to_setup_error)?;
            // senders stall unless their RTCP feed is drained
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let candidate_tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(PeerEvent::Candidate(CandidatePayload {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(err) => {
                            warn!(error = %err, "local candidate serialization failed");
                        }
                    }
                }
            })
        }));

        let state_tx = event_tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                if let Some(mapped) = map_connection_state(state) {
                    let _ = tx.send(PeerEvent::StateChanged(mapped));
                }
            })
        }));

        debug!(
            servers = servers.len(),
            tracks = media.tracks().len(),
            "peer connection ready"
        );
        Ok(PeerSession {
            handle: Arc::new(WebRtcPeer { pc }),
            events: event_rx,
        })
    }
}

/// One live `RTCPeerConnection` behind the engine's handle seam.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> CallResult<SdpPayload> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(to_setup_error)?;
        Ok(payload_from_description(&offer))
    }

    async fn create_answer(&self) -> CallResult<SdpPayload> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_setup_error)?;
        Ok(payload_from_description(&answer))
    }

    async fn set_local_description(&self, desc: SdpPayload) -> CallResult<()> {
        let desc = description_from_payload(&desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_setup_error)
    }

    async fn set_remote_description(&self, desc: SdpPayload) -> CallResult<()> {
        let desc = description_from_payload(&desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(to_setup_error)
    }

    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> CallResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| CallError::CandidateApply(err.to_string()))
    }

    async fn transport_stats(&self) -> CallResult<TransportSample> {
        let stats = self.pc.get_stats().await;
        let mut sample = TransportSample::default();
        for (_key, report) in stats.reports.iter() {
            if let StatsReportType::OutboundRTP(outbound) = report {
                sample.packets_sent += outbound.packets_sent;
            }
            if let StatsReportType::RemoteInboundRTP(remote) = report {
                sample.packets_lost += remote.packets_lost;
                if let Some(rtt) = remote.round_trip_time {
                    sample.round_trip_time = Some(rtt);
                }
            }
        }
        Ok(sample)
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer close reported an error");
        }
    }
}

fn build_api(setting: SettingEngine) -> CallResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(servers: &[IceServer]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Checking),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn payload_from_description(desc: &RTCSessionDescription) -> SdpPayload {
    SdpPayload {
        typ: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    }
}

fn description_from_payload(payload: &SdpPayload) -> CallResult<RTCSessionDescription> {
    let description = match RTCSdpType::from(payload.typ.as_str()) {
        RTCSdpType::Offer => {
            RTCSessionDescription::offer(payload.sdp.clone()).map_err(to_setup_error)?
        }
        RTCSdpType::Answer => {
            RTCSessionDescription::answer(payload.sdp.clone()).map_err(to_setup_error)?
        }
        RTCSdpType::Pranswer => {
            RTCSessionDescription::pranswer(payload.sdp.clone()).map_err(to_setup_error)?
        }
        RTCSdpType::Rollback | RTCSdpType::Unspecified => {
            return Err(CallError::Setup(format!(
                "unsupported sdp type {}",
                payload.typ
            )));
        }
    };
    Ok(description)
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> CallError {
    CallError::Setup(err.to_string())
}
