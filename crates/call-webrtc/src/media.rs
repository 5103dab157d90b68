//! Sample-fed local tracks standing in for device capture.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use call_engine::{CallResult, LocalMedia, LocalTrack, MediaSource, TrackKind};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// One local track backed by a [`TrackLocalStaticSample`]. Disabling
/// pauses the sample feed; stopping it is final for the session.
pub struct StaticTrack {
    kind: TrackKind,
    id: String,
    sample: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl StaticTrack {
    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            id.clone(),
            stream_id.into(),
        ));
        Arc::new(Self::new(TrackKind::Audio, id, sample))
    }

    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            id.clone(),
            stream_id.into(),
        ));
        Arc::new(Self::new(TrackKind::Video, id, sample))
    }

    fn new(kind: TrackKind, id: String, sample: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            id,
            sample,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// The webrtc track to attach to a peer connection.
    pub fn sample(&self) -> Arc<TrackLocalStaticSample> {
        self.sample.clone()
    }

    /// Whether a capture loop should keep writing samples right now.
    pub fn feeding(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for StaticTrack {
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
        self.feeding()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn backing(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        let sample: Arc<dyn Any + Send + Sync> = self.sample.clone();
        Some(sample)
    }
}

/// Hands out a fresh Opus audio track and VP8 video track per call.
pub struct StaticMedia {
    stream_id: String,
}

impl StaticMedia {
    pub fn new(stream_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.into(),
        })
    }
}

#[async_trait]
impl MediaSource for StaticMedia {
    async fn acquire(&self) -> CallResult<LocalMedia> {
        let audio = StaticTrack::audio("audio", self.stream_id.clone());
        let video = StaticTrack::video("video", self.stream_id.clone());
        Ok(LocalMedia::new(vec![audio, video]))
    }
}
