use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{CaptureError, PeerError};
use crate::peer::types::TrackKind;
use crate::utils::random_id;

/// Источник локального захвата (камера и микрофон)
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Может ждать сколько угодно долго: решение о доступе принимает пользователь
    async fn acquire(&self) -> Result<LocalMedia, CaptureError>;
}

/// Локальный трек. Клоны делят один и тот же трек и флаги.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let (mime_type, id) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
            TrackKind::Video => (MIME_TYPE_VP8, "video"),
        };
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            format!("{id}-{}", random_id()),
            stream_id.to_owned(),
        );

        Self {
            kind,
            track: Arc::new(track),
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!(track = %self.id(), "local track stopped");
        }
    }

    /// Трек в виде, который принимает RTCPeerConnection::add_track
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Отправляет кадр. Выключенный или остановленный трек кадры отбрасывает (false).
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, PeerError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

/// Захваченные треки одного вызова `acquire`
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn audio_video() -> Self {
        let stream_id = format!("stream-{}", random_id());
        let tracks = vec![
            LocalTrack::new(TrackKind::Audio, &stream_id),
            LocalTrack::new(TrackKind::Video, &stream_id),
        ];
        Self { stream_id, tracks }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Opus/VP8 треки, в которые кадры пишет приложение-хозяин
#[derive(Debug, Default, Clone)]
pub struct StaticMediaSource;

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, CaptureError> {
        Ok(LocalMedia::audio_video())
    }
}
