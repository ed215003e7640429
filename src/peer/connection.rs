use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::logger::{dump_selected_pair, trace_candidate};
use crate::peer::link::{
    PeerConnector, PeerEvent, PeerEventSender, PeerLink, SignalingState, TransportState,
};
use crate::peer::media::LocalTrack;
use crate::peer::types::{
    IceCandidate, RemoteTrack, SdpKind, ServerConfig, SessionDescription, TrackKind,
};
use crate::utils::{add_ice_url_scheme, random_id};

/// Создаёт соединения на `webrtc` с настроенными STUN/TURN серверами
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    config: PeerConfig,
}

impl WebRtcConnector {
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: PeerEventSender) -> Result<Arc<dyn PeerLink>, PeerError> {
        let link = new_peer(&self.config, events).await?;
        Ok(Arc::new(link))
    }
}

pub struct WebRtcLink {
    id: String,
    pc: Arc<RTCPeerConnection>,
}

/// Создаём Peer и подписываемся на его события
pub async fn new_peer(config: &PeerConfig, events: PeerEventSender) -> Result<WebRtcLink, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(config)).await?);
    let id = random_id();
    info!(connection = %id, "peer connection created");

    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => {
                trace_candidate("LOCAL", &c);
                match c.to_json() {
                    Ok(init) => {
                        let _ = candidate_events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("failed to serialize local candidate: {e}"),
                }
            }
            None => {
                // cand == None означает конец сбора
                debug!("ICE candidate gathering completed");
                let _ = candidate_events.send(PeerEvent::GatheringComplete);
            }
        }
        Box::pin(async {})
    }));

    let stats_pc: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
    let state_events = events.clone();
    let conn_id = id.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!(connection = %conn_id, "peer connection state changed to {st:?}");

        let state = match st {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                TransportState::New
            }
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
        };

        if matches!(state, TransportState::Disconnected | TransportState::Failed) {
            if let Some(pc) = stats_pc.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }

        let _ = state_events.send(PeerEvent::Transport(state));
        Box::pin(async {})
    }));

    let track_events = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                RTPCodecType::Unspecified => None,
            };
            if let Some(kind) = kind {
                info!(track = %track.id(), "remote {kind:?} track arrived");
                let _ = track_events.send(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                }));
            }
            Box::pin(async {})
        },
    ));

    Ok(WebRtcLink { id, pc })
}

/// Создает конфигурацию для peer connection
fn rtc_config(config: &PeerConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&config.ice_servers),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> Option<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Some(SessionDescription::answer(description.sdp)),
        _ => None,
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Other,
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await.and_then(from_rtc)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer.clone()).await?;
        debug!(connection = %self.id, ice_restart, "local offer set");
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        debug!(connection = %self.id, "local answer set");
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let sdp = self
            .pc
            .pending_local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| PeerError::Negotiation("no pending local offer to roll back".into()))?;

        // RTCSessionDescription не даёт собрать rollback напрямую, только через serde
        let rollback: RTCSessionDescription = serde_json::from_value(serde_json::json!({
            "type": "rollback",
            "sdp": sdp,
        }))
        .map_err(|e| PeerError::Negotiation(e.to_string()))?;

        self.pc.set_local_description(rollback).await?;
        info!(connection = %self.id, "local offer rolled back");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn replace_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError> {
        for sender in self.pc.get_senders().await {
            if sender.track().await.is_some() {
                self.pc.remove_track(&sender).await?;
            }
        }

        for track in tracks {
            let sender = self.pc.add_track(track.rtc_track()).await?;
            // RTCP надо вычитывать, иначе interceptors не работают
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        debug!(connection = %self.id, count = tracks.len(), "local tracks attached");
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        info!(connection = %self.id, "peer connection closed");
        Ok(())
    }
}
