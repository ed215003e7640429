//! Швы между менеджером сессии и конкретной реализацией WebRTC.
//!
//! `PeerLink` повторяет примитивы offer/answer/ICE; менеджер видит только его,
//! поэтому в тестах вместо настоящего соединения подставляется конечный автомат.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::peer::media::LocalTrack;
use crate::peer::types::{IceCandidate, RemoteTrack, SessionDescription};

/// Состояние сигнализации в терминах RTCSignalingState
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
    Other,
}

/// Состояние транспорта (RTCPeerConnectionState)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// События соединения, которые менеджер обрабатывает в своей задаче
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    Transport(TransportState),
    RemoteTrack(RemoteTrack),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Создаёт новое соединение; события соединения уходят в `events`
    async fn connect(&self, events: PeerEventSender) -> Result<Arc<dyn PeerLink>, PeerError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    /// Создаёт offer и устанавливает его как local description
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    /// Создаёт answer на применённый remote offer и устанавливает его локально
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    /// Откатывает неподтверждённый local offer
    async fn rollback(&self) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Заменяет все отправляемые треки на `tracks`
    async fn replace_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}
