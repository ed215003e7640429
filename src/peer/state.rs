use serde::{Deserialize, Serialize};

use crate::peer::link::{SignalingState, TransportState};

/// Состояние соединения одного участника, выводится из состояния сигнализации и транспорта
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerConnectionState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Disconnected,
    Closed,
}

impl PeerConnectionState {
    pub fn derive(signaling: Option<SignalingState>, transport: TransportState) -> Self {
        let Some(signaling) = signaling else {
            return PeerConnectionState::Idle;
        };

        match (signaling, transport) {
            (SignalingState::Closed, _) | (_, TransportState::Closed) => PeerConnectionState::Closed,
            (_, TransportState::Disconnected | TransportState::Failed) => {
                PeerConnectionState::Disconnected
            }
            (SignalingState::HaveLocalOffer, _) => PeerConnectionState::HaveLocalOffer,
            (SignalingState::HaveRemoteOffer, _) => PeerConnectionState::HaveRemoteOffer,
            (SignalingState::Stable, _) | (SignalingState::Other, _) => PeerConnectionState::Stable,
        }
    }
}

/// Статус звонка для потребителя (UI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    PermissionDenied,
    DeviceNotFound,
    Failed,
    Closed,
}

impl CallStatus {
    /// После этих статусов `start()` можно вызвать ещё раз
    pub fn is_retryable(self) -> bool {
        matches!(self, CallStatus::PermissionDenied | CallStatus::DeviceNotFound)
    }
}
