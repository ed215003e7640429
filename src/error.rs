use thiserror::Error;

use crate::model::SessionStatus;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("conflicting update: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Ошибки подбора специалиста. Возвращаются вызывающему как есть.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no providers available")]
    NoCandidatesAvailable,
    #[error("no one available right now, try again later")]
    PoolExhausted,
    #[error("match request cancelled")]
    Cancelled,
    #[error("dispatch run interrupted: {0}")]
    Interrupted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("no capture device found")]
    DeviceNotFound,
    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel subscription failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("malformed signaling frame: {0}")]
    Decode(String),
    #[error("channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer session closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already {0:?}")]
    Terminal(SessionStatus),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("participant is not part of this session")]
    NotParticipant,
    #[error("session is not callable in status {0:?}")]
    NotCallable(SessionStatus),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid ICE server {id}: {reason}")]
    InvalidIceServer { id: String, reason: String },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("config parse error: {0}")]
    Parse(String),
}
