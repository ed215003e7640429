pub mod connection;
pub mod ice;
pub mod link;
pub mod media;
pub mod session;
pub mod state;
pub mod types;

pub use connection::WebRtcConnector;
pub use link::{PeerConnector, PeerEvent, PeerLink, SignalingState, TransportState};
pub use media::{LocalMedia, LocalTrack, MediaSource, StaticMediaSource};
pub use session::{PeerDeps, PeerSessionManager};
pub use state::{CallStatus, PeerConnectionState};
pub use types::{IceCandidate, RemoteTrack, SdpKind, ServerConfig, SessionDescription, TrackKind};
