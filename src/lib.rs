pub mod broadcast;
pub mod call;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logger;
pub mod model;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod sync;
pub mod utils;

pub use call::{CallContext, CallEndpoint};
pub use config::Settings;
pub use dispatch::{accept_offer, decline_offer, CandidateDispatcher, DispatchRun};
pub use error::{
    CallError, CaptureError, ChannelError, ConfigError, DispatchError, PeerError, SessionError,
    StoreError,
};
pub use session::SessionLedger;
pub use sync::SessionStatusSynchronizer;
