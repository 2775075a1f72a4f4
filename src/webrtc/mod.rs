//! WebRTC transport for views
//!
//! ```text
//! Browser ──POST /offer_<n> (base64 offer)──> SignalingAdapter
//!                                                   |
//!                                                   v
//!                                  PeerSession (video track + data channels)
//!                                                   |
//!                           ICE connected ──> RemoteView::attach
//!                           ICE terminated ─> RemoteView::detach, close
//!                           evicted ────────> close
//! ```

pub mod config;
pub mod session;
pub mod signaling;

pub use config::{TurnServer, WebRtcConfig};
pub use session::{
    CandidateSummary, DataChannelSink, PeerSession, TrackSampleSink, CLICK_CHANNEL_ID,
    CLICK_CHANNEL_LABEL, DATA_CHANNEL_ID, DATA_CHANNEL_LABEL,
};
pub use signaling::{decode_session, encode_session, SignalingAdapter};
