//! Offer/answer signaling
//!
//! Session descriptions travel as one line of text: the description's JSON
//! form, base64 encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::config::WebRtcConfig;
use super::session::PeerSession;
use crate::error::{Result, ViewError};
use crate::view::{ConnectionEntry, ConnectionId, ConnectionState, RemoteView};

/// Encode a session description for the wire
pub fn encode_session(desc: &RTCSessionDescription) -> Result<String> {
    let json = serde_json::to_vec(desc)?;
    Ok(STANDARD.encode(json))
}

/// Decode a session description from the wire
pub fn decode_session(text: &str) -> Result<RTCSessionDescription> {
    let json = STANDARD.decode(text.trim())?;
    Ok(serde_json::from_slice(&json)?)
}

/// Negotiates peers for one view
///
/// Each accepted offer becomes a [`PeerSession`]; the session is attached to
/// the view once ICE connects and closed once it terminates, the pipeline
/// evicts it or the view stops. ICE servers come from the view's
/// [`ViewConfig::webrtc`](crate::config::ViewConfig::webrtc).
pub struct SignalingAdapter {
    view: RemoteView,
    sessions: Arc<Mutex<HashMap<ConnectionId, Arc<PeerSession>>>>,
}

impl SignalingAdapter {
    pub fn new(view: RemoteView) -> Self {
        Self {
            view,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn view(&self) -> &RemoteView {
        &self.view
    }

    pub fn webrtc_config(&self) -> &WebRtcConfig {
        &self.view.config().webrtc
    }

    /// Path segment of the HTTP signaling endpoint
    pub fn handler_name(&self) -> String {
        self.view.config().handler_name()
    }

    /// Number of peers that negotiated and have not terminated yet
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Accept an offer and return the answer
    pub async fn handle_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        if self.view.is_stopped() {
            return Err(ViewError::Stopped);
        }

        let session = Arc::new(PeerSession::new(&self.view, self.webrtc_config()).await?);
        let id = session.id();

        let answer = match session.negotiate(offer, &self.view).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(parent: self.view.span(), connection = %id, "Negotiation failed: {}", e);
                session.close().await;
                return Err(e);
            }
        };

        let entry = session.entry();
        self.sessions.lock().insert(id, session.clone());
        self.view
            .attach_when_connected(id, entry.clone(), session.state());

        let view = self.view.clone();
        let sessions = self.sessions.clone();
        let state = session.state();
        self.view.spawn_task(async move {
            close_when_done(&view, &entry, state).await;
            sessions.lock().remove(&id);
            session.close().await;
        });

        info!(parent: self.view.span(), connection = %id, "Answered offer");
        Ok(answer)
    }
}

/// Resolves once the view stops, the pipeline evicts `entry` or `state`
/// terminates
async fn close_when_done(
    view: &RemoteView,
    entry: &ConnectionEntry,
    mut state: watch::Receiver<ConnectionState>,
) {
    tokio::select! {
        _ = view.cancelled() => {}
        _ = entry.evicted() => {}
        _ = async { state.wait_for(|s| s.is_terminated()).await.is_ok() } => {}
    }
}
