//! Peer session
//!
//! One browser peer: a peer connection carrying the view's video track, the
//! `"data"` command channel and the `"clicks"` channel. Both channels are
//! pre-negotiated on fixed stream ids, so the browser opens them with
//! `{negotiated: true, id}`.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::candidate::CandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use crate::error::{Result, ViewError};
use crate::view::{
    ChannelMessage, ConnectionEntry, ConnectionId, ConnectionState, ControlSink, RemoteView,
    SampleSink,
};

/// Command/side channel
pub const DATA_CHANNEL_LABEL: &str = "data";
pub const DATA_CHANNEL_ID: u16 = 0;

/// Pointer click channel
pub const CLICK_CHANNEL_LABEL: &str = "clicks";
pub const CLICK_CHANNEL_ID: u16 = 1;

const TRACK_ID: &str = "video";
const STREAM_ID: &str = "remote-view";

/// [`SampleSink`] over a sample-based video track
pub struct TrackSampleSink {
    track: Arc<TrackLocalStaticSample>,
}

impl TrackSampleSink {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl SampleSink for TrackSampleSink {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| ViewError::Transport(format!("write_sample failed: {}", e)))
    }
}

/// [`ControlSink`] over a data channel
///
/// Holds the channel weakly; the channel's own message handler owns one of
/// these.
pub struct DataChannelSink {
    channel: Weak<RTCDataChannel>,
}

impl DataChannelSink {
    pub fn new(channel: &Arc<RTCDataChannel>) -> Self {
        Self {
            channel: Arc::downgrade(channel),
        }
    }

    fn channel(&self) -> Result<Arc<RTCDataChannel>> {
        self.channel
            .upgrade()
            .ok_or_else(|| ViewError::Transport("data channel closed".into()))
    }
}

#[async_trait]
impl ControlSink for DataChannelSink {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.channel()?.send(&data).await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.channel()?.send_text(text).await?;
        Ok(())
    }
}

/// Map an ICE connection state onto the peer lifecycle
pub fn map_ice_state(state: RTCIceConnectionState) -> Option<ConnectionState> {
    match state {
        RTCIceConnectionState::New | RTCIceConnectionState::Checking => {
            Some(ConnectionState::Negotiating)
        }
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(ConnectionState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

/// Move to `next` unless the current state is already terminal
///
/// Returns `true` if the state changed.
pub(crate) fn advance_state(tx: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    tx.send_if_modified(|current| {
        if current.is_terminated() || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

/// Report name of a remote candidate type; host candidates are not reported
pub fn candidate_kind(kind: CandidateType) -> Option<&'static str> {
    match kind {
        CandidateType::Relay => Some("relay"),
        CandidateType::PeerReflexive => Some("peer-reflexive"),
        CandidateType::ServerReflexive => Some("server-reflexive"),
        _ => None,
    }
}

/// Stats id of a peer connection and the addresses of its non-host remote
/// candidates, keyed by candidate kind
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CandidateSummary {
    pub stats_id: Option<String>,
    pub remote: BTreeMap<&'static str, String>,
}

impl CandidateSummary {
    pub fn from_report(report: &StatsReport) -> Self {
        let mut summary = Self::default();
        for stat in report.reports.values() {
            match stat {
                StatsReportType::PeerConnection(pc) => summary.stats_id = Some(pc.id.clone()),
                StatsReportType::RemoteCandidate(candidate) => {
                    if let Some(kind) = candidate_kind(candidate.candidate_type) {
                        summary.remote.insert(kind, candidate.ip.clone());
                    }
                }
                _ => {}
            }
        }
        summary
    }
}

/// One negotiated peer
pub struct PeerSession {
    id: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    data: Arc<RTCDataChannel>,
    clicks: Arc<RTCDataChannel>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl PeerSession {
    /// Create the peer connection with its track and channels
    pub async fn new(view: &RemoteView, config: &WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ViewError::Transport(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| ViewError::Transport(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| ViewError::Transport(format!("Failed to create peer connection: {}", e)))?,
        );

        match Self::setup(pc.clone(), view).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    debug!("Failed to close peer connection: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn setup(pc: Arc<RTCPeerConnection>, view: &RemoteView) -> Result<Self> {
        let id = ConnectionId::new();

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: view.mime_type().to_owned(),
                ..Default::default()
            },
            TRACK_ID.to_owned(),
            STREAM_ID.to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| ViewError::Transport(format!("Failed to add video track: {}", e)))?;

        let (state_tx, _) = watch::channel(ConnectionState::Negotiating);
        let state_tx = Arc::new(state_tx);

        let tx = state_tx.clone();
        let span = view.span().clone();
        let stats_view = view.clone();
        let stats_pc = Arc::downgrade(&pc);
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let tx = tx.clone();
            // stats are read outside the callback
            if let Some(pc) = stats_pc.upgrade() {
                stats_view.spawn_task(async move {
                    let summary = CandidateSummary::from_report(&pc.get_stats().await);
                    info!(
                        connection = %id,
                        stats_id = summary.stats_id.as_deref().unwrap_or("-"),
                        remote = ?summary.remote,
                        "ICE connection state: {}",
                        s
                    );
                });
            }
            Box::pin(
                async move {
                    if let Some(state) = map_ice_state(s) {
                        if advance_state(&tx, state) {
                            info!(connection = %id, "Peer {}", state);
                        }
                    }
                }
                .instrument(span.clone()),
            )
        }));

        if view.debug() {
            Self::log_transport_states(&pc, id, view);
        }

        let data = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    negotiated: Some(DATA_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ViewError::Transport(format!("Failed to create data channel: {}", e)))?;

        let clicks = pc
            .create_data_channel(
                CLICK_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    negotiated: Some(CLICK_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ViewError::Transport(format!("Failed to create click channel: {}", e)))?;

        let reply = Arc::new(DataChannelSink::new(&data));
        let data_view = view.clone();
        data.on_message(Box::new(move |msg: DataChannelMessage| {
            let view = data_view.clone();
            let reply = reply.clone();
            Box::pin(async move {
                let msg = ChannelMessage {
                    data: msg.data,
                    is_text: msg.is_string,
                };
                view.handle_data_message(reply.as_ref(), msg).await;
            })
        }));

        let click_view = view.clone();
        clicks.on_message(Box::new(move |msg: DataChannelMessage| {
            let view = click_view.clone();
            Box::pin(async move {
                view.handle_click_message(&msg.data);
            })
        }));

        Ok(Self {
            id,
            pc,
            track,
            data,
            clicks,
            state_tx,
        })
    }

    /// Verbose transport logging for views in debug mode
    fn log_transport_states(pc: &RTCPeerConnection, id: ConnectionId, view: &RemoteView) {
        let span = view.span().clone();
        pc.on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
            let span = span.clone();
            Box::pin(async move {
                debug!(parent: &span, connection = %id, "ICE gathering state: {}", s);
            })
        }));

        let span = view.span().clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let span = span.clone();
            Box::pin(async move {
                debug!(parent: &span, connection = %id, "Peer connection state: {}", s);
            })
        }));
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Registry entry for this peer
    pub fn entry(&self) -> ConnectionEntry {
        ConnectionEntry::new(
            Arc::new(TrackSampleSink::new(self.track.clone())),
            Arc::new(DataChannelSink::new(&self.data)),
        )
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Apply the offer and return the answer with every gathered candidate
    ///
    /// Fails with [`ViewError::Stopped`] if the view stops while candidates
    /// are still being gathered.
    pub async fn negotiate(
        &self,
        offer: RTCSessionDescription,
        view: &RemoteView,
    ) -> Result<RTCSessionDescription> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| ViewError::Signaling(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ViewError::Signaling(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| ViewError::Signaling(format!("Failed to set local description: {}", e)))?;

        tokio::select! {
            _ = view.cancelled() => return Err(ViewError::Stopped),
            _ = gather_complete.recv() => {}
        }

        self.pc
            .local_description()
            .await
            .ok_or_else(|| ViewError::Signaling("no local description after gathering".into()))
    }

    pub async fn close(&self) {
        advance_state(&self.state_tx, ConnectionState::Closed);

        for channel in [&self.data, &self.clicks] {
            if let Err(e) = channel.close().await {
                debug!(connection = %self.id, "Failed to close {} channel: {}", channel.label(), e);
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(connection = %self.id, "Failed to close peer connection: {}", e);
        }
        debug!(connection = %self.id, "Peer session closed");
    }
}
