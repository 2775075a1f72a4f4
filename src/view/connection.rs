//! Per-peer connection record and the transport capabilities it wraps

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Opaque identity of one transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound video path of a connection
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Write one encoded sample with its nominal duration
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()>;
}

/// Outbound side-channel path of a connection
#[async_trait]
pub trait ControlSink: Send + Sync {
    /// Send a binary message
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Send a text message
    async fn send_text(&self, text: String) -> Result<()>;
}

/// Record held by the registry for one connected peer
///
/// Clones share one eviction token, so whoever owns the transport can observe
/// the pipeline dropping the peer and tear the transport down.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub samples: Arc<dyn SampleSink>,
    pub control: Arc<dyn ControlSink>,
    evicted: CancellationToken,
}

impl ConnectionEntry {
    pub fn new(samples: Arc<dyn SampleSink>, control: Arc<dyn ControlSink>) -> Self {
        Self {
            samples,
            control,
            evicted: CancellationToken::new(),
        }
    }

    /// Mark the peer as dropped by the pipeline
    pub fn evict(&self) {
        self.evicted.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Resolves once [`evict`](Self::evict) has been called on any clone
    pub async fn evicted(&self) {
        self.evicted.cancelled().await
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry").finish_non_exhaustive()
    }
}

/// Transport lifecycle of a peer
///
/// `Negotiating -> Connected -> {Disconnected, Failed, Closed}`; the
/// terminated states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}
