use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ViewError};
use crate::webrtc::config::WebRtcConfig;

/// Configuration of one published view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Human readable stream name
    pub stream_name: String,
    /// Stream number, used to name the signaling endpoint (`offer_<n>`)
    pub stream_number: u32,
    /// Verbose per-sample logging
    pub debug: bool,
    /// Nominal duration written with every sample
    pub frame_duration_ms: u64,
    /// Upper bound for one connection's sample write
    pub write_timeout_ms: u64,
    /// Raw frames buffered before producers are back-pressured
    pub input_queue_capacity: usize,
    /// Encoded samples buffered between the encode and fan-out loops
    pub sample_queue_capacity: usize,
    /// Transport settings
    pub webrtc: WebRtcConfig,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            stream_number: 0,
            debug: false,
            frame_duration_ms: 33,
            write_timeout_ms: 1000,
            input_queue_capacity: 1,
            sample_queue_capacity: 1,
            webrtc: WebRtcConfig::default(),
        }
    }
}

impl ViewConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_duration_ms == 0 {
            return Err(ViewError::Config("frame_duration_ms must be > 0".into()));
        }
        if self.write_timeout_ms == 0 {
            return Err(ViewError::Config("write_timeout_ms must be > 0".into()));
        }
        if self.input_queue_capacity == 0 {
            return Err(ViewError::Config("input_queue_capacity must be > 0".into()));
        }
        if self.sample_queue_capacity == 0 {
            return Err(ViewError::Config("sample_queue_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Name of the HTTP signaling handler for this view
    pub fn handler_name(&self) -> String {
        format!("offer_{}", self.stream_number)
    }

    /// Name of the HTTP route serving the browser viewer
    pub fn viewer_name(&self) -> String {
        format!("view_{}", self.stream_number)
    }
}
