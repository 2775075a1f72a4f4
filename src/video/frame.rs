//! Raw frame data structures

use bytes::Bytes;
use std::time::Instant;

use super::format::{PixelFormat, Resolution};
use crate::error::{Result, ViewError};

/// One raw image pushed by a producer
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Raw pixel data
    data: Bytes,
    /// Frame bounds
    pub resolution: Resolution,
    /// Pixel layout of `data`
    pub format: PixelFormat,
    /// Timestamp when the frame was created
    pub capture_ts: Instant,
}

impl RawFrame {
    /// Create a new raw frame, checking that `data` matches the format and bounds
    pub fn new(data: impl Into<Bytes>, resolution: Resolution, format: PixelFormat) -> Result<Self> {
        let data = data.into();
        if !resolution.is_valid() {
            return Err(ViewError::Encoder(format!(
                "Invalid frame bounds: {}",
                resolution
            )));
        }
        let expected = format.frame_size(resolution);
        if data.len() < expected {
            return Err(ViewError::Encoder(format!(
                "{} frame {} needs {} bytes, got {}",
                format,
                resolution,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            resolution,
            format,
            capture_ts: Instant::now(),
        })
    }

    /// Create a frame filled with a single byte value
    pub fn filled(resolution: Resolution, format: PixelFormat, value: u8) -> Self {
        let data = vec![value; format.frame_size(resolution)];
        Self {
            data: Bytes::from(data),
            resolution,
            format,
            capture_ts: Instant::now(),
        }
    }

    /// Frame bounds, used to size the encoder
    pub fn bounds(&self) -> Resolution {
        self.resolution
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Get age of this frame
    pub fn age(&self) -> std::time::Duration {
        self.capture_ts.elapsed()
    }
}
