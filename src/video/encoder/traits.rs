//! Encoder traits and common types

use bytes::Bytes;

use crate::error::Result;
use crate::video::format::Resolution;
use crate::video::frame::RawFrame;

/// One unit of encoded output, ready to be written to a video track
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Encoded data
    pub data: Bytes,
    /// Sample sequence number (1-based, per view)
    pub sequence: u64,
}

impl EncodedSample {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self { data, sequence }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Video encoder
///
/// Owned exclusively by the encode loop. Not Sync because most codec
/// handles are not thread-safe.
pub trait VideoEncoder: Send {
    /// Get encoder name
    fn name(&self) -> &str;

    /// Encode a raw frame
    ///
    /// `Ok(None)` means the encoder consumed the frame without producing
    /// output yet (e.g. it is buffering for B-frames).
    fn encode(&mut self, frame: &RawFrame) -> Result<Option<Bytes>>;
}

/// Encoder factory, called once per view with the first frame's bounds
pub trait EncoderFactory: Send + Sync {
    /// MIME type of the produced samples (e.g. "video/VP8")
    fn mime_type(&self) -> &str;

    /// Create an encoder for the given resolution
    fn create(&self, resolution: Resolution) -> Result<Box<dyn VideoEncoder>>;
}
