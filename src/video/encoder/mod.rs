//! Encoder capability consumed by the frame pipeline

pub mod traits;

pub use traits::{EncodedSample, EncoderFactory, VideoEncoder};
