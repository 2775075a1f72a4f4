//! Video types shared by producers, encoders and the frame pipeline

pub mod encoder;
pub mod format;
pub mod frame;

pub use encoder::{EncodedSample, EncoderFactory, VideoEncoder};
pub use format::{PixelFormat, Resolution};
pub use frame::RawFrame;
