//! Remote View - live video views for browser peers
//!
//! A [`RemoteView`] takes raw frames from a producer, encodes them with a
//! single encoder and fans the samples out to every connected WebRTC peer.
//! Each peer also gets a side channel for commands and a click channel.
//!
//! ```text
//! producer ──> FrameSink ──> encode loop ──> fan-out loop ──> peers
//!                                                 ^
//!                 SignalingAdapter ── attach/detach ┘
//! ```

pub mod config;
pub mod error;
pub mod input;
pub mod utils;
pub mod video;
pub mod view;
pub mod web;
pub mod webrtc;

#[cfg(test)]
mod testing;

pub use config::ViewConfig;
pub use error::{Result, ViewError};
pub use view::{
    ChannelMessage, Command, CommandError, CommandRegistry, CommandResponse, FrameSink,
    PipelineStats, ReadySignal, RemoteView,
};
