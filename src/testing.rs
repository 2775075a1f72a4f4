//! Recording sinks and scripted encoders for unit tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, ViewError};
use crate::video::{EncoderFactory, RawFrame, Resolution, VideoEncoder};
use crate::view::connection::{ConnectionEntry, ControlSink, SampleSink};

/// A control-sink message captured by [`RecordingPeer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Binary(Bytes),
}

/// Fake transport session that records everything written to it
#[derive(Clone, Default)]
pub struct RecordingPeer {
    pub samples: Arc<Mutex<Vec<(Bytes, Duration)>>>,
    pub control: Arc<Mutex<Vec<Sent>>>,
    pub fail_writes: Arc<AtomicBool>,
    pub stall_writes: Arc<AtomicBool>,
}

impl RecordingPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self) -> ConnectionEntry {
        ConnectionEntry::new(Arc::new(self.clone()), Arc::new(self.clone()))
    }

    pub fn sample_data(&self) -> Vec<Bytes> {
        self.samples.lock().iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.control.lock().clone()
    }
}

#[async_trait]
impl SampleSink for RecordingPeer {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.stall_writes.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(ViewError::Transport("write failed".into()));
        }
        self.samples.lock().push((data, duration));
        Ok(())
    }
}

#[async_trait]
impl ControlSink for RecordingPeer {
    async fn send(&self, data: Bytes) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(ViewError::Transport("send failed".into()));
        }
        self.control.lock().push(Sent::Binary(data));
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(ViewError::Transport("send failed".into()));
        }
        self.control.lock().push(Sent::Text(text));
        Ok(())
    }
}

/// Per-frame outcome for [`ScriptedEncoder`]
#[derive(Debug, Clone)]
pub enum Step {
    Sample(&'static [u8]),
    NoOutput,
    Fail,
}

/// Factory whose encoders replay a fixed script, then echo the first byte
/// of each frame
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    pub script: Arc<Mutex<VecDeque<Step>>>,
    pub created: Arc<Mutex<Vec<Resolution>>>,
    pub fail_create: Arc<AtomicBool>,
    pub encoded: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Default::default()
        }
    }
}

impl EncoderFactory for ScriptedFactory {
    fn mime_type(&self) -> &str {
        "video/VP8"
    }

    fn create(&self, resolution: Resolution) -> Result<Box<dyn VideoEncoder>> {
        if self.fail_create.load(Ordering::Acquire) {
            return Err(ViewError::Encoder("no codec".into()));
        }
        self.created.lock().push(resolution);
        Ok(Box::new(ScriptedEncoder {
            script: self.script.clone(),
            encoded: self.encoded.clone(),
        }))
    }
}

pub struct ScriptedEncoder {
    script: Arc<Mutex<VecDeque<Step>>>,
    encoded: Arc<AtomicUsize>,
}

impl VideoEncoder for ScriptedEncoder {
    fn name(&self) -> &str {
        "scripted"
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Option<Bytes>> {
        self.encoded.fetch_add(1, Ordering::AcqRel);
        match self.script.lock().pop_front() {
            Some(Step::Sample(data)) => Ok(Some(Bytes::from_static(data))),
            Some(Step::NoOutput) => Ok(None),
            Some(Step::Fail) => Err(ViewError::Encoder("bad frame".into())),
            None => Ok(Some(Bytes::copy_from_slice(&frame.data()[..1]))),
        }
    }
}

/// Poll `cond` until it holds or two seconds pass
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
