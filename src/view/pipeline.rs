//! Frame pipeline
//!
//! ```text
//! FrameSink (producer)
//!        |
//!        v (mpsc::Receiver<RawFrame>)
//! encode loop (single encoder, created from the first frame's bounds)
//!        |
//!        v (mpsc::Receiver<EncodedSample>)
//! fan-out loop (registry snapshot per sample)
//!   ┌────┴────┬────────┐
//!   v         v        v
//! Peer1     Peer2    Peer3 ...
//! ```
//!
//! A peer whose write fails or exceeds the write timeout is evicted from the
//! registry and its entry's eviction token is cancelled; the other peers keep
//! receiving.

use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use super::registry::ConnectionRegistry;
use crate::utils::LogThrottler;
use crate::video::{EncodedSample, EncoderFactory, RawFrame, VideoEncoder};

/// Pipeline statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub frames_encoded: u64,
    pub frames_without_output: u64,
    pub encode_errors: u64,
    pub samples_sent: u64,
    pub sample_writes: u64,
    pub connections_evicted: u64,
}

#[derive(Default)]
pub(crate) struct PipelineCounters {
    frames_received: AtomicU64,
    frames_encoded: AtomicU64,
    frames_without_output: AtomicU64,
    encode_errors: AtomicU64,
    samples_sent: AtomicU64,
    sample_writes: AtomicU64,
    connections_evicted: AtomicU64,
}

impl PipelineCounters {
    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_without_output: self.frames_without_output.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
            sample_writes: self.sample_writes.load(Ordering::Relaxed),
            connections_evicted: self.connections_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Everything the two loops need besides their channels
pub(crate) struct FramePipeline {
    pub factory: Arc<dyn EncoderFactory>,
    pub registry: Arc<ConnectionRegistry>,
    pub counters: Arc<PipelineCounters>,
    pub shutdown: CancellationToken,
    pub frame_duration: Duration,
    pub write_timeout: Duration,
    pub sample_queue_capacity: usize,
    pub debug: bool,
    pub throttler: Arc<LogThrottler>,
}

impl FramePipeline {
    /// Spawn the encode and fan-out loops on `tasks`
    pub(crate) fn spawn(self, input_rx: mpsc::Receiver<RawFrame>, tasks: &TaskTracker, span: &Span) {
        let (sample_tx, sample_rx) = mpsc::channel(self.sample_queue_capacity);

        let encode = EncodeLoop {
            factory: self.factory,
            counters: self.counters.clone(),
            shutdown: self.shutdown.clone(),
            throttler: self.throttler,
        };
        let fanout = FanOutLoop {
            registry: self.registry,
            counters: self.counters,
            shutdown: self.shutdown,
            frame_duration: self.frame_duration,
            write_timeout: self.write_timeout,
            debug: self.debug,
        };

        tasks.spawn(encode.run(input_rx, sample_tx).instrument(span.clone()));
        tasks.spawn(fanout.run(sample_rx).instrument(span.clone()));
    }
}

/// Throttle key for encode failures
pub(crate) const ENCODE_ERROR_KEY: &str = "encode";

struct EncodeLoop {
    factory: Arc<dyn EncoderFactory>,
    counters: Arc<PipelineCounters>,
    shutdown: CancellationToken,
    throttler: Arc<LogThrottler>,
}

impl EncodeLoop {
    /// Drops `sample_tx` on exit, which lets the fan-out loop drain and stop.
    async fn run(
        self,
        mut input_rx: mpsc::Receiver<RawFrame>,
        sample_tx: mpsc::Sender<EncodedSample>,
    ) {
        let mut encoder: Option<Box<dyn VideoEncoder>> = None;
        let mut sequence: u64 = 0;

        info!("Encode loop started");

        loop {
            let frame = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                frame = input_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

            if encoder.is_none() {
                let bounds = frame.bounds();
                match self.factory.create(bounds) {
                    Ok(e) => {
                        info!("Created encoder {} for {} ({})", e.name(), bounds, self.factory.mime_type());
                        encoder = Some(e);
                    }
                    Err(e) => {
                        error!("Failed to initialize encoder for {}: {}", bounds, e);
                        break;
                    }
                }
            }
            let Some(enc) = encoder.as_mut() else {
                break;
            };

            let data = match enc.encode(&frame) {
                Ok(Some(data)) => data,
                Ok(None) => {
                    self.counters.frames_without_output.fetch_add(1, Ordering::Relaxed);
                    trace!("Encoder produced no output");
                    continue;
                }
                Err(e) => {
                    self.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                    match self.throttler.check(ENCODE_ERROR_KEY) {
                        Some(0) => error!("Encoding failed: {}", e),
                        Some(suppressed) => {
                            error!("Encoding failed: {} ({} similar errors suppressed)", e, suppressed)
                        }
                        None => {}
                    }
                    continue;
                }
            };

            self.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
            sequence += 1;
            let sample = EncodedSample::new(data, sequence);

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                result = sample_tx.send(sample) => {
                    if result.is_err() {
                        debug!("Sample queue closed");
                        break;
                    }
                }
            }
        }

        info!("Encode loop stopped ({} samples produced)", sequence);
    }
}

struct FanOutLoop {
    registry: Arc<ConnectionRegistry>,
    counters: Arc<PipelineCounters>,
    shutdown: CancellationToken,
    frame_duration: Duration,
    write_timeout: Duration,
    debug: bool,
}

impl FanOutLoop {
    async fn run(self, mut sample_rx: mpsc::Receiver<EncodedSample>) {
        let mut samples_sent: u64 = 0;
        let mut discarded: u64 = 0;

        info!("Fan-out loop started");

        while let Some(sample) = sample_rx.recv().await {
            if self.shutdown.is_cancelled() {
                discarded += 1;
                continue;
            }

            let started = Instant::now();
            let connections = self.registry.snapshot();

            let writes = connections.into_iter().map(|(id, entry)| {
                let data = sample.data.clone();
                let duration = self.frame_duration;
                let write_timeout = self.write_timeout;
                async move {
                    let result =
                        tokio::time::timeout(write_timeout, entry.samples.write_sample(data, duration))
                            .await;
                    (id, result)
                }
            });

            for (id, result) in join_all(writes).await {
                match result {
                    Ok(Ok(())) => {
                        self.counters.sample_writes.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        warn!(connection = %id, "Sample write failed, dropping connection: {}", e);
                        self.evict(&id);
                    }
                    Err(_) => {
                        warn!(
                            connection = %id,
                            "Sample write timed out after {:?}, dropping connection",
                            self.write_timeout
                        );
                        self.evict(&id);
                    }
                }
            }

            samples_sent += 1;
            self.counters.samples_sent.fetch_add(1, Ordering::Relaxed);

            if self.debug {
                debug!(
                    frames_sent = samples_sent,
                    sequence = sample.sequence,
                    write_time = ?started.elapsed(),
                    "Wrote sample"
                );
            }
        }

        info!(
            "Fan-out loop stopped ({} samples sent, {} discarded on shutdown)",
            samples_sent, discarded
        );
    }

    /// Drop the peer and signal its owner to close the transport
    fn evict(&self, id: &super::connection::ConnectionId) {
        if let Some(entry) = self.registry.remove(id) {
            entry.evict();
            self.counters.connections_evicted.fetch_add(1, Ordering::Relaxed);
        }
    }
}
