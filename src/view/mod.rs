//! View engine
//!
//! A [`RemoteView`] is one published surface: it owns the input queue, the
//! frame pipeline, the connection registry and the command table for that
//! surface.
//!
//! # Lifecycle
//!
//! ```text
//! RemoteView::new ──> FrameSink::send (buffered until first peer)
//!        |
//!        +── attach (first) ──> Ready fires, encode + fan-out loops start
//!        +── attach / detach ──> registry add / remove
//!        |
//!        +── stop ──> cancel, wait for every tracked task
//! ```

pub mod command;
pub mod connection;
mod pipeline;
pub mod registry;

pub use command::{Command, CommandError, CommandHandler, CommandRegistry, CommandResponse};
pub use connection::{ConnectionEntry, ConnectionId, ConnectionState, ControlSink, SampleSink};
pub use pipeline::PipelineStats;
pub use registry::ConnectionRegistry;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::config::ViewConfig;
use crate::error::{Result, ViewError};
use crate::utils::LogThrottler;
use crate::video::{EncoderFactory, RawFrame};
use pipeline::{FramePipeline, PipelineCounters};
use crate::warn_throttled;

/// Pointer click callback, invoked with integer coordinates
pub type ClickHandler = dyn Fn(i32, i32) + Send + Sync;

/// Raw side-channel callback; pre-empts command dispatch when installed
pub type DataHandler = dyn Fn(Bytes) + Send + Sync;

struct ClickSlot(Box<ClickHandler>);
struct DataSlot(Box<DataHandler>);

/// Inbound side-channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub data: Bytes,
    pub is_text: bool,
}

impl ChannelMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            is_text: true,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_text: false,
        }
    }
}

/// One-shot readiness signal
///
/// Becomes ready the first time any peer is attached and stays ready.
#[derive(Clone)]
pub struct ReadySignal {
    rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl ReadySignal {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the view is ready or stopped
    ///
    /// Returns `true` if the view became ready.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        tokio::select! {
            biased;

            ready = async { rx.wait_for(|ready| *ready).await.is_ok() } => ready,
            _ = self.shutdown.cancelled() => *self.rx.borrow(),
        }
    }
}

/// Producer-facing entry point of a view
///
/// Frames pushed before the first peer attaches are buffered up to the input
/// queue capacity; further pushes wait. Every push fails fast with
/// [`ViewError::Stopped`] once the view is stopped.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<RawFrame>,
    shutdown: CancellationToken,
}

impl FrameSink {
    pub async fn send(&self, frame: RawFrame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ViewError::Stopped);
        }
        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => Err(ViewError::Stopped),
            result = self.tx.send(frame) => result.map_err(|_| ViewError::Stopped),
        }
    }

    /// Push without waiting; a full queue yields [`ViewError::InputFull`]
    pub fn try_send(&self, frame: RawFrame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ViewError::Stopped);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ViewError::InputFull,
            mpsc::error::TrySendError::Closed(_) => ViewError::Stopped,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

struct ViewInner {
    config: ViewConfig,
    factory: Arc<dyn EncoderFactory>,
    registry: Arc<ConnectionRegistry>,
    commands: Arc<CommandRegistry>,
    input_tx: mpsc::Sender<RawFrame>,
    /// Taken by the first attach
    input_rx: Mutex<Option<mpsc::Receiver<RawFrame>>>,
    ready_tx: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    counters: Arc<PipelineCounters>,
    throttler: Arc<LogThrottler>,
    on_click: ArcSwapOption<ClickSlot>,
    on_data: ArcSwapOption<DataSlot>,
    span: Span,
}

/// Live video view shared by every connected peer
#[derive(Clone)]
pub struct RemoteView {
    inner: Arc<ViewInner>,
}

impl RemoteView {
    /// Create a view logging under `info_span!("view", stream = <number>)`
    pub fn new(config: ViewConfig, factory: Arc<dyn EncoderFactory>) -> Result<Self> {
        let span = info_span!("view", stream = config.stream_number);
        Self::with_span(config, factory, span)
    }

    /// Create a view whose background tasks log under `span`
    pub fn with_span(
        config: ViewConfig,
        factory: Arc<dyn EncoderFactory>,
        span: Span,
    ) -> Result<Self> {
        config.validate()?;

        let (input_tx, input_rx) = mpsc::channel(config.input_queue_capacity);
        let (ready_tx, _) = watch::channel(false);

        info!(
            parent: &span,
            "Created view '{}' ({}, endpoint {})",
            config.stream_name,
            factory.mime_type(),
            config.handler_name()
        );

        Ok(Self {
            inner: Arc::new(ViewInner {
                config,
                factory,
                registry: Arc::new(ConnectionRegistry::new()),
                commands: Arc::new(CommandRegistry::new()),
                input_tx,
                input_rx: Mutex::new(Some(input_rx)),
                ready_tx,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                counters: Arc::new(PipelineCounters::default()),
                throttler: Arc::new(LogThrottler::default()),
                on_click: ArcSwapOption::empty(),
                on_data: ArcSwapOption::empty(),
                span,
            }),
        })
    }

    /// Cancel all background work and wait for it to exit
    ///
    /// Calling this more than once is a no-op.
    pub async fn stop(&self) {
        let first = !self.inner.stopped.swap(true, Ordering::AcqRel);
        if first {
            info!(parent: &self.inner.span, "Stopping view");
        }

        self.inner.shutdown.cancel();
        // a racing first attach finds no input and spawns nothing
        drop(self.inner.input_rx.lock().take());
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if first {
            info!(parent: &self.inner.span, "View stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn ready(&self) -> ReadySignal {
        ReadySignal {
            rx: self.inner.ready_tx.subscribe(),
            shutdown: self.inner.shutdown.clone(),
        }
    }

    pub fn input_frames(&self) -> FrameSink {
        FrameSink {
            tx: self.inner.input_tx.clone(),
            shutdown: self.inner.shutdown.clone(),
        }
    }

    pub fn set_on_click_handler<F>(&self, handler: F)
    where
        F: Fn(i32, i32) + Send + Sync + 'static,
    {
        self.inner
            .on_click
            .store(Some(Arc::new(ClickSlot(Box::new(handler)))));
    }

    /// Install the raw side-channel handler
    ///
    /// While installed, every inbound side-channel message goes to it and the
    /// command table is never consulted.
    pub fn set_on_data_handler<F>(&self, handler: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.inner
            .on_data
            .store(Some(Arc::new(DataSlot(Box::new(handler)))));
    }

    pub fn clear_on_data_handler(&self) {
        self.inner.on_data.store(None);
    }

    /// Broadcast binary data to every attached peer
    pub async fn send_data(&self, data: Bytes) {
        let connections = self.inner.registry.snapshot();
        let sends = connections.iter().map(|(id, entry)| {
            let data = data.clone();
            async move { (id, self.bounded(entry.control.send(data)).await) }
        });
        for (id, result) in join_all(sends).await {
            if let Err(e) = result {
                warn!(parent: &self.inner.span, connection = %id, "Failed to send data: {}", e);
            }
        }
    }

    /// Broadcast text to every attached peer
    pub async fn send_text(&self, text: &str) {
        let connections = self.inner.registry.snapshot();
        let sends = connections.iter().map(|(id, entry)| {
            let text = text.to_string();
            async move { (id, self.bounded(entry.control.send_text(text)).await) }
        });
        for (id, result) in join_all(sends).await {
            if let Err(e) = result {
                warn!(parent: &self.inner.span, connection = %id, "Failed to send text: {}", e);
            }
        }
    }

    async fn bounded(&self, send: impl std::future::Future<Output = Result<()>>) -> Result<()> {
        let timeout = self.inner.config.write_timeout();
        tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| ViewError::Transport(format!("send timed out after {:?}", timeout)))?
    }

    pub fn command_registry(&self) -> Arc<CommandRegistry> {
        self.inner.commands.clone()
    }

    /// Register a connected peer
    ///
    /// The first attach fires the ready signal and starts the pipeline.
    pub fn attach(&self, id: ConnectionId, entry: ConnectionEntry) -> Result<()> {
        if self.is_stopped() {
            return Err(ViewError::Stopped);
        }

        let replaced = self.inner.registry.add(id, entry);
        info!(
            parent: &self.inner.span,
            connection = %id,
            replaced,
            "Connection attached ({} total)",
            self.inner.registry.len()
        );

        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.start_pipeline()
        {
            self.inner.ready_tx.send_replace(true);
        }
        Ok(())
    }

    /// Remove a peer; returns whether it was registered
    pub fn detach(&self, id: &ConnectionId) -> bool {
        let removed = self.inner.registry.remove(id).is_some();
        if removed {
            info!(
                parent: &self.inner.span,
                connection = %id,
                "Connection detached ({} remaining)",
                self.inner.registry.len()
            );
        }
        removed
    }

    /// Attach `entry` once `state` reports connected, detach once it terminates
    /// or the pipeline evicts it
    ///
    /// Runs as a tracked task, so `stop` waits for it. A peer that terminates
    /// before connecting is never attached.
    pub fn attach_when_connected(
        &self,
        id: ConnectionId,
        entry: ConnectionEntry,
        mut state: watch::Receiver<ConnectionState>,
    ) {
        let view = self.clone();
        let shutdown = self.inner.shutdown.clone();

        self.inner.tasks.spawn(
            async move {
                let connected = tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => false,
                    connected = async {
                        state
                            .wait_for(|s| *s == ConnectionState::Connected || s.is_terminated())
                            .await
                            .map(|s| *s == ConnectionState::Connected)
                            .unwrap_or(false)
                    } => connected,
                };

                if !connected {
                    debug!(connection = %id, "Connection ended before connecting");
                    return;
                }
                if let Err(e) = view.attach(id, entry.clone()) {
                    debug!(connection = %id, "Attach skipped: {}", e);
                    return;
                }

                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {}
                    _ = entry.evicted() => debug!(connection = %id, "Connection evicted"),
                    _ = async { state.wait_for(|s| s.is_terminated()).await.is_ok() } => {}
                }

                view.detach(&id);
            }
            .instrument(self.inner.span.clone()),
        );
    }

    /// Deliver one inbound side-channel message from a peer
    ///
    /// Replies, including error text, go to `reply` only.
    pub async fn handle_data_message(&self, reply: &dyn ControlSink, msg: ChannelMessage) {
        if let Some(slot) = self.inner.on_data.load_full() {
            (slot.0)(msg.data);
            return;
        }

        if !msg.is_text {
            debug!(
                parent: &self.inner.span,
                "Ignoring binary side-channel message ({} bytes)",
                msg.data.len()
            );
            return;
        }

        let outcome = std::str::from_utf8(&msg.data)
            .map_err(|e| CommandError::Malformed(e.to_string()))
            .and_then(Command::parse)
            .and_then(|cmd| self.inner.commands.process(&cmd));

        let result = match outcome {
            Ok(None) => return,
            Ok(Some(resp)) if resp.is_text => {
                reply
                    .send_text(String::from_utf8_lossy(&resp.data).into_owned())
                    .await
            }
            Ok(Some(resp)) => reply.send(resp.data).await,
            Err(e) => {
                debug!(parent: &self.inner.span, "Command rejected: {}", e);
                reply.send_text(e.to_string()).await
            }
        };

        if let Err(e) = result {
            warn!(parent: &self.inner.span, "Failed to send command reply: {}", e);
        }
    }

    /// Deliver one inbound click-channel message; malformed input is dropped
    pub fn handle_click_message(&self, data: &[u8]) {
        let parsed = std::str::from_utf8(data)
            .map_err(|e| ViewError::InvalidClick(e.to_string()))
            .and_then(parse_click);

        match parsed {
            Ok((x, y)) => match self.inner.on_click.load_full() {
                Some(slot) => (slot.0)(x, y),
                None => trace!(parent: &self.inner.span, "Click ({}, {}) with no handler", x, y),
            },
            Err(e) => warn_throttled!(
                self.inner.throttler,
                CLICK_ERROR_KEY,
                parent: &self.inner.span,
                "Ignoring click message: {}",
                e
            ),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.counters.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn config(&self) -> &ViewConfig {
        &self.inner.config
    }

    /// Whether verbose transport and pipeline logging is enabled
    pub fn debug(&self) -> bool {
        self.inner.config.debug
    }

    /// MIME type of the samples this view produces
    pub fn mime_type(&self) -> &str {
        self.inner.factory.mime_type()
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Resolves once the view is stopped
    pub async fn cancelled(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Run `task` as background work of this view; `stop` waits for it
    pub fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner
            .tasks
            .spawn(task.instrument(self.inner.span.clone()));
    }

    /// Returns `false` when the view stopped first
    ///
    /// The input lock is held across the spawn so `stop` either sees the loops
    /// in the tracker or finds the input already gone.
    fn start_pipeline(&self) -> bool {
        let mut input = self.inner.input_rx.lock();
        let Some(input_rx) = input.take() else {
            debug!(parent: &self.inner.span, "Pipeline not started, view stopped");
            return false;
        };
        if self.inner.shutdown.is_cancelled() {
            return false;
        }

        let config = &self.inner.config;
        FramePipeline {
            factory: self.inner.factory.clone(),
            registry: self.inner.registry.clone(),
            counters: self.inner.counters.clone(),
            shutdown: self.inner.shutdown.clone(),
            frame_duration: config.frame_duration(),
            write_timeout: config.write_timeout(),
            sample_queue_capacity: config.sample_queue_capacity,
            debug: config.debug,
            throttler: self.inner.throttler.clone(),
        }
        .spawn(input_rx, &self.inner.tasks, &self.inner.span);
        true
    }
}

const CLICK_ERROR_KEY: &str = "click";

/// Parse an `"x,y"` click message, truncating each coordinate toward zero
pub fn parse_click(text: &str) -> Result<(i32, i32)> {
    let fields: Vec<&str> = text.trim().split(',').collect();
    match fields.as_slice() {
        [x, y] => Ok((parse_coordinate(x)?, parse_coordinate(y)?)),
        other => Err(ViewError::InvalidClick(format!(
            "expected 2 fields, got {}",
            other.len()
        ))),
    }
}

fn parse_coordinate(field: &str) -> Result<i32> {
    let value: f32 = field
        .trim()
        .parse()
        .map_err(|_| ViewError::InvalidClick(format!("not a number: {:?}", field)))?;
    if !value.is_finite() {
        return Err(ViewError::InvalidClick(format!("not finite: {:?}", field)));
    }
    Ok(value as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, RecordingPeer, ScriptedFactory, Sent, Step};
    use crate::video::{PixelFormat, Resolution};
    use std::time::Duration;

    const VGA: Resolution = Resolution::new(640, 480);

    fn view_with(config: ViewConfig, script: Vec<Step>) -> (RemoteView, ScriptedFactory) {
        let factory = ScriptedFactory::new(script);
        let view = RemoteView::new(config, Arc::new(factory.clone())).unwrap();
        (view, factory)
    }

    fn frame(value: u8) -> RawFrame {
        RawFrame::filled(VGA, PixelFormat::Rgba, value)
    }

    async fn stop_within(view: &RemoteView) {
        tokio::time::timeout(Duration::from_secs(2), view.stop())
            .await
            .expect("stop hung");
    }

    #[tokio::test]
    async fn test_skips_frames_without_output() {
        let (view, _) = view_with(
            ViewConfig::default(),
            vec![Step::Sample(b"one"), Step::NoOutput, Step::Sample(b"three")],
        );
        let peer = RecordingPeer::new();
        view.attach(ConnectionId::new(), peer.entry()).unwrap();

        let sink = view.input_frames();
        for i in 1..=3 {
            sink.send(frame(i)).await.unwrap();
        }

        assert!(eventually(|| view.stats().frames_received == 3).await);
        assert!(eventually(|| peer.samples.lock().len() == 2).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let samples = peer.samples.lock().clone();
        assert_eq!(samples.len(), 2);
        assert_eq!(&samples[0].0[..], b"one");
        assert_eq!(&samples[1].0[..], b"three");
        assert!(samples.iter().all(|(_, d)| *d == Duration::from_millis(33)));
        assert_eq!(view.stats().frames_without_output, 1);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_encoder_created_once_from_first_frame() {
        let (view, factory) = view_with(ViewConfig::default(), vec![]);
        view.attach(ConnectionId::new(), RecordingPeer::new().entry())
            .unwrap();

        let sink = view.input_frames();
        sink.send(frame(1)).await.unwrap();
        sink.send(RawFrame::filled(Resolution::new(320, 240), PixelFormat::Rgba, 2))
            .await
            .unwrap();
        sink.send(frame(3)).await.unwrap();

        assert!(eventually(|| view.stats().frames_encoded == 3).await);
        assert_eq!(*factory.created.lock(), vec![VGA]);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_encode_error_is_skipped() {
        let (view, _) = view_with(
            ViewConfig::default(),
            vec![Step::Fail, Step::Sample(b"ok")],
        );
        let peer = RecordingPeer::new();
        view.attach(ConnectionId::new(), peer.entry()).unwrap();

        let sink = view.input_frames();
        sink.send(frame(1)).await.unwrap();
        sink.send(frame(2)).await.unwrap();

        assert!(eventually(|| peer.samples.lock().len() == 1).await);
        assert_eq!(&peer.sample_data()[0][..], b"ok");
        assert_eq!(view.stats().encode_errors, 1);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_encoder_init_failure_stops_pipeline() {
        let (view, factory) = view_with(ViewConfig::default(), vec![]);
        factory.fail_create.store(true, Ordering::Release);
        let peer = RecordingPeer::new();
        view.attach(ConnectionId::new(), peer.entry()).unwrap();

        let sink = view.input_frames();
        sink.send(frame(1)).await.unwrap();

        assert!(eventually(|| sink.is_closed()).await);
        assert!(peer.sample_data().is_empty());
        assert!(factory.created.lock().is_empty());

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_ready_fires_once() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let ready = view.ready();
        assert!(!ready.is_ready());

        let waiter = tokio::spawn({
            let ready = ready.clone();
            async move { ready.wait().await }
        });

        view.attach(ConnectionId::new(), RecordingPeer::new().entry())
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
        assert!(ready.is_ready());

        let mut rx = view.inner.ready_tx.subscribe();
        rx.borrow_and_update();
        view.attach(ConnectionId::new(), RecordingPeer::new().entry())
            .unwrap();
        assert!(!rx.has_changed().unwrap());
        assert!(*rx.borrow());

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_ready_wait_wakes_on_stop() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let ready = view.ready();
        let waiter = tokio::spawn(async move { ready.wait().await });

        stop_within(&view).await;

        let became_ready = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!became_ready);
    }

    #[tokio::test]
    async fn test_detach_unknown_is_noop() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let peer = RecordingPeer::new();
        view.attach(ConnectionId::new(), peer.entry()).unwrap();

        assert!(!view.detach(&ConnectionId::new()));
        assert_eq!(view.connection_count(), 1);

        view.input_frames().send(frame(7)).await.unwrap();
        assert!(eventually(|| peer.samples.lock().len() == 1).await);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_broadcast_without_connections() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let done = tokio::time::timeout(Duration::from_millis(200), async {
            view.send_text("hello").await;
            view.send_data(Bytes::from_static(b"\x01\x02")).await;
        })
        .await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let a = RecordingPeer::new();
        let b = RecordingPeer::new();
        let broken = RecordingPeer::new();
        broken.fail_writes.store(true, Ordering::Release);
        view.attach(ConnectionId::new(), a.entry()).unwrap();
        view.attach(ConnectionId::new(), broken.entry()).unwrap();
        view.attach(ConnectionId::new(), b.entry()).unwrap();

        view.send_text("hello").await;
        view.send_data(Bytes::from_static(b"\x01")).await;

        let expected = vec![
            Sent::Text("hello".into()),
            Sent::Binary(Bytes::from_static(b"\x01")),
        ];
        assert_eq!(a.sent(), expected);
        assert_eq!(b.sent(), expected);
        assert_eq!(view.connection_count(), 3);

        stop_within(&view).await;
    }

    #[test]
    fn test_parse_click() {
        assert_eq!(parse_click("12.5,47.9").unwrap(), (12, 47));
        assert_eq!(parse_click(" 3 , 4 \n").unwrap(), (3, 4));
        assert_eq!(parse_click("-3.9,0.2").unwrap(), (-3, 0));

        for bad in ["", "1", "1,2,3", "a,2", "1,", "NaN,1"] {
            assert!(
                matches!(parse_click(bad), Err(ViewError::InvalidClick(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_click_handler_receives_truncated_coordinates() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let clicks = Arc::new(Mutex::new(Vec::new()));
        let seen = clicks.clone();
        view.set_on_click_handler(move |x, y| seen.lock().push((x, y)));

        view.handle_click_message(b"12.5,47.9");
        view.handle_click_message(b"garbage");
        view.handle_click_message(b"1,2,3");
        view.handle_click_message(&[0xff, 0xfe]);

        assert_eq!(*clicks.lock(), vec![(12, 47)]);
    }

    #[tokio::test]
    async fn test_unknown_command_replies_to_sender_only() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let a = RecordingPeer::new();
        let b = RecordingPeer::new();
        view.attach(ConnectionId::new(), a.entry()).unwrap();
        view.attach(ConnectionId::new(), b.entry()).unwrap();

        view.handle_data_message(&a, ChannelMessage::text(r#"{"name":"nope","args":[]}"#))
            .await;

        assert_eq!(a.sent(), vec![Sent::Text("no such command: nope".into())]);
        assert!(b.sent().is_empty());

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_command_replies_by_kind() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let commands = view.command_registry();
        commands.register("echo", |cmd| Ok(Some(CommandResponse::text(cmd.args.join(",")))));
        commands.register("blob", |_| Ok(Some(CommandResponse::binary(vec![9u8]))));
        commands.register("quiet", |_| Ok(None));
        commands.register("fail", |_| Err(CommandError::Failed("boom".into())));

        let peer = RecordingPeer::new();
        for msg in [
            r#"{"name":"echo","args":["a","b"]}"#,
            r#"{"name":"blob"}"#,
            r#"{"name":"quiet"}"#,
            r#"{"name":"fail"}"#,
        ] {
            view.handle_data_message(&peer, ChannelMessage::text(msg)).await;
        }
        view.handle_data_message(&peer, ChannelMessage::binary(vec![1u8, 2]))
            .await;

        assert_eq!(
            peer.sent(),
            vec![
                Sent::Text("a,b".into()),
                Sent::Binary(Bytes::from_static(&[9])),
                Sent::Text("command failed: boom".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_envelope_gets_text_error() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let peer = RecordingPeer::new();

        view.handle_data_message(&peer, ChannelMessage::text("{not json"))
            .await;

        let sent = peer.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Text(t) if t.starts_with("malformed command")));
    }

    #[tokio::test]
    async fn test_data_handler_preempts_commands() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        view.command_registry()
            .register("echo", |_| Ok(Some(CommandResponse::text("echo"))));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        view.set_on_data_handler(move |data| sink.lock().push(data));

        let peer = RecordingPeer::new();
        view.handle_data_message(&peer, ChannelMessage::text(r#"{"name":"echo"}"#))
            .await;
        view.handle_data_message(&peer, ChannelMessage::binary(vec![7u8]))
            .await;

        assert!(peer.sent().is_empty());
        assert_eq!(received.lock().len(), 2);

        view.clear_on_data_handler();
        view.handle_data_message(&peer, ChannelMessage::text(r#"{"name":"echo"}"#))
            .await;
        assert_eq!(peer.sent(), vec![Sent::Text("echo".into())]);
    }

    #[tokio::test]
    async fn test_stop_while_encode_loop_waits() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        view.attach(ConnectionId::new(), RecordingPeer::new().entry())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        stop_within(&view).await;
        assert!(view.is_stopped());

        // second stop is a no-op
        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_stop_before_any_peer() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        view.input_frames().send(frame(1)).await.unwrap();
        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_push_after_stop_fails_fast() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let sink = view.input_frames();
        stop_within(&view).await;

        let result = tokio::time::timeout(Duration::from_millis(200), sink.send(frame(1)))
            .await
            .expect("send blocked after stop");
        assert!(matches!(result, Err(ViewError::Stopped)));
        assert!(matches!(sink.try_send(frame(1)), Err(ViewError::Stopped)));
        assert!(matches!(
            view.attach(ConnectionId::new(), RecordingPeer::new().entry()),
            Err(ViewError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_blocked_push_wakes_on_stop() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let sink = view.input_frames();
        sink.send(frame(1)).await.unwrap();

        let pending = tokio::spawn({
            let sink = sink.clone();
            async move { sink.send(frame(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_within(&view).await;

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ViewError::Stopped)));
    }

    #[tokio::test]
    async fn test_try_send_full_queue() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let sink = view.input_frames();

        sink.try_send(frame(1)).unwrap();
        assert!(matches!(sink.try_send(frame(2)), Err(ViewError::InputFull)));
    }

    #[tokio::test]
    async fn test_failing_writer_is_evicted() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let good = RecordingPeer::new();
        let bad = RecordingPeer::new();
        bad.fail_writes.store(true, Ordering::Release);
        view.attach(ConnectionId::new(), good.entry()).unwrap();
        view.attach(ConnectionId::new(), bad.entry()).unwrap();

        view.input_frames().send(frame(5)).await.unwrap();

        assert!(eventually(|| view.connection_count() == 1).await);
        assert!(eventually(|| good.samples.lock().len() == 1).await);
        assert_eq!(view.stats().connections_evicted, 1);

        view.input_frames().send(frame(6)).await.unwrap();
        assert!(eventually(|| good.samples.lock().len() == 2).await);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_stalled_writer_is_evicted() {
        let config = ViewConfig {
            write_timeout_ms: 50,
            ..Default::default()
        };
        let (view, _) = view_with(config, vec![]);
        let good = RecordingPeer::new();
        let stalled = RecordingPeer::new();
        stalled.stall_writes.store(true, Ordering::Release);
        view.attach(ConnectionId::new(), stalled.entry()).unwrap();
        view.attach(ConnectionId::new(), good.entry()).unwrap();

        view.input_frames().send(frame(1)).await.unwrap();

        assert!(eventually(|| view.connection_count() == 1).await);
        assert_eq!(good.sample_data(), vec![Bytes::from_static(&[1])]);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_attach_when_connected_follows_state() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Negotiating);
        let id = ConnectionId::new();

        view.attach_when_connected(id, RecordingPeer::new().entry(), state_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(view.connection_count(), 0);
        assert!(!view.ready().is_ready());

        state_tx.send_replace(ConnectionState::Connected);
        assert!(eventually(|| view.connection_count() == 1).await);
        assert!(view.ready().is_ready());

        state_tx.send_replace(ConnectionState::Failed);
        assert!(eventually(|| view.connection_count() == 0).await);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_terminated_before_connect_never_attaches() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Negotiating);

        view.attach_when_connected(ConnectionId::new(), RecordingPeer::new().entry(), state_rx);
        state_tx.send_replace(ConnectionState::Closed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        state_tx.send_replace(ConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(view.connection_count(), 0);
        assert!(!view.ready().is_ready());

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_evicted_peer_lifecycle_task_exits() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let good = RecordingPeer::new();
        view.attach(ConnectionId::new(), good.entry()).unwrap();

        let bad = RecordingPeer::new();
        bad.fail_writes.store(true, Ordering::Release);
        let entry = bad.entry();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        view.attach_when_connected(ConnectionId::new(), entry.clone(), state_rx);
        assert!(eventually(|| view.connection_count() == 2).await);
        // encode loop, fan-out loop and the lifecycle task
        assert_eq!(view.inner.tasks.len(), 3);

        view.input_frames().send(frame(1)).await.unwrap();

        assert!(eventually(|| entry.is_evicted()).await);
        assert!(eventually(|| view.inner.tasks.len() == 2).await);
        assert_eq!(view.connection_count(), 1);
        assert_eq!(view.stats().connections_evicted, 1);
        assert_eq!(good.sample_data().len(), 1);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_start_after_stop_spawns_nothing() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        stop_within(&view).await;

        // the tail of an attach that passed its stopped check before stop ran
        assert!(!view.start_pipeline());
        assert!(view.inner.tasks.is_empty());
        assert!(!view.ready().is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_attach_racing_stop_leaves_no_tasks() {
        for _ in 0..50 {
            let (view, _) = view_with(ViewConfig::default(), vec![]);
            let attacher = {
                let view = view.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = view.attach(ConnectionId::new(), RecordingPeer::new().entry());
                })
            };

            stop_within(&view).await;
            attacher.await.unwrap();

            assert!(view.inner.tasks.is_empty());
        }
    }

    #[tokio::test]
    async fn test_malformed_clicks_are_throttled() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        for _ in 0..3 {
            view.handle_click_message(b"garbage");
        }
        assert_eq!(view.inner.throttler.len(), 1);
        assert_eq!(view.inner.throttler.check(CLICK_ERROR_KEY), None);
    }

    #[tokio::test]
    async fn test_repeated_encode_errors_share_throttle() {
        let (view, _) = view_with(
            ViewConfig::default(),
            vec![Step::Fail, Step::Fail, Step::Fail, Step::Sample(b"ok")],
        );
        let peer = RecordingPeer::new();
        view.attach(ConnectionId::new(), peer.entry()).unwrap();

        let sink = view.input_frames();
        for i in 1..=4 {
            sink.send(frame(i)).await.unwrap();
        }

        assert!(eventually(|| peer.samples.lock().len() == 1).await);
        assert_eq!(view.stats().encode_errors, 3);
        // first failure logged, the next two suppressed
        assert_eq!(view.inner.throttler.check(pipeline::ENCODE_ERROR_KEY), None);

        stop_within(&view).await;
    }

    #[tokio::test]
    async fn test_debug_flag() {
        let (quiet, _) = view_with(ViewConfig::default(), vec![]);
        assert!(!quiet.debug());

        let config = ViewConfig {
            debug: true,
            ..Default::default()
        };
        let (verbose, _) = view_with(config, vec![]);
        assert!(verbose.debug());
    }

    #[tokio::test]
    async fn test_stop_waits_for_pending_negotiation() {
        let (view, _) = view_with(ViewConfig::default(), vec![]);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Negotiating);
        view.attach_when_connected(ConnectionId::new(), RecordingPeer::new().entry(), state_rx);

        stop_within(&view).await;
        assert_eq!(view.connection_count(), 0);
    }
}
