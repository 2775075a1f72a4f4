//! Input relay
//!
//! Decodes pointer/keyboard events arriving as JSON on the side channel and
//! forwards them to an [`InputInjector`].
//!
//! Message format:
//!
//! ```json
//! {"type": "key",   "key": "a", "code": "KeyA", "action": "down", "modifiers": {"shift": true}}
//! {"type": "mouse", "x": 120.5, "y": 48.0, "action": "down", "button": "left"}
//! ```
//!
//! The `type` tag is read first and the whole payload is then parsed as the
//! matching event. Unknown tags are ignored.

pub mod types;

pub use types::{
    KeyAction, KeyEvent, KeyboardModifiers, MouseAction, MouseButton, MouseEvent,
};

use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Message tags
pub const TAG_KEY: &str = "key";
pub const TAG_MOUSE: &str = "mouse";

/// Decoded input event
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Key(KeyEvent),
    Mouse(MouseEvent),
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    kind: String,
}

/// Parse an input message
///
/// Returns `Ok(None)` for an unknown `type` tag.
pub fn parse_input_event(data: &[u8]) -> Result<Option<InputEvent>> {
    let raw: RawEvent = serde_json::from_slice(data)?;

    let event = match raw.kind.as_str() {
        TAG_KEY => InputEvent::Key(serde_json::from_slice(data)?),
        TAG_MOUSE => InputEvent::Mouse(serde_json::from_slice(data)?),
        other => {
            debug!("Ignoring input message with type {:?}", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// OS-level input injection backend
pub trait InputInjector: Send + Sync {
    fn name(&self) -> &str;

    fn inject_pointer_event(&self, event: &MouseEvent) -> Result<()>;

    fn inject_key_event(&self, event: &KeyEvent) -> Result<()>;
}

/// Injector that only logs the events it receives
#[derive(Debug, Default)]
pub struct TracingInjector;

impl InputInjector for TracingInjector {
    fn name(&self) -> &str {
        "tracing"
    }

    fn inject_pointer_event(&self, event: &MouseEvent) -> Result<()> {
        info!(
            action = ?event.action,
            button = ?event.button,
            "Pointer event at ({}, {})",
            event.x,
            event.y
        );
        Ok(())
    }

    fn inject_key_event(&self, event: &KeyEvent) -> Result<()> {
        info!(
            action = ?event.action,
            code = ?event.code,
            "Key event {:?}",
            event.key
        );
        Ok(())
    }
}

/// Routes decoded side-channel input to an injector
#[derive(Clone)]
pub struct InputRelay {
    injector: Arc<dyn InputInjector>,
}

impl InputRelay {
    pub fn new(injector: Arc<dyn InputInjector>) -> Self {
        Self { injector }
    }

    /// Decode and inject one message; failures are logged and dropped
    pub fn handle(&self, data: &[u8]) {
        let event = match parse_input_event(data) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to parse input message: {}", e);
                return;
            }
        };

        let result = match &event {
            InputEvent::Key(ev) => self.injector.inject_key_event(ev),
            InputEvent::Mouse(ev) => self.injector.inject_pointer_event(ev),
        };
        if let Err(e) = result {
            warn!("{} failed to inject {:?}: {}", self.injector.name(), event, e);
        }
    }

    /// Adapt into a callback for [`RemoteView::set_on_data_handler`]
    ///
    /// [`RemoteView::set_on_data_handler`]: crate::view::RemoteView::set_on_data_handler
    pub fn into_data_handler(self) -> impl Fn(Bytes) + Send + Sync + 'static {
        move |data: Bytes| self.handle(&data)
    }
}
