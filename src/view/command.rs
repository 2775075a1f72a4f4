//! Side-channel command protocol
//!
//! Inbound text messages on the data channel are JSON envelopes:
//!
//! ```json
//! {"name": "resize", "args": ["1280", "720"]}
//! ```
//!
//! A handler may reply with text or binary data, or not at all. Errors are
//! sent back to the originating peer as text.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Command processing errors; `Display` is the text sent back to the peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("no such command: {0}")]
    NoSuchCommand(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("command failed: {0}")]
    Failed(String),

    #[error("malformed command: {0}")]
    Malformed(String),
}

/// Named request received on the side channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Parse a text envelope
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))
    }
}

/// Reply payload plus its kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub data: Bytes,
    pub is_text: bool,
}

impl CommandResponse {
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

/// Command handler
///
/// Runs synchronously on the peer's side-channel delivery path, so it must
/// return quickly or spawn its own background work.
pub type CommandHandler =
    dyn Fn(&Command) -> Result<Option<CommandResponse>, CommandError> + Send + Sync;

/// Name -> handler table, shared for the lifetime of a view
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, Arc<CommandHandler>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler with the same name
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Command) -> Result<Option<CommandResponse>, CommandError> + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch a command to its handler by exact name
    pub fn process(&self, cmd: &Command) -> Result<Option<CommandResponse>, CommandError> {
        let handler = self
            .handlers
            .read()
            .get(&cmd.name)
            .cloned()
            .ok_or_else(|| CommandError::NoSuchCommand(cmd.name.clone()))?;
        handler(cmd)
    }
}
