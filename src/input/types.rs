//! Input event types for keyboard and pointer

use serde::{Deserialize, Serialize};

/// Key action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Down,
    Up,
}

/// Keyboard modifier flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardModifiers {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    /// Windows/Super/Command key
    pub meta: bool,
}

impl KeyboardModifiers {
    /// Check if any modifier is active
    pub fn any(&self) -> bool {
        self.ctrl || self.shift || self.alt || self.meta
    }
}

/// Keyboard event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Logical key value (browser `KeyboardEvent.key`)
    pub key: String,
    /// Physical key code (browser `KeyboardEvent.code`)
    #[serde(default)]
    pub code: Option<String>,
    pub action: KeyAction,
    #[serde(default)]
    pub modifiers: KeyboardModifiers,
}

impl KeyEvent {
    pub fn key_down(key: impl Into<String>, modifiers: KeyboardModifiers) -> Self {
        Self {
            key: key.into(),
            code: None,
            action: KeyAction::Down,
            modifiers,
        }
    }

    pub fn key_up(key: impl Into<String>, modifiers: KeyboardModifiers) -> Self {
        Self {
            key: key.into(),
            code: None,
            action: KeyAction::Up,
            modifiers,
        }
    }
}

/// Mouse button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Back,
    Forward,
}

/// Pointer action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Move,
    Down,
    Up,
    Scroll,
}

/// Pointer event in view coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseEvent {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    pub action: MouseAction,
    /// Button (for down/up events)
    #[serde(default)]
    pub button: Option<MouseButton>,
    /// Scroll delta (for scroll events)
    #[serde(default)]
    pub scroll: i32,
}

impl MouseEvent {
    pub fn move_to(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            action: MouseAction::Move,
            button: None,
            scroll: 0,
        }
    }

    pub fn button_down(x: f64, y: f64, button: MouseButton) -> Self {
        Self {
            x,
            y,
            action: MouseAction::Down,
            button: Some(button),
            scroll: 0,
        }
    }

    pub fn button_up(x: f64, y: f64, button: MouseButton) -> Self {
        Self {
            x,
            y,
            action: MouseAction::Up,
            button: Some(button),
            scroll: 0,
        }
    }

    pub fn scroll(delta: i32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            action: MouseAction::Scroll,
            button: None,
            scroll: delta,
        }
    }
}
