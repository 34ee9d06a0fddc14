//! Desktop input events, as delivered by the presentation surface.
//!
//! Pointer coordinates are in pixels relative to the top-left corner of the
//! view that displays the mirrored screen. The input translator maps them
//! onto device coordinates.

use serde::{Deserialize, Serialize};

// MARK: - InputEvent

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputEvent {
    MouseMove { x: f64, y: f64 },
    MouseDown { x: f64, y: f64, button: MouseButton },
    MouseUp { x: f64, y: f64, button: MouseButton },
    KeyDown { key: Key },
    KeyUp { key: Key },
    /// Committed text from the platform IME.
    Text { text: String },
}

// MARK: - MouseButton

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

// MARK: - Key

/// Platform-neutral physical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    Home,
    Escape,
    BrowserBack,
    Backspace,
    Delete,
    Enter,
    Space,
    Tab,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    VolumeUp,
    VolumeDown,
    /// `0`..=`9`
    Digit(u8),
    /// `a`..=`z`, case-insensitive.
    Letter(char),
    Period,
    Comma,
    Minus,
    Equals,
    Semicolon,
    Slash,
    LeftBracket,
    RightBracket,
    Backslash,
    Apostrophe,
    Grave,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_event_roundtrip() {
        let events = vec![
            InputEvent::MouseMove { x: 10.0, y: 20.5 },
            InputEvent::MouseDown { x: 1.0, y: 2.0, button: MouseButton::Left },
            InputEvent::KeyDown { key: Key::Letter('q') },
            InputEvent::KeyUp { key: Key::Digit(7) },
            InputEvent::Text { text: "한글".into() },
        ];

        for event in &events {
            let json = serde_json::to_string(event).unwrap();
            let parsed: InputEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(&parsed, event, "roundtrip failed for {json}");
        }
    }
}
