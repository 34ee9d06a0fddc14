//! droidlink-input — desktop input to device control messages
//!
//! [`InputTranslator`] turns [`InputEvent`]s from the presentation surface
//! into [`ControlMessage`]s ready for the control channel:
//!
//! - pointer positions are mapped from view pixels to device pixels with
//!   uniform (letterboxed) scaling;
//! - the left button drives a single touch pointer, the right button is
//!   BACK and the middle button is HOME;
//! - drags are throttled to one move per interval;
//! - keys go through an Android key-code table, committed text that starts
//!   with a non-ASCII character is pasted through the clipboard.

use std::time::{Duration, Instant};

use droidlink_core::{InputEvent, Key, MouseButton, Resolution};
use droidlink_transport::{ControlMessage, KeyAction, TouchAction};
use tracing::trace;

/// Android key codes used outside the key table.
pub mod keycode {
    pub const HOME: i32 = 3;
    pub const BACK: i32 = 4;
    pub const APP_SWITCH: i32 = 187;
}

/// Default spacing between forwarded drag moves.
pub const DEFAULT_MOVE_INTERVAL: Duration = Duration::from_millis(10);

const TOUCH_POINTER_ID: i64 = 0;
/// Android `MotionEvent.BUTTON_PRIMARY`.
const BUTTON_PRIMARY: i32 = 1;

// ── InputTranslator ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct InputTranslator {
    video: Option<Resolution>,
    viewport: (f64, f64),
    left_down: bool,
    last_move: Option<Instant>,
    move_interval: Duration,
}

impl Default for InputTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl InputTranslator {
    pub fn new() -> Self {
        Self {
            video: None,
            viewport: (0.0, 0.0),
            left_down: false,
            last_move: None,
            move_interval: DEFAULT_MOVE_INTERVAL,
        }
    }

    pub fn with_move_interval(mut self, interval: Duration) -> Self {
        self.move_interval = interval;
        self
    }

    /// Fed from `FrameReady`; the device rotates without notice.
    pub fn update_video_size(&mut self, width: u32, height: u32) {
        self.video = (width > 0 && height > 0).then(|| Resolution::new(width, height));
    }

    /// Size in pixels of the view that shows the video.
    pub fn set_viewport(&mut self, width: f64, height: f64) {
        self.viewport = (width, height);
    }

    /// Map a view position to device pixels. `None` when the point falls in
    /// the letterbox bars or no video size is known yet.
    pub fn map_to_device(&self, x: f64, y: f64) -> Option<(i32, i32)> {
        let (vx, vy, w, h) = self.to_video_space(x, y)?;
        if vx < 0.0 || vy < 0.0 || vx >= w || vy >= h {
            return None;
        }
        Some((vx as i32, vy as i32))
    }

    /// Like [`map_to_device`](Self::map_to_device) but pinned to the video
    /// edge instead of dropped. Used once a touch is in progress.
    fn map_clamped(&self, x: f64, y: f64) -> Option<(i32, i32)> {
        let (vx, vy, w, h) = self.to_video_space(x, y)?;
        Some((vx.clamp(0.0, w - 1.0) as i32, vy.clamp(0.0, h - 1.0) as i32))
    }

    fn to_video_space(&self, x: f64, y: f64) -> Option<(f64, f64, f64, f64)> {
        let video = self.video?;
        let (vw, vh) = self.viewport;
        if vw <= 0.0 || vh <= 0.0 {
            return None;
        }
        let (w, h) = (video.width as f64, video.height as f64);
        let scale = (vw / w).min(vh / h);
        let off_x = (vw - w * scale) / 2.0;
        let off_y = (vh - h * scale) / 2.0;
        Some(((x - off_x) / scale, (y - off_y) / scale, w, h))
    }

    pub fn translate(&mut self, event: &InputEvent, now: Instant) -> Vec<ControlMessage> {
        match event {
            InputEvent::MouseDown { x, y, button: MouseButton::Left } => {
                let Some((dx, dy)) = self.map_to_device(*x, *y) else {
                    return Vec::new();
                };
                self.left_down = true;
                self.last_move = Some(now);
                vec![self.touch(TouchAction::Down, dx, dy, 1.0, BUTTON_PRIMARY)]
            }
            InputEvent::MouseUp { x, y, button: MouseButton::Left } => {
                if !self.left_down {
                    return Vec::new();
                }
                self.left_down = false;
                match self.map_clamped(*x, *y) {
                    Some((dx, dy)) => vec![self.touch(TouchAction::Up, dx, dy, 0.0, 0)],
                    None => Vec::new(),
                }
            }
            InputEvent::MouseMove { x, y } => {
                if !self.left_down {
                    return Vec::new();
                }
                if let Some(last) = self.last_move {
                    if now.saturating_duration_since(last) < self.move_interval {
                        return Vec::new();
                    }
                }
                let Some((dx, dy)) = self.map_clamped(*x, *y) else {
                    return Vec::new();
                };
                self.last_move = Some(now);
                vec![self.touch(TouchAction::Move, dx, dy, 1.0, BUTTON_PRIMARY)]
            }
            InputEvent::MouseDown { button: MouseButton::Right, .. } => press(keycode::BACK),
            InputEvent::MouseDown { button: MouseButton::Middle, .. } => press(keycode::HOME),
            InputEvent::MouseUp { .. } => Vec::new(),
            InputEvent::KeyDown { key } => key_message(*key, KeyAction::Down).into_iter().collect(),
            InputEvent::KeyUp { key } => key_message(*key, KeyAction::Up).into_iter().collect(),
            InputEvent::Text { text } => match text.chars().next() {
                Some(c) if !c.is_ascii() => {
                    trace!("Pasting {} bytes of text", text.len());
                    vec![ControlMessage::SetClipboard { text: text.clone(), paste: true }]
                }
                _ => Vec::new(),
            },
        }
    }

    fn touch(&self, action: TouchAction, x: i32, y: i32, pressure: f32, buttons: i32) -> ControlMessage {
        let video = self.video.unwrap_or(Resolution::new(0, 0));
        ControlMessage::InjectTouch {
            action,
            pointer_id: TOUCH_POINTER_ID,
            x,
            y,
            screen_width: video.width.min(u16::MAX as u32) as u16,
            screen_height: video.height.min(u16::MAX as u32) as u16,
            pressure,
            action_button: BUTTON_PRIMARY,
            buttons,
        }
    }
}

/// Key down followed by key up.
pub fn press(keycode: i32) -> Vec<ControlMessage> {
    vec![
        ControlMessage::InjectKeycode { action: KeyAction::Down, keycode, meta_state: 0 },
        ControlMessage::InjectKeycode { action: KeyAction::Up, keycode, meta_state: 0 },
    ]
}

fn key_message(key: Key, action: KeyAction) -> Option<ControlMessage> {
    let keycode = android_keycode(key)?;
    Some(ControlMessage::InjectKeycode { action, keycode, meta_state: 0 })
}

// ── Android key codes ─────────────────────────────────────────────────────────

/// Android `KeyEvent` code for a desktop key, `None` when unmapped.
pub fn android_keycode(key: Key) -> Option<i32> {
    let code = match key {
        Key::Home => keycode::HOME,
        Key::Escape | Key::BrowserBack => keycode::BACK,
        Key::Backspace => 67,
        Key::Delete => 112,
        Key::Enter => 66,
        Key::Space => 62,
        Key::Tab => 61,
        Key::ArrowUp => 19,
        Key::ArrowDown => 20,
        Key::ArrowLeft => 21,
        Key::ArrowRight => 22,
        Key::VolumeUp => 24,
        Key::VolumeDown => 25,
        Key::Digit(d) if d <= 9 => 7 + d as i32,
        Key::Letter(c) if c.is_ascii_alphabetic() => 29 + (c.to_ascii_lowercase() as i32 - 'a' as i32),
        Key::Period => 56,
        Key::Comma => 55,
        Key::Minus => 69,
        Key::Equals => 70,
        Key::Semicolon => 74,
        Key::Slash => 76,
        Key::LeftBracket => 71,
        Key::RightBracket => 72,
        Key::Backslash => 73,
        Key::Apostrophe => 75,
        Key::Grave => 68,
        Key::Digit(_) | Key::Letter(_) => return None,
    };
    Some(code)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// 1000×2000 portrait video inside a 1000×1000 view: scale 0.5, drawn
    /// width 500, side bars 250 each.
    fn translator() -> InputTranslator {
        let mut t = InputTranslator::new();
        t.update_video_size(1000, 2000);
        t.set_viewport(1000.0, 1000.0);
        t
    }

    fn touch_of(msg: &ControlMessage) -> (TouchAction, i32, i32, f32) {
        match msg {
            ControlMessage::InjectTouch { action, x, y, pressure, .. } => (*action, *x, *y, *pressure),
            other => panic!("expected touch, got {other:?}"),
        }
    }

    #[test]
    fn letterbox_mapping() {
        let t = translator();
        assert_eq!(t.map_to_device(500.0, 500.0), Some((500, 1000)));
        assert_eq!(t.map_to_device(250.0, 0.0), Some((0, 0)));
        assert_eq!(t.map_to_device(749.0, 999.0), Some((998, 1998)));
        assert_eq!(t.map_to_device(100.0, 500.0), None);
        assert_eq!(t.map_to_device(750.0, 500.0), None);
    }

    #[test]
    fn no_mapping_without_video_size() {
        let mut t = InputTranslator::new();
        t.set_viewport(800.0, 600.0);
        assert_eq!(t.map_to_device(10.0, 10.0), None);
        t.update_video_size(0, 0);
        assert_eq!(t.map_to_device(10.0, 10.0), None);
    }

    #[test]
    fn left_click_is_touch_down_and_up() {
        let mut t = translator();
        let now = Instant::now();
        let down = t.translate(&InputEvent::MouseDown { x: 500.0, y: 500.0, button: MouseButton::Left }, now);
        let up = t.translate(&InputEvent::MouseUp { x: 500.0, y: 500.0, button: MouseButton::Left }, now);
        assert_eq!(down.len(), 1);
        assert_eq!(up.len(), 1);
        assert_eq!(touch_of(&down[0]), (TouchAction::Down, 500, 1000, 1.0));
        assert_eq!(touch_of(&up[0]), (TouchAction::Up, 500, 1000, 0.0));
        match &down[0] {
            ControlMessage::InjectTouch { pointer_id, screen_width, screen_height, .. } => {
                assert_eq!((*pointer_id, *screen_width, *screen_height), (0, 1000, 2000));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn click_in_letterbox_is_dropped() {
        let mut t = translator();
        let now = Instant::now();
        assert!(t.translate(&InputEvent::MouseDown { x: 50.0, y: 500.0, button: MouseButton::Left }, now).is_empty());
        assert!(t.translate(&InputEvent::MouseUp { x: 50.0, y: 500.0, button: MouseButton::Left }, now).is_empty());
    }

    #[test]
    fn moves_are_throttled_and_need_a_held_button() {
        let mut t = translator();
        let start = Instant::now();
        assert!(t.translate(&InputEvent::MouseMove { x: 500.0, y: 500.0 }, start).is_empty());

        t.translate(&InputEvent::MouseDown { x: 500.0, y: 500.0, button: MouseButton::Left }, start);
        let early = t.translate(&InputEvent::MouseMove { x: 510.0, y: 500.0 }, start + Duration::from_millis(4));
        assert!(early.is_empty());
        let later = t.translate(&InputEvent::MouseMove { x: 520.0, y: 500.0 }, start + Duration::from_millis(12));
        assert_eq!(touch_of(&later[0]).0, TouchAction::Move);
        let again = t.translate(&InputEvent::MouseMove { x: 530.0, y: 500.0 }, start + Duration::from_millis(15));
        assert!(again.is_empty());
    }

    #[test]
    fn drag_out_of_video_is_clamped() {
        let mut t = translator();
        let now = Instant::now();
        t.translate(&InputEvent::MouseDown { x: 500.0, y: 500.0, button: MouseButton::Left }, now);
        let up = t.translate(&InputEvent::MouseUp { x: 990.0, y: 1200.0, button: MouseButton::Left }, now);
        assert_eq!(touch_of(&up[0]), (TouchAction::Up, 999, 1999, 0.0));
    }

    #[test]
    fn right_button_is_back() {
        let mut t = translator();
        let msgs = t.translate(&InputEvent::MouseDown { x: 0.0, y: 0.0, button: MouseButton::Right }, Instant::now());
        assert_eq!(msgs, press(keycode::BACK));
        assert!(t
            .translate(&InputEvent::MouseUp { x: 0.0, y: 0.0, button: MouseButton::Right }, Instant::now())
            .is_empty());
    }

    #[test]
    fn key_table() {
        assert_eq!(android_keycode(Key::Home), Some(3));
        assert_eq!(android_keycode(Key::Escape), Some(4));
        assert_eq!(android_keycode(Key::Enter), Some(66));
        assert_eq!(android_keycode(Key::Digit(0)), Some(7));
        assert_eq!(android_keycode(Key::Digit(9)), Some(16));
        assert_eq!(android_keycode(Key::Letter('a')), Some(29));
        assert_eq!(android_keycode(Key::Letter('Z')), Some(54));
        assert_eq!(android_keycode(Key::Grave), Some(68));
        assert_eq!(android_keycode(Key::Digit(12)), None);
        assert_eq!(android_keycode(Key::Letter('é')), None);
    }

    #[test]
    fn key_events_carry_action() {
        let mut t = translator();
        let down = t.translate(&InputEvent::KeyDown { key: Key::Backspace }, Instant::now());
        assert_eq!(down, vec![ControlMessage::InjectKeycode { action: KeyAction::Down, keycode: 67, meta_state: 0 }]);
        let up = t.translate(&InputEvent::KeyUp { key: Key::Letter('é') }, Instant::now());
        assert!(up.is_empty());
    }

    #[test]
    fn only_non_ascii_text_is_pasted() {
        let mut t = translator();
        assert!(t.translate(&InputEvent::Text { text: "hello".into() }, Instant::now()).is_empty());
        assert!(t.translate(&InputEvent::Text { text: String::new() }, Instant::now()).is_empty());
        let msgs = t.translate(&InputEvent::Text { text: "ñandú".into() }, Instant::now());
        assert_eq!(msgs, vec![ControlMessage::SetClipboard { text: "ñandú".into(), paste: true }]);
    }
}
