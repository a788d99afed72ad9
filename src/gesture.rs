//! Turning raw touch and key input into reader navigation.

use serde::{Deserialize, Serialize};

const SCROLL_THRESHOLD: f64 = 10.0;
const SWIPE_MIN_DISTANCE: f64 = 50.0;
const SWIPE_MAX_DURATION_MS: u64 = 300;
const DOUBLE_TAP_WINDOW_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingDirection {
    #[default]
    Ltr,
    Rtl,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchPoint {
    pub x: f64,
    pub y: f64,
    /// Milliseconds on any monotonic clock.
    pub at_ms: u64,
}

impl TouchPoint {
    pub fn new(x: f64, y: f64, at_ms: u64) -> Self {
        Self { x, y, at_ms }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureAction {
    None,
    NextPage,
    PreviousPage,
    ToggleZoom,
}

#[derive(Debug, Clone, Copy)]
pub struct GestureOptions {
    pub direction: ReadingDirection,
    pub gesture_navigation: bool,
    pub double_tap_zoom: bool,
}

#[derive(Debug, Default)]
pub struct GestureTracker {
    start: Option<TouchPoint>,
    scrolling: bool,
    last_tap_ms: Option<u64>,
}

impl GestureTracker {
    pub fn touch_start(&mut self, point: TouchPoint) {
        self.start = Some(point);
        self.scrolling = false;
    }

    /// Marks the gesture as a scroll once it moves mostly vertically past the threshold.
    pub fn touch_move(&mut self, point: TouchPoint, options: GestureOptions) {
        if !options.gesture_navigation {
            return;
        }
        let Some(start) = self.start else {
            return;
        };

        let dx = (point.x - start.x).abs();
        let dy = (point.y - start.y).abs();
        if dy > dx && dy > SCROLL_THRESHOLD {
            self.scrolling = true;
        }
    }

    pub fn touch_end(&mut self, point: TouchPoint, options: GestureOptions) -> GestureAction {
        let Some(start) = self.start.take() else {
            return GestureAction::None;
        };
        if !options.gesture_navigation {
            return GestureAction::None;
        }

        let dx = point.x - start.x;
        let dy = point.y - start.y;
        let duration = point.at_ms.saturating_sub(start.at_ms);

        if options.double_tap_zoom && duration < DOUBLE_TAP_WINDOW_MS {
            match self.last_tap_ms {
                Some(last) if point.at_ms.saturating_sub(last) < DOUBLE_TAP_WINDOW_MS => {
                    self.last_tap_ms = None;
                    return GestureAction::ToggleZoom;
                }
                _ => self.last_tap_ms = Some(point.at_ms),
            }
        }

        if self.scrolling || duration >= SWIPE_MAX_DURATION_MS {
            return GestureAction::None;
        }
        if dx.abs() <= SWIPE_MIN_DISTANCE || dx.abs() <= dy.abs() {
            return GestureAction::None;
        }

        let towards_previous = dx > 0.0;
        match (towards_previous, options.direction) {
            (true, ReadingDirection::Ltr) | (false, ReadingDirection::Rtl) => {
                GestureAction::PreviousPage
            }
            (true, ReadingDirection::Rtl) | (false, ReadingDirection::Ltr) => GestureAction::NextPage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    PreviousPage,
    NextPage,
    ScrollUp,
    ScrollDown,
    ToggleFullscreen,
    ToggleUi,
    ExitFullscreen,
}

/// Keyboard shortcuts; horizontal keys follow the reading direction.
pub fn key_action(key: &str, direction: ReadingDirection) -> Option<KeyAction> {
    let rtl = direction == ReadingDirection::Rtl;
    let action = match key {
        "ArrowLeft" | "a" | "A" if rtl => KeyAction::NextPage,
        "ArrowLeft" | "a" | "A" => KeyAction::PreviousPage,
        "ArrowRight" | "d" | "D" if rtl => KeyAction::PreviousPage,
        "ArrowRight" | "d" | "D" => KeyAction::NextPage,
        "ArrowUp" | "w" | "W" => KeyAction::ScrollUp,
        "ArrowDown" | "s" | "S" => KeyAction::ScrollDown,
        "f" | "F" => KeyAction::ToggleFullscreen,
        "h" | "H" => KeyAction::ToggleUi,
        " " => KeyAction::NextPage,
        "Escape" => KeyAction::ExitFullscreen,
        _ => return None,
    };
    Some(action)
}
