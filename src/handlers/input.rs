//! Touch/key/scroll input handler (spec.md §4.9).

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Up,
    Move,
    PointerDown,
    PointerUp,
}

#[derive(Debug, Clone, Copy)]
pub struct TouchEvent {
    pub action: TouchAction,
    pub pointer_id: u8,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ScrollEvent {
    pub delta: i8,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyEvent {
    pub keycode: i32,
    pub down: bool,
}

/// Android keycode for the hardware "guide"/home button, mapped by spec.md
/// §4.9 to a synthetic touch-down/up at a fixed point.
pub const KEY_GUIDE: i32 = 172;
/// Toggles night mode in both directions.
pub const KEY_N: i32 = 78;
pub const KEY_SOFT_LEFT: i32 = 1;
pub const KEY_SOFT_RIGHT: i32 = 2;

pub const MAX_POINTERS: usize = 10;
/// Coordinates outside `[0, 65535)` cause the whole event to be dropped.
const COORD_MAX: i32 = 65535;

#[derive(Debug)]
pub enum KeyOutcome {
    /// Forward the (possibly remapped) keycode as-is.
    Forward(i32),
    /// Synthesize a touch-down/up at the fixed "guide" point.
    SyntheticGuideTouch,
    /// Toggle night mode.
    ToggleNightMode,
    /// Synthesize a scroll-wheel delta; only emitted on key-down.
    SyntheticScroll(i8),
    /// Remapped to nothing (suppressed).
    Suppressed,
}

pub struct InputHandler {
    key_map: HashMap<i32, i32>,
    local_width: u32,
    local_height: u32,
    phone_width: u32,
    phone_height: u32,
}

impl InputHandler {
    pub fn new(
        key_map: HashMap<i32, i32>,
        local_width: u32,
        local_height: u32,
        phone_width: u32,
        phone_height: u32,
    ) -> Self {
        InputHandler {
            key_map,
            local_width,
            local_height,
            phone_width,
            phone_height,
        }
    }

    /// Scales local view coordinates to the negotiated phone resolution
    /// using integer arithmetic, then validates the `[0, 65535)` range
    /// (spec.md §4.9). Returns `None` if the event must be dropped.
    pub fn scale_touch(&self, local_x: i32, local_y: i32) -> Option<(i32, i32)> {
        if self.local_width == 0 || self.local_height == 0 {
            return None;
        }
        let x = (local_x * self.phone_width as i32) / self.local_width as i32;
        let y = (local_y * self.phone_height as i32) / self.local_height as i32;
        if !(0..COORD_MAX).contains(&x) || !(0..COORD_MAX).contains(&y) {
            return None;
        }
        Some((x, y))
    }

    pub fn map_key(&self, event: KeyEvent) -> KeyOutcome {
        if event.keycode == KEY_GUIDE {
            return KeyOutcome::SyntheticGuideTouch;
        }
        if event.keycode == KEY_N {
            return KeyOutcome::ToggleNightMode;
        }
        if event.keycode == KEY_SOFT_LEFT {
            return if event.down {
                KeyOutcome::SyntheticScroll(-1)
            } else {
                KeyOutcome::Suppressed
            };
        }
        if event.keycode == KEY_SOFT_RIGHT {
            return if event.down {
                KeyOutcome::SyntheticScroll(1)
            } else {
                KeyOutcome::Suppressed
            };
        }
        match self.key_map.get(&event.keycode) {
            Some(&remapped) => KeyOutcome::Forward(remapped),
            None => KeyOutcome::Forward(event.keycode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_touch_is_dropped() {
        let handler = InputHandler::new(HashMap::new(), 800, 480, 1280, 720);
        // local (65540-equivalent once scaled) forces out-of-range output
        assert!(handler.scale_touch(100_000, 100).is_none());
    }

    #[test]
    fn in_range_touch_scales_correctly() {
        let handler = InputHandler::new(HashMap::new(), 800, 480, 1280, 720);
        let (x, y) = handler.scale_touch(400, 240).unwrap();
        assert_eq!(x, 640);
        assert_eq!(y, 360);
    }

    #[test]
    fn guide_key_becomes_synthetic_touch() {
        let handler = InputHandler::new(HashMap::new(), 800, 480, 1280, 720);
        let outcome = handler.map_key(KeyEvent {
            keycode: KEY_GUIDE,
            down: true,
        });
        assert!(matches!(outcome, KeyOutcome::SyntheticGuideTouch));
    }

    #[test]
    fn soft_keys_scroll_only_on_press() {
        let handler = InputHandler::new(HashMap::new(), 800, 480, 1280, 720);
        assert!(matches!(
            handler.map_key(KeyEvent { keycode: KEY_SOFT_RIGHT, down: true }),
            KeyOutcome::SyntheticScroll(1)
        ));
        assert!(matches!(
            handler.map_key(KeyEvent { keycode: KEY_SOFT_RIGHT, down: false }),
            KeyOutcome::Suppressed
        ));
    }

    #[test]
    fn user_key_map_remaps_keycode() {
        let mut map = HashMap::new();
        map.insert(50, 99);
        let handler = InputHandler::new(map, 800, 480, 1280, 720);
        assert!(matches!(
            handler.map_key(KeyEvent { keycode: 50, down: true }),
            KeyOutcome::Forward(99)
        ));
    }
}
