use crate::errors::AutomationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[cfg(target_os = "windows")]
pub mod windows;

/// Opaque native window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowHandle(pub isize);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Screen-space rectangle (position + size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from left/top/right/bottom edges.
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, right - left, bottom - top)
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Area in pixels; degenerate rectangles have no area.
    pub fn area(&self) -> i64 {
        if self.width <= 0 || self.height <= 0 {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// A rectangle of at most `max_width` x `max_height` (and at most
    /// `fraction` of the screen) centered on a screen of the given size.
    pub fn centered_on_screen(
        screen_width: i32,
        screen_height: i32,
        max_width: i32,
        max_height: i32,
        fraction: f64,
    ) -> Self {
        let width = max_width.min((screen_width as f64 * fraction) as i32);
        let height = max_height.min((screen_height as f64 * fraction) as i32);
        Self::new(
            (screen_width - width) / 2,
            (screen_height - height) / 2,
            width,
            height,
        )
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) {}x{}",
            self.x, self.y, self.width, self.height
        )
    }
}

/// A top-level OS window as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub handle: WindowHandle,
    pub title: String,
    pub class_name: String,
    pub rect: Rect,
    pub minimized: bool,
    pub visible: bool,
}

/// State changes the acquirer may request, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WindowCommand {
    Restore,
    Show,
    ShowNormal,
    BringToFront,
    Maximize,
    MoveResize(Rect),
}

/// Narrow interface over the OS window manager.
///
/// Focus, z-order and size are global state shared with every other process,
/// so only the window acquirer talks to this.
pub trait WindowSystem: Send + Sync {
    /// Every top-level window with a title, including minimized and hidden ones.
    fn enumerate(&self) -> Result<Vec<WindowInfo>, AutomationError>;

    fn foreground(&self) -> Option<WindowHandle>;

    /// Re-read a single window's state.
    fn window(&self, handle: WindowHandle) -> Result<WindowInfo, AutomationError>;

    fn apply(&self, handle: WindowHandle, command: WindowCommand) -> Result<(), AutomationError>;

    /// Primary screen size in pixels.
    fn screen_size(&self) -> (i32, i32);
}

pub fn create_window_system() -> Result<Arc<dyn WindowSystem>, AutomationError> {
    #[cfg(target_os = "windows")]
    {
        Ok(Arc::new(windows::Win32WindowSystem::new()))
    }
    #[cfg(not(target_os = "windows"))]
    {
        Err(AutomationError::UnsupportedPlatform(format!(
            "window acquisition is not available on {}",
            std::env::consts::OS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_rect_has_no_area() {
        assert_eq!(Rect::new(-32000, -32000, 0, 0).area(), 0);
        assert_eq!(Rect::new(0, 0, -5, 10).area(), 0);
        assert_eq!(Rect::new(10, 10, 300, 200).area(), 60_000);
    }

    #[test]
    fn centered_rect_respects_caps() {
        let rect = Rect::centered_on_screen(1920, 1080, 1200, 800, 0.8);
        assert_eq!(rect, Rect::new(360, 140, 1200, 800));

        let small = Rect::centered_on_screen(1000, 700, 1200, 800, 0.8);
        assert_eq!(small, Rect::new(100, 70, 800, 560));
    }

    #[test]
    fn edges_convert_to_size() {
        assert_eq!(Rect::from_edges(10, 20, 110, 220), Rect::new(10, 20, 100, 200));
    }
}
