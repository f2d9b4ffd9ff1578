pub mod stub;
pub mod hotkey;

#[cfg(feature = "native")]
pub mod native;

#[cfg(all(feature = "native", target_os = "windows"))]
pub mod win32;

#[cfg(all(feature = "native", target_os = "macos"))]
pub mod darwin;

use std::time::Duration;

use crate::logger;
use crate::types::*;

/// A top-level OS window found by title.
pub trait WindowHandle: Send {
    fn title(&self) -> String;
    fn is_minimized(&self) -> bool;
    fn restore(&mut self) -> anyhow::Result<()>;
    fn activate(&mut self) -> anyhow::Result<()>;
}

/// Input injection, screen capture, clipboard and window lookup.
pub trait Platform: Send {
    fn name(&self) -> &'static str;

    /// `None` grabs the whole primary screen.
    fn capture(&mut self, rect: Option<CaptureRect>) -> anyhow::Result<Screenshot>;

    /// Move the pointer, gliding over `duration` when it is non-zero.
    fn move_cursor(&mut self, to: Point, duration: Duration) -> anyhow::Result<()>;

    /// Click at the current pointer position.
    fn click(&mut self, button: MouseButton, count: u32, interval: Duration) -> anyhow::Result<()>;

    /// Positive amounts scroll up.
    fn scroll(&mut self, amount: i32) -> anyhow::Result<()>;

    fn send_text(&mut self, text: &str) -> anyhow::Result<()>;

    /// Press all keys in order, then release them in reverse.
    fn press_combo(&mut self, keys: &[String]) -> anyhow::Result<()>;

    fn set_clipboard(&mut self, text: &str) -> anyhow::Result<()>;

    fn clipboard(&mut self) -> anyhow::Result<String>;

    /// Windows whose title contains `title`, case-insensitively.
    fn find_windows(&mut self, title: &str) -> anyhow::Result<Vec<Box<dyn WindowHandle>>>;
}

/// Modifier used for paste on this OS.
pub fn paste_combo() -> Vec<String> {
    let modifier = if cfg!(target_os = "macos") { "cmd" } else { "ctrl" };
    vec![modifier.to_string(), "v".to_string()]
}

/// Create the platform appropriate for the current build.
pub fn create_platform(force_stub: bool) -> Box<dyn Platform> {
    logger::register_prefix("stub", logger::COLOR_GRAY);
    logger::register_prefix("interpreter", logger::COLOR_BLUE);
    logger::register_prefix("resolve", logger::COLOR_YELLOW);
    if force_stub {
        return Box::new(stub::StubPlatform::new());
    }
    #[cfg(feature = "native")]
    {
        logger::register_prefix("native", logger::COLOR_GRAY);
        match native::NativePlatform::new() {
            Ok(p) => return Box::new(p),
            Err(e) => tracing::error!("native platform unavailable, using stub: {:#}", e),
        }
    }
    #[cfg(not(feature = "native"))]
    tracing::warn!("built without the `native` feature, using stub platform");
    Box::new(stub::StubPlatform::new())
}
