use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use image::{Rgba, RgbaImage};
use tracing::info;

use super::{Platform, WindowHandle};
use crate::types::*;

/// Everything the stub was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Capture(Option<CaptureRect>),
    Move(Point),
    Click { at: Point, button: MouseButton, count: u32 },
    Scroll { at: Point, amount: i32 },
    Text(String),
    Combo(Vec<String>),
    SetClipboard(String),
    Restore(String),
    Activate(String),
}

/// Shared handle on the stub's event record; stays valid after the
/// platform moves into a worker thread.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<InputEvent>>>);

impl EventLog {
    fn push(&self, e: InputEvent) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).push(e);
    }

    pub fn events(&self) -> Vec<InputEvent> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clicks(&self) -> Vec<(Point, MouseButton)> {
        self.events()
            .into_iter()
            .flat_map(|e| match e {
                InputEvent::Click { at, button, count } => vec![(at, button); count as usize],
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn captures(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, InputEvent::Capture(_))).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

struct StubWindowSpec {
    title: String,
    minimized: bool,
}

/// Deterministic in-memory platform. Screens are served in sequence, the
/// last one repeating.
pub struct StubPlatform {
    screens: Vec<RgbaImage>,
    next_screen: usize,
    cursor: Point,
    clipboard: String,
    clipboard_failures: u32,
    windows: Vec<StubWindowSpec>,
    log: EventLog,
}

impl StubPlatform {
    pub fn new() -> Self {
        Self {
            screens: vec![RgbaImage::from_pixel(320, 240, Rgba([128, 128, 128, 255]))],
            next_screen: 0,
            cursor: Point::default(),
            clipboard: String::new(),
            clipboard_failures: 0,
            windows: Vec::new(),
            log: EventLog::default(),
        }
    }

    pub fn with_screen(self, screen: RgbaImage) -> Self {
        self.with_screens(vec![screen])
    }

    pub fn with_screens(mut self, screens: Vec<RgbaImage>) -> Self {
        if !screens.is_empty() {
            self.screens = screens;
        }
        self
    }

    pub fn with_window(mut self, title: &str, minimized: bool) -> Self {
        self.windows.push(StubWindowSpec { title: title.to_string(), minimized });
        self
    }

    pub fn with_clipboard(mut self, text: &str) -> Self {
        self.clipboard = text.to_string();
        self
    }

    /// The next `n` clipboard writes fail.
    pub fn with_clipboard_failures(mut self, n: u32) -> Self {
        self.clipboard_failures = n;
        self
    }

    pub fn events(&self) -> EventLog {
        self.log.clone()
    }

    pub fn cursor(&self) -> Point {
        self.cursor
    }
}

impl Default for StubPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for StubPlatform {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn capture(&mut self, rect: Option<CaptureRect>) -> anyhow::Result<Screenshot> {
        info!(target: "stub", "capture({:?})", rect);
        self.log.push(InputEvent::Capture(rect));
        let idx = self.next_screen.min(self.screens.len() - 1);
        self.next_screen += 1;
        let full = Screenshot::new(self.screens[idx].clone(), Point::default());
        match rect {
            None => Ok(full),
            Some(r) => match full.crop(r.l, r.t, r.l + r.w as i32, r.t + r.h as i32) {
                Some(shot) => Ok(shot),
                None => bail!("capture region {:?} is off screen", r),
            },
        }
    }

    fn move_cursor(&mut self, to: Point, duration: Duration) -> anyhow::Result<()> {
        info!(target: "stub", "move_cursor({}, {:?})", to, duration);
        self.cursor = to;
        self.log.push(InputEvent::Move(to));
        Ok(())
    }

    fn click(&mut self, button: MouseButton, count: u32, _interval: Duration) -> anyhow::Result<()> {
        info!(target: "stub", "click({:?} x{}) at {}", button, count, self.cursor);
        self.log.push(InputEvent::Click { at: self.cursor, button, count });
        Ok(())
    }

    fn scroll(&mut self, amount: i32) -> anyhow::Result<()> {
        info!(target: "stub", "scroll({}) at {}", amount, self.cursor);
        self.log.push(InputEvent::Scroll { at: self.cursor, amount });
        Ok(())
    }

    fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        info!(target: "stub", "send_text(\"{}\")", text);
        self.log.push(InputEvent::Text(text.to_string()));
        Ok(())
    }

    fn press_combo(&mut self, keys: &[String]) -> anyhow::Result<()> {
        info!(target: "stub", "press_combo({})", keys.join("+"));
        self.log.push(InputEvent::Combo(keys.to_vec()));
        Ok(())
    }

    fn set_clipboard(&mut self, text: &str) -> anyhow::Result<()> {
        if self.clipboard_failures > 0 {
            self.clipboard_failures -= 1;
            bail!("clipboard busy");
        }
        info!(target: "stub", "set_clipboard(\"{}\")", text);
        self.clipboard = text.to_string();
        self.log.push(InputEvent::SetClipboard(text.to_string()));
        Ok(())
    }

    fn clipboard(&mut self) -> anyhow::Result<String> {
        Ok(self.clipboard.clone())
    }

    fn find_windows(&mut self, title: &str) -> anyhow::Result<Vec<Box<dyn WindowHandle>>> {
        info!(target: "stub", "find_windows(\"{}\")", title);
        let needle = title.to_lowercase();
        Ok(self
            .windows
            .iter()
            .filter(|w| w.title.to_lowercase().contains(&needle))
            .map(|w| {
                Box::new(StubWindow { title: w.title.clone(), minimized: w.minimized, log: self.log.clone() })
                    as Box<dyn WindowHandle>
            })
            .collect())
    }
}

struct StubWindow {
    title: String,
    minimized: bool,
    log: EventLog,
}

impl WindowHandle for StubWindow {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn is_minimized(&self) -> bool {
        self.minimized
    }

    fn restore(&mut self) -> anyhow::Result<()> {
        info!(target: "stub", "win(\"{}\").restore()", self.title);
        self.minimized = false;
        self.log.push(InputEvent::Restore(self.title.clone()));
        Ok(())
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        info!(target: "stub", "win(\"{}\").activate()", self.title);
        self.log.push(InputEvent::Activate(self.title.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screens_advance_and_last_repeats() {
        let a = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        let b = RgbaImage::from_pixel(10, 10, Rgba([255, 255, 255, 255]));
        let mut p = StubPlatform::new().with_screens(vec![a, b]);
        let first = p.capture(None).unwrap();
        let second = p.capture(Some(CaptureRect { l: 2, t: 3, w: 4, h: 4 })).unwrap();
        let third = p.capture(None).unwrap();
        assert_eq!(first.image.get_pixel(0, 0)[0], 0);
        assert_eq!(second.offset, Point::new(2, 3));
        assert_eq!(second.width(), 4);
        assert_eq!(third.image.get_pixel(0, 0)[0], 255);
        assert_eq!(p.events().captures(), 3);
        assert!(p.capture(Some(CaptureRect { l: 50, t: 50, w: 4, h: 4 })).is_err());
    }

    #[test]
    fn clicks_land_at_cursor() {
        let mut p = StubPlatform::new();
        p.move_cursor(Point::new(5, 6), Duration::ZERO).unwrap();
        p.click(MouseButton::Right, 2, Duration::ZERO).unwrap();
        assert_eq!(p.events().clicks(), vec![(Point::new(5, 6), MouseButton::Right); 2]);
    }

    #[test]
    fn windows_match_by_substring() {
        let mut p = StubPlatform::new().with_window("Untitled - Notepad", true).with_window("Calculator", false);
        let mut found = p.find_windows("notepad").unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_minimized());
        found[0].restore().unwrap();
        assert_eq!(p.events().events(), vec![InputEvent::Restore("Untitled - Notepad".into())]);
        assert!(p.find_windows("paint").unwrap().is_empty());
    }

    #[test]
    fn clipboard_failures_are_consumed() {
        let mut p = StubPlatform::new().with_clipboard_failures(1);
        assert!(p.set_clipboard("x").is_err());
        p.set_clipboard("y").unwrap();
        assert_eq!(p.clipboard().unwrap(), "y");
    }
}
