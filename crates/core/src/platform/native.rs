use std::thread;
use std::time::Duration;

use anyhow::{bail, Context as _};
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use tracing::{debug, info};

use super::{Platform, WindowHandle};
use crate::types::*;

const GLIDE_STEP: Duration = Duration::from_millis(10);

/// Real desktop: `enigo` input, `xcap` capture, `arboard` clipboard and
/// the OS window manager.
pub struct NativePlatform;

impl NativePlatform {
    pub fn new() -> anyhow::Result<Self> {
        // Probe once so a missing display or permission fails up front.
        enigo()?;
        xcap::Monitor::from_point(0, 0).context("no monitor at (0, 0)")?;
        info!("native platform ready");
        Ok(NativePlatform)
    }
}

// Input and clipboard handles are not Send on every OS; open them per call.
fn enigo() -> anyhow::Result<Enigo> {
    Enigo::new(&Settings::default()).context("failed to open input device")
}

fn clipboard() -> anyhow::Result<arboard::Clipboard> {
    arboard::Clipboard::new().context("failed to open clipboard")
}

fn to_button(b: MouseButton) -> Button {
    match b {
        MouseButton::Left => Button::Left,
        MouseButton::Right => Button::Right,
        MouseButton::Middle => Button::Middle,
    }
}

/// Map a lowercase key name to an enigo key.
pub fn parse_key(name: &str) -> anyhow::Result<Key> {
    let key = match name {
        "ctrl" | "control" => Key::Control,
        "shift" => Key::Shift,
        "alt" | "option" => Key::Alt,
        "cmd" | "command" | "win" | "meta" | "super" => Key::Meta,
        "enter" | "return" => Key::Return,
        "esc" | "escape" => Key::Escape,
        "tab" => Key::Tab,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "pgup" => Key::PageUp,
        "pagedown" | "pgdn" => Key::PageDown,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c),
                _ => bail!("unknown key '{}'", other),
            }
        }
    };
    Ok(key)
}

impl Platform for NativePlatform {
    fn name(&self) -> &'static str {
        "native"
    }

    fn capture(&mut self, rect: Option<CaptureRect>) -> anyhow::Result<Screenshot> {
        let monitor = xcap::Monitor::from_point(0, 0).context("no monitor at (0, 0)")?;
        let image = monitor.capture_image().context("screen capture failed")?;
        let full = Screenshot::new(image, Point::default());
        match rect {
            None => Ok(full),
            Some(r) => full
                .crop(r.l, r.t, r.l + r.w as i32, r.t + r.h as i32)
                .with_context(|| format!("capture region {:?} is off screen", r)),
        }
    }

    fn move_cursor(&mut self, to: Point, duration: Duration) -> anyhow::Result<()> {
        let mut e = enigo()?;
        if !duration.is_zero() {
            let (sx, sy) = e.location()?;
            let steps = (duration.as_millis() / GLIDE_STEP.as_millis()).max(1) as i32;
            for i in 1..steps {
                let x = sx + (to.x - sx) * i / steps;
                let y = sy + (to.y - sy) * i / steps;
                e.move_mouse(x, y, Coordinate::Abs)?;
                thread::sleep(GLIDE_STEP);
            }
        }
        e.move_mouse(to.x, to.y, Coordinate::Abs)?;
        Ok(())
    }

    fn click(&mut self, button: MouseButton, count: u32, interval: Duration) -> anyhow::Result<()> {
        let mut e = enigo()?;
        for i in 0..count {
            if i > 0 && !interval.is_zero() {
                thread::sleep(interval);
            }
            e.button(to_button(button), Direction::Click)?;
        }
        Ok(())
    }

    fn scroll(&mut self, amount: i32) -> anyhow::Result<()> {
        // enigo scrolls down for positive lengths
        enigo()?.scroll(-amount, Axis::Vertical)?;
        Ok(())
    }

    fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        enigo()?.text(text)?;
        Ok(())
    }

    fn press_combo(&mut self, keys: &[String]) -> anyhow::Result<()> {
        let parsed = keys.iter().map(|k| parse_key(k)).collect::<anyhow::Result<Vec<_>>>()?;
        debug!("press_combo {:?}", parsed);
        let mut e = enigo()?;
        if let [single] = parsed.as_slice() {
            e.key(*single, Direction::Click)?;
            return Ok(());
        }
        for k in &parsed {
            e.key(*k, Direction::Press)?;
        }
        for k in parsed.iter().rev() {
            e.key(*k, Direction::Release)?;
        }
        Ok(())
    }

    fn set_clipboard(&mut self, text: &str) -> anyhow::Result<()> {
        clipboard()?.set_text(text.to_string())?;
        Ok(())
    }

    fn clipboard(&mut self) -> anyhow::Result<String> {
        Ok(clipboard()?.get_text()?)
    }

    fn find_windows(&mut self, title: &str) -> anyhow::Result<Vec<Box<dyn WindowHandle>>> {
        #[cfg(target_os = "windows")]
        return super::win32::find_windows(title);
        #[cfg(target_os = "macos")]
        return super::darwin::find_windows(title);
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let _ = title;
            bail!("window management is not supported on this OS")
        }
    }
}
