use std::time::Duration;

use tracing::{info, warn};

use crate::context::RunContext;
use crate::error::StepError;
use crate::platform::{paste_combo, Platform};
use crate::settings::EngineSettings;
use crate::sleep::{sleep_interruptible, sleep_ms};
use crate::step::Action;

/// Placeholder in TYPE_TEXT replaced by the last captured text.
pub const CLIPBOARD_TOKEN: &str = "{CLIPBOARD}";

/// Delay between the clipboard write and the paste keystroke.
const PASTE_SETTLE_MS: u64 = 100;

/// Run one non-control action. Coordinates flow only through
/// `ctx.last_position`.
pub fn dispatch(
    action: &Action,
    platform: &mut dyn Platform,
    ctx: &mut RunContext,
    settings: &EngineSettings,
) -> Result<(), StepError> {
    match action {
        Action::Click { at, button, clicks, interval, duration } => {
            if let Some(p) = at {
                platform.move_cursor(*p, *duration)?;
                ctx.last_position = Some(*p);
            }
            platform.click(*button, *clicks, *interval)?;
        }
        Action::MoveTo { to, duration } => {
            platform.move_cursor(*to, *duration)?;
            ctx.last_position = Some(*to);
        }
        Action::MoveOffset { dx, dy, duration } => {
            let from = ctx.last_position.ok_or(StepError::MissingPosition)?;
            let to = from.offset(*dx, *dy);
            platform.move_cursor(to, *duration)?;
            ctx.last_position = Some(to);
        }
        Action::Scroll { amount, at } => {
            if let Some(p) = at {
                platform.move_cursor(*p, Duration::ZERO)?;
                ctx.last_position = Some(*p);
            }
            platform.scroll(*amount)?;
        }
        Action::Wait { ms } => {
            let step = Duration::from_millis(settings.wait_increment_ms);
            if !sleep_interruptible(Duration::from_millis(*ms), step, &ctx.stop) {
                info!("wait interrupted by stop request");
            }
        }
        Action::TypeText { text, interval } => {
            let text = expand_clipboard(text, platform, ctx);
            type_text(&text, *interval, platform, ctx, settings)?;
        }
        Action::PressKey { keys } => platform.press_combo(keys)?,
        Action::ActivateWindow { title } => {
            let mut windows = platform.find_windows(title)?;
            let Some(win) = windows.first_mut() else {
                return Err(StepError::WindowNotFound(title.clone()));
            };
            if win.is_minimized() {
                info!("restoring '{}'", win.title());
                win.restore()?;
            }
            win.activate()?;
            info!("activated '{}'", win.title());
            let settle = Duration::from_millis(settings.activate_settle_ms);
            sleep_interruptible(settle, Duration::from_millis(settings.wait_increment_ms), &ctx.stop);
        }
        other => {
            return Err(StepError::Unsupported(format!("{:?} is not a plain action", other)));
        }
    }
    Ok(())
}

/// Substitute the placeholder with the saved text, or with the OS clipboard
/// when nothing was saved during this run.
fn expand_clipboard(text: &str, platform: &mut dyn Platform, ctx: &RunContext) -> String {
    if !text.contains(CLIPBOARD_TOKEN) {
        return text.to_string();
    }
    let value = if !ctx.clipboard_var.is_empty() {
        ctx.clipboard_var.clone()
    } else {
        platform.clipboard().unwrap_or_else(|e| {
            warn!("clipboard read failed: {:#}", e);
            String::new()
        })
    };
    text.replace(CLIPBOARD_TOKEN, &value)
}

fn type_text(
    text: &str,
    interval: Duration,
    platform: &mut dyn Platform,
    ctx: &RunContext,
    settings: &EngineSettings,
) -> Result<(), StepError> {
    if !interval.is_zero() {
        let mut buf = [0u8; 4];
        for c in text.chars() {
            if ctx.stop_requested() {
                return Ok(());
            }
            platform.send_text(c.encode_utf8(&mut buf))?;
            std::thread::sleep(interval);
        }
        return Ok(());
    }

    let attempts = settings.clipboard_retries.max(1);
    for attempt in 1..=attempts {
        match platform.set_clipboard(text) {
            Ok(()) => break,
            Err(e) if attempt < attempts => {
                warn!("clipboard write failed (attempt {}/{}): {:#}", attempt, attempts, e);
                sleep_ms(settings.clipboard_retry_delay_ms);
            }
            Err(e) => warn!("clipboard write failed, pasting anyway: {:#}", e),
        }
    }
    sleep_ms(PASTE_SETTLE_MS);
    platform.press_combo(&paste_combo())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::{InputEvent, StubPlatform};
    use crate::types::{MouseButton, Point};
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn fast() -> EngineSettings {
        EngineSettings { clipboard_retry_delay_ms: 1, activate_settle_ms: 0, ..Default::default() }
    }

    #[test]
    fn click_at_point_moves_first() {
        let mut p = StubPlatform::new();
        let mut ctx = RunContext::default();
        let a = Action::Click {
            at: Some(Point::new(10, 10)),
            button: MouseButton::Left,
            clicks: 2,
            interval: Duration::ZERO,
            duration: Duration::ZERO,
        };
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(p.events().clicks(), vec![(Point::new(10, 10), MouseButton::Left); 2]);
        assert_eq!(ctx.last_position, Some(Point::new(10, 10)));
    }

    #[test]
    fn move_offset_needs_a_position() {
        let mut p = StubPlatform::new();
        let mut ctx = RunContext::default();
        let a = Action::MoveOffset { dx: 5, dy: -3, duration: Duration::ZERO };
        assert!(matches!(dispatch(&a, &mut p, &mut ctx, &fast()), Err(StepError::MissingPosition)));

        ctx.last_position = Some(Point::new(100, 100));
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(p.cursor(), Point::new(105, 97));
        assert_eq!(ctx.last_position, Some(Point::new(105, 97)));
    }

    #[test]
    fn scroll_moves_when_given_a_point() {
        let mut p = StubPlatform::new();
        let mut ctx = RunContext::default();
        let a = Action::Scroll { amount: -3, at: Some(Point::new(7, 8)) };
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(
            p.events().events(),
            vec![InputEvent::Move(Point::new(7, 8)), InputEvent::Scroll { at: Point::new(7, 8), amount: -3 }]
        );
    }

    #[test]
    fn type_text_pastes_with_placeholder() {
        let mut p = StubPlatform::new();
        let mut ctx = RunContext { clipboard_var: "42".into(), ..Default::default() };
        let a = Action::TypeText { text: "total: {CLIPBOARD}".into(), interval: Duration::ZERO };
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(
            p.events().events(),
            vec![InputEvent::SetClipboard("total: 42".into()), InputEvent::Combo(paste_combo())]
        );
    }

    #[test]
    fn placeholder_falls_back_to_os_clipboard() {
        let mut p = StubPlatform::new().with_clipboard("from os");
        let mut ctx = RunContext::default();
        let a = Action::TypeText { text: "{CLIPBOARD}!".into(), interval: Duration::ZERO };
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(p.events().events()[0], InputEvent::SetClipboard("from os!".into()));
    }

    #[test]
    fn clipboard_retries_then_pastes_anyway() {
        let mut p = StubPlatform::new().with_clipboard_failures(5);
        let mut ctx = RunContext::default();
        let a = Action::TypeText { text: "hi".into(), interval: Duration::ZERO };
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(p.events().events(), vec![InputEvent::Combo(paste_combo())]);

        let mut p = StubPlatform::new().with_clipboard_failures(2);
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(p.events().events()[0], InputEvent::SetClipboard("hi".into()));
    }

    #[test]
    fn typed_with_interval_goes_char_by_char() {
        let mut p = StubPlatform::new();
        let mut ctx = RunContext::default();
        let a = Action::TypeText { text: "né".into(), interval: Duration::from_millis(1) };
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(p.events().events(), vec![InputEvent::Text("n".into()), InputEvent::Text("é".into())]);
    }

    #[test]
    fn activate_restores_minimized_window() {
        let mut p = StubPlatform::new().with_window("Untitled - Notepad", true);
        let mut ctx = RunContext::default();
        let a = Action::ActivateWindow { title: "notepad".into() };
        dispatch(&a, &mut p, &mut ctx, &fast()).unwrap();
        assert_eq!(
            p.events().events(),
            vec![
                InputEvent::Restore("Untitled - Notepad".into()),
                InputEvent::Activate("Untitled - Notepad".into())
            ]
        );

        let a = Action::ActivateWindow { title: "paint".into() };
        assert!(matches!(dispatch(&a, &mut p, &mut ctx, &fast()), Err(StepError::WindowNotFound(_))));
    }

    #[test]
    fn wait_honors_stop_within_one_increment() {
        let mut p = StubPlatform::new();
        let mut ctx = RunContext::default();
        let stop = ctx.stop.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            stop.store(true, Ordering::Release);
        });
        let start = Instant::now();
        dispatch(&Action::Wait { ms: 5000 }, &mut p, &mut ctx, &EngineSettings::default()).unwrap();
        let elapsed = start.elapsed();
        t.join().unwrap();
        assert!(elapsed < Duration::from_millis(1000), "wait ran {:?}", elapsed);
    }

    #[test]
    fn control_actions_are_rejected() {
        let mut p = StubPlatform::new();
        let mut ctx = RunContext::default();
        assert!(matches!(dispatch(&Action::Else, &mut p, &mut ctx, &fast()), Err(StepError::Unsupported(_))));
    }
}
