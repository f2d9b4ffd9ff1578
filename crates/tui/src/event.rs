use std::io;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, MouseEventKind};
use ratatui::{backend::CrosstermBackend, Terminal};
use replay_core::platform::hotkey;
use replay_core::types::RunState;

use crate::ui;
use crate::App;

pub fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    hotkey_flag: &AtomicBool,
) -> anyhow::Result<()> {
    loop {
        if app.should_quit {
            return Ok(());
        }

        app.drain_logs();

        if hotkey::take_press(hotkey_flag) {
            let was_running = app.run_state() == RunState::Running;
            app.hotkey_toggle();
            if was_running {
                hotkey::activate_terminal();
            }
        }

        terminal.draw(|f| ui::draw(f, app))?;

        // 100ms poll keeps the hotkey and log panel responsive
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                if app.confirm.is_some() {
                    match key.code {
                        KeyCode::Left | KeyCode::Right | KeyCode::Tab => app.confirm_toggle(),
                        KeyCode::Char('y') | KeyCode::Char('Y') => app.confirm_close(true),
                        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => app.confirm_close(false),
                        KeyCode::Enter => {
                            let yes = app.confirm.as_ref().is_some_and(|c| c.yes);
                            app.confirm_close(yes);
                        }
                        _ => {}
                    }
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Char('Q') => app.quit(),
                    KeyCode::Up | KeyCode::Char('k') | KeyCode::Char('K') => app.move_up(),
                    KeyCode::Down | KeyCode::Char('j') | KeyCode::Char('J') => app.move_down(),
                    KeyCode::Char('s') | KeyCode::Char('S') => app.start_stop(),
                    KeyCode::Char('r') | KeyCode::Char('R') => app.reload(),
                    KeyCode::Char('l') | KeyCode::Char('L') => app.toggle_log(),
                    KeyCode::PageUp => app.scroll_log_up(10),
                    KeyCode::PageDown => app.scroll_log_down(10),
                    _ => {}
                }
            }
            Event::Mouse(mouse) => match mouse.kind {
                MouseEventKind::ScrollUp => app.scroll_log_up(3),
                MouseEventKind::ScrollDown => app.scroll_log_down(3),
                _ => {}
            },
            _ => {}
        }
    }
}
