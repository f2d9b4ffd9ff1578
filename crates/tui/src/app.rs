use std::sync::{mpsc, MutexGuard};

use replay_core::runner::{Shared, SharedState};
use replay_core::types::{Command, RunState};

use crate::confirm::ConfirmDialog;

const MAX_LOG_LINES: usize = 5000;

pub struct App {
    pub shared: SharedState,
    pub selected: usize,
    pub log_visible: bool,
    pub log_messages: Vec<String>,
    pub log_scroll: usize, // scroll offset from bottom (0 = latest)
    pub log_rx: mpsc::Receiver<String>,
    pub cmd_tx: mpsc::Sender<Command>,
    pub confirm: Option<ConfirmDialog>,
    pub skip_confirm: bool,
    pub should_quit: bool,
}

impl App {
    pub fn new(
        shared: SharedState,
        log_rx: mpsc::Receiver<String>,
        cmd_tx: mpsc::Sender<Command>,
        skip_confirm: bool,
    ) -> Self {
        Self {
            shared,
            selected: 0,
            log_visible: true,
            log_messages: Vec::new(),
            log_scroll: 0,
            log_rx,
            cmd_tx,
            confirm: None,
            skip_confirm,
            should_quit: false,
        }
    }

    pub fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run_state(&self) -> RunState {
        self.shared().state
    }

    pub fn drain_logs(&mut self) {
        let mut added = 0;
        while let Ok(msg) = self.log_rx.try_recv() {
            self.log_messages.push(msg);
            added += 1;
        }
        // Keep the view anchored when scrolled back.
        if self.log_scroll > 0 {
            self.log_scroll += added;
        }
        if self.log_messages.len() > MAX_LOG_LINES {
            let excess = self.log_messages.len() - MAX_LOG_LINES;
            self.log_messages.drain(..excess);
        }
    }

    pub fn scroll_log_up(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_add(n);
    }

    pub fn scroll_log_down(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(n);
    }

    pub fn move_up(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    pub fn move_down(&mut self) {
        let len = self.shared().steps.len();
        if self.selected + 1 < len {
            self.selected += 1;
        }
    }

    pub fn toggle_log(&mut self) {
        self.log_visible = !self.log_visible;
    }

    /// `s` key: stop a running macro at once, or ask before starting one.
    pub fn start_stop(&mut self) {
        let (state, steps) = {
            let s = self.shared();
            (s.state, s.steps.len())
        };
        match state {
            RunState::Running => self.send(Command::StartStop),
            RunState::Stopping => {}
            RunState::Idle if steps == 0 => {}
            RunState::Idle if self.skip_confirm => self.send(Command::StartStop),
            RunState::Idle => {
                let name = self
                    .shared()
                    .path
                    .as_ref()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "macro".into());
                self.confirm = Some(ConfirmDialog::new("Run macro?", format!("{} ({} steps)", name, steps)));
            }
        }
    }

    /// Global hotkey: toggle without confirmation.
    pub fn hotkey_toggle(&mut self) {
        if self.run_state() != RunState::Stopping {
            self.send(Command::StartStop);
        }
    }

    pub fn confirm_toggle(&mut self) {
        if let Some(c) = self.confirm.as_mut() {
            c.toggle();
        }
    }

    /// Close the dialog, starting the run if `accept`.
    pub fn confirm_close(&mut self, accept: bool) {
        if self.confirm.take().is_some() && accept {
            self.send(Command::StartStop);
        }
    }

    pub fn reload(&mut self) {
        self.send(Command::Reload);
        self.selected = 0;
    }

    pub fn quit(&mut self) {
        self.send(Command::Quit);
        self.should_quit = true;
    }

    fn send(&self, cmd: Command) {
        self.cmd_tx.send(cmd).ok();
    }
}
