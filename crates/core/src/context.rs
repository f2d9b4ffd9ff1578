use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::stats::RunStats;
use crate::types::Point;

/// Mutable state of one macro run. Created fresh per run.
#[derive(Debug, Default)]
pub struct RunContext {
    pub last_position: Option<Point>,
    /// Set from other threads; polled by the interpreter.
    pub stop: Arc<AtomicBool>,
    /// Last text captured by a FIND_TEXT with `save_to_clipboard`.
    pub clipboard_var: String,
    pub stats: RunStats,
}

impl RunContext {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self { stop, ..Default::default() }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}
