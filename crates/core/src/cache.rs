use std::collections::HashMap;

use crate::types::Point;

/// Per-loop location cache. Each active loop owns one namespace; only the
/// innermost loop's namespace is visible.
#[derive(Debug, Default)]
pub struct LoopCacheManager {
    stack: Vec<String>,
    caches: HashMap<String, HashMap<String, Point>>,
}

impl LoopCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, loop_id: &str) {
        self.stack.push(loop_id.to_string());
        self.caches.entry(loop_id.to_string()).or_default();
    }

    /// Leave the innermost loop and drop everything it cached.
    pub fn exit(&mut self) {
        if let Some(id) = self.stack.pop() {
            self.caches.remove(&id);
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    pub fn get(&self, signature: &str) -> Option<Point> {
        let id = self.current()?;
        self.caches.get(id)?.get(signature).copied()
    }

    /// No-op outside loops.
    pub fn set(&mut self, signature: &str, at: Point) {
        let Some(id) = self.stack.last() else { return };
        self.caches.entry(id.clone()).or_default().insert(signature.to_string(), at);
    }

    pub fn reset(&mut self) {
        self.stack.clear();
        self.caches.clear();
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// No active loop and no cached entries.
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty() && self.caches.is_empty()
    }
}
