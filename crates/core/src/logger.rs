use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{mpsc, Mutex, OnceLock};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();

struct Sink {
    file: File,
    tui_tx: Option<mpsc::Sender<String>>,
    prefixes: HashMap<String, u8>, // prefix -> color index
}

// Color indices for TUI rendering (mapped in ui.rs)
pub const COLOR_GRAY: u8 = 1;
pub const COLOR_BLUE: u8 = 2;
pub const COLOR_YELLOW: u8 = 3;

/// Install the global subscriber. Clears the log file.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init(log_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_dir.join("app.log"))?;

    SINK.set(Mutex::new(Sink { file, tui_tx: None, prefixes: HashMap::new() }))
        .map_err(|_| anyhow::anyhow!("logger already initialized"))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(SinkLayer)
        .try_init()?;
    Ok(())
}

/// Wire the TUI log channel.
pub fn set_tui_sender(tx: mpsc::Sender<String>) {
    if let Some(sink) = SINK.get() {
        if let Ok(mut s) = sink.lock() {
            s.tui_tx = Some(tx);
        }
    }
}

/// Drop the TUI channel (terminal restored, logs go to file only).
pub fn clear_tui_sender() {
    if let Some(sink) = SINK.get() {
        if let Ok(mut s) = sink.lock() {
            s.tui_tx = None;
        }
    }
}

/// Register a color for events whose target ends in `prefix`.
pub fn register_prefix(prefix: &str, color: u8) {
    if let Some(sink) = SINK.get() {
        if let Ok(mut s) = sink.lock() {
            s.prefixes.insert(prefix.to_string(), color);
        }
    }
}

/// `replay_core::interpreter` -> `interpreter`
pub fn prefix_of(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

/// Plain-text line for the log file.
fn file_line(ts: &str, level: &str, prefix: &str, msg: &str) -> String {
    if prefix.is_empty() {
        format!("[{}] [{}] {}", ts, level, msg)
    } else {
        format!("[{}] [{}] [{}] {}", ts, level, prefix, msg)
    }
}

/// TUI record, fields separated by \x1f:
/// level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage
fn tui_line(ts: &str, level: &str, prefix: &str, color: u8, msg: &str) -> String {
    format!("{}\x1f{}\x1f{}\x1f{}\x1f{}", level, prefix, color, ts, msg)
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

struct SinkLayer;

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(sink) = SINK.get() else { return };
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let msg = format!("{}{}", visitor.message, visitor.fields);

        let ts = Local::now().format("%H:%M:%S").to_string();
        let level = meta.level().as_str();
        let prefix = prefix_of(meta.target());

        let Ok(mut s) = sink.lock() else { return };
        let color = s.prefixes.get(prefix).copied().unwrap_or(0);
        writeln!(s.file, "{}", file_line(&ts, level, prefix, &msg)).ok();
        if let Some(tx) = &s.tui_tx {
            tx.send(tui_line(&ts, level, prefix, color, &msg)).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_last_target_segment() {
        assert_eq!(prefix_of("replay_core::ocr::tesseract"), "tesseract");
        assert_eq!(prefix_of("stub"), "stub");
    }

    #[test]
    fn record_layout() {
        assert_eq!(file_line("10:00:00", "WARN", "", "x"), "[10:00:00] [WARN] x");
        assert_eq!(file_line("10:00:00", "INFO", "stub", "x"), "[10:00:00] [INFO] [stub] x");
        let parts: Vec<_> = tui_line("10:00:00", "INFO", "stub", COLOR_GRAY, "hi").split('\x1f').map(String::from).collect();
        assert_eq!(parts, vec!["INFO", "stub", "1", "10:00:00", "hi"]);
    }
}
