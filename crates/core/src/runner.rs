use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context as _};
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::interpreter::{Interpreter, RunOutcome};
use crate::matcher::TemplateMatcher;
use crate::ocr::OcrResolver;
use crate::platform::Platform;
use crate::settings::{EngineSettings, Settings};
use crate::stats::RunStats;
use crate::step::{load_macro, save_macro, Step};
use crate::types::{Command, RunState};

/// Result of one finished run. `steps` carries any updated `cache_box`
/// hints.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub steps: Vec<Step>,
    pub stats: RunStats,
}

/// Runs macros on a worker thread, one at a time.
pub struct Runner {
    platform: Arc<Mutex<Box<dyn Platform>>>,
    matcher: Arc<TemplateMatcher>,
    ocr: Arc<OcrResolver>,
    settings: Arc<EngineSettings>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    status_tx: mpsc::Sender<String>,
    status_rx: mpsc::Receiver<String>,
    worker: Option<JoinHandle<RunReport>>,
}

impl Runner {
    pub fn new(platform: Box<dyn Platform>, settings: &Settings) -> Self {
        Self::with_ocr(platform, OcrResolver::new(&settings.ocr), settings.engine.clone())
    }

    pub fn with_ocr(platform: Box<dyn Platform>, ocr: OcrResolver, settings: EngineSettings) -> Self {
        let (status_tx, status_rx) = mpsc::channel();
        Self {
            platform: Arc::new(Mutex::new(platform)),
            matcher: Arc::new(TemplateMatcher::new(&settings)),
            ocr: Arc::new(ocr),
            settings: Arc::new(settings),
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            status_tx,
            status_rx,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start running a copy of `steps`. Fails if a run is already active.
    /// Returns the report of a finished run nobody collected yet.
    pub fn start(&mut self, steps: &[Step]) -> anyhow::Result<Option<RunReport>> {
        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            bail!("a macro is already running");
        }
        let previous = self.wait();
        self.running.store(true, Ordering::Release);
        self.stop.store(false, Ordering::Release);

        let mut steps = steps.to_vec();
        let platform = self.platform.clone();
        let matcher = self.matcher.clone();
        let ocr = self.ocr.clone();
        let settings = self.settings.clone();
        let running = self.running.clone();
        let stop = self.stop.clone();
        let tx = self.status_tx.clone();

        let spawned = thread::Builder::new().name("replay-run".into()).spawn(move || {
            let mut platform = platform.lock().unwrap_or_else(|e| e.into_inner());
            let mut ctx = RunContext::new(stop);
            let outcome = {
                let mut interp = Interpreter::new(&mut **platform, &matcher, &ocr, &settings);
                interp.execute(&mut steps, &mut ctx, &|msg| {
                    let _ = tx.send(msg.to_string());
                })
            };
            running.store(false, Ordering::Release);
            RunReport { outcome, steps, stats: ctx.stats }
        });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(previous)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e).context("failed to spawn run thread")
            }
        }
    }

    /// Ask the active run to halt at its next check.
    pub fn request_stop(&self) {
        if self.is_running() {
            info!("stop requested");
        }
        self.stop.store(true, Ordering::Release);
    }

    /// Status messages produced since the last call.
    pub fn poll_status(&self) -> Vec<String> {
        self.status_rx.try_iter().collect()
    }

    /// Collect the report of a run that has finished, without blocking.
    pub fn try_finish(&mut self) -> Option<RunReport> {
        if !self.worker.as_ref().is_some_and(|h| h.is_finished()) {
            return None;
        }
        self.wait()
    }

    /// Block until the active run ends and return its report.
    pub fn wait(&mut self) -> Option<RunReport> {
        let handle = self.worker.take()?;
        Some(handle.join().unwrap_or_else(|_| {
            self.running.store(false, Ordering::Release);
            RunReport {
                outcome: RunOutcome::Failed { step: 0, action: String::new(), error: "run thread panicked".into() },
                steps: Vec::new(),
                stats: RunStats::default(),
            }
        }))
    }
}

/// What the UI renders. Written by [`orchestrate`], read by the TUI.
#[derive(Debug, Default)]
pub struct Shared {
    pub state: RunState,
    pub path: Option<PathBuf>,
    pub steps: Vec<Step>,
    /// Latest progress line from the interpreter.
    pub status: String,
    pub outcome: Option<RunOutcome>,
    pub stats: Option<RunStats>,
}

pub type SharedState = Arc<Mutex<Shared>>;

fn lock(shared: &SharedState) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drive `runner` from UI commands until `Quit` or the command channel
/// closes. Runs on a background thread.
pub fn orchestrate(shared: SharedState, mut runner: Runner, cmd_rx: mpsc::Receiver<Command>, persist_hints: bool) {
    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Command::Quit) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                info!("shutting down");
                runner.request_stop();
                runner.wait();
                lock(&shared).state = RunState::Idle;
                return;
            }
            Ok(Command::StartStop) => {
                if runner.is_running() {
                    runner.request_stop();
                    lock(&shared).state = RunState::Stopping;
                } else {
                    // Fold in a run that ended since the last tick so its
                    // hints carry into this one.
                    if let Some(report) = runner.try_finish() {
                        publish_status(&shared, &runner);
                        finish(&shared, report, persist_hints);
                    }
                    let steps = lock(&shared).steps.clone();
                    match runner.start(&steps) {
                        Ok(previous) => {
                            if let Some(report) = previous {
                                finish(&shared, report, persist_hints);
                            }
                            let mut s = lock(&shared);
                            s.state = RunState::Running;
                            s.status.clear();
                            s.outcome = None;
                        }
                        Err(e) => error!("{:#}", e),
                    }
                }
            }
            Ok(Command::Reload) => {
                if runner.is_running() {
                    warn!("cannot reload while a macro is running");
                    continue;
                }
                let path = lock(&shared).path.clone();
                let Some(path) = path else {
                    warn!("no macro file loaded");
                    continue;
                };
                match load_macro(&path) {
                    Ok(steps) => {
                        info!("reloaded {} ({} steps)", path.display(), steps.len());
                        let mut s = lock(&shared);
                        s.steps = steps;
                        s.outcome = None;
                    }
                    Err(e) => error!("{:#}", e),
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        publish_status(&shared, &runner);

        if let Some(report) = runner.try_finish() {
            publish_status(&shared, &runner);
            finish(&shared, report, persist_hints);
        }
    }
}

/// Record a finished run and adopt its updated hints.
fn finish(shared: &SharedState, report: RunReport, persist_hints: bool) {
    let mut s = lock(shared);
    s.state = RunState::Idle;
    s.outcome = Some(report.outcome);
    s.stats = Some(report.stats);
    if report.steps != s.steps && !report.steps.is_empty() {
        s.steps = report.steps;
        if persist_hints {
            if let Some(path) = &s.path {
                match save_macro(path, &s.steps) {
                    Ok(()) => info!("saved updated hints to {}", path.display()),
                    Err(e) => error!("{:#}", e),
                }
            }
        }
    }
}

fn publish_status(shared: &SharedState, runner: &Runner) {
    if let Some(last) = runner.poll_status().pop() {
        lock(shared).status = last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::StubPlatform;
    use crate::step::ActionKind;
    use crate::types::{MouseButton, Point};
    use serde_json::json;
    use std::time::Instant;

    fn fast() -> EngineSettings {
        EngineSettings { loop_cooldown_ms: 0, wait_increment_ms: 10, ..Default::default() }
    }

    fn runner(p: StubPlatform) -> Runner {
        Runner::with_ocr(Box::new(p), OcrResolver::with_backends(Vec::new()), fast())
    }

    fn clicks_in_loop(times: i64) -> Vec<Step> {
        vec![
            Step::new(ActionKind::LoopStart, json!({"times": times})),
            Step::new(ActionKind::Click, json!({"x": 10, "y": 10})),
            Step::new(ActionKind::EndLoop, json!({})),
        ]
    }

    #[test]
    fn runs_on_worker_and_reports() {
        let p = StubPlatform::new();
        let log = p.events();
        let mut r = runner(p);
        r.start(&clicks_in_loop(3)).unwrap();
        let report = r.wait().unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(log.clicks(), vec![(Point::new(10, 10), MouseButton::Left); 3]);
        assert!(!r.is_running());
        let status = r.poll_status();
        assert_eq!(status.first().map(String::as_str), Some("loop 1/3"));
    }

    #[test]
    fn second_start_is_rejected_while_running() {
        let mut r = runner(StubPlatform::new());
        let steps = vec![Step::new(ActionKind::Wait, json!({"ms": 2000}))];
        r.start(&steps).unwrap();
        assert!(r.start(&steps).is_err());
        r.request_stop();
        let report = r.wait().unwrap();
        assert_eq!(report.outcome, RunOutcome::Stopped);
        // The flag is cleared for the next run.
        r.start(&clicks_in_loop(1)).unwrap();
        assert_eq!(r.wait().unwrap().outcome, RunOutcome::Completed);
    }

    #[test]
    fn uncollected_report_is_handed_back_on_restart() {
        let mut r = runner(StubPlatform::new());
        assert!(r.start(&clicks_in_loop(2)).unwrap().is_none());
        let deadline = Instant::now() + Duration::from_secs(5);
        while r.is_running() {
            assert!(Instant::now() < deadline, "run never finished");
            thread::sleep(Duration::from_millis(5));
        }
        let previous = r.start(&clicks_in_loop(1)).unwrap().expect("previous report");
        assert_eq!(previous.outcome, RunOutcome::Completed);
        assert_eq!(previous.stats, RunStats::default());
        assert_eq!(r.wait().unwrap().outcome, RunOutcome::Completed);
        assert!(r.wait().is_none());
    }

    #[test]
    fn orchestrate_runs_and_quits() {
        let p = StubPlatform::new();
        let log = p.events();
        let shared: SharedState = Arc::new(Mutex::new(Shared { steps: clicks_in_loop(2), ..Default::default() }));
        let (tx, rx) = mpsc::channel();
        let s = shared.clone();
        let r = runner(p);
        let t = thread::spawn(move || orchestrate(s, r, rx, false));

        tx.send(Command::StartStop).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let s = shared.lock().unwrap();
                if s.outcome.is_some() {
                    assert_eq!(s.outcome, Some(RunOutcome::Completed));
                    assert_eq!(s.state, RunState::Idle);
                    assert_eq!(s.status, "loop finished");
                    break;
                }
            }
            assert!(Instant::now() < deadline, "run never finished");
            thread::sleep(Duration::from_millis(20));
        }
        tx.send(Command::Quit).unwrap();
        t.join().unwrap();
        assert_eq!(log.clicks().len(), 2);
    }

    #[test]
    fn reload_reads_macro_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        save_macro(&path, &clicks_in_loop(4)).unwrap();

        let shared: SharedState = Arc::new(Mutex::new(Shared { path: Some(path), ..Default::default() }));
        let (tx, rx) = mpsc::channel();
        let s = shared.clone();
        let r = runner(StubPlatform::new());
        let t = thread::spawn(move || orchestrate(s, r, rx, false));
        tx.send(Command::Reload).unwrap();
        drop(tx);
        t.join().unwrap();
        assert_eq!(shared.lock().unwrap().steps.len(), 3);
    }
}
