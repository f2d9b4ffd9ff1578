use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cache::LoopCacheManager;
use crate::context::RunContext;
use crate::dispatch::dispatch;
use crate::error::StepError;
use crate::matcher::TemplateMatcher;
use crate::ocr::OcrResolver;
use crate::platform::Platform;
use crate::resolve::{Target, TargetResolver};
use crate::settings::EngineSettings;
use crate::sleep::sleep_interruptible;
use crate::step::{Action, ActionKind, LoopMode, LoopSpec, Step};
use crate::validate::validate;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
    Failed { step: usize, action: String, error: String },
}

impl RunOutcome {
    fn failed(step: usize, action: &str, error: impl ToString) -> Self {
        RunOutcome::Failed { step, action: action.to_string(), error: error.to_string() }
    }
}

/// Block kinds matched by [`find_matching_jump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFamily {
    If,
    Loop,
}

impl BlockFamily {
    fn opens(self, kind: ActionKind) -> bool {
        match self {
            BlockFamily::If => kind.is_if(),
            BlockFamily::Loop => kind == ActionKind::LoopStart,
        }
    }

    fn close(self) -> ActionKind {
        match self {
            BlockFamily::If => ActionKind::EndIf,
            BlockFamily::Loop => ActionKind::EndLoop,
        }
    }
}

/// Scan forward from `from` for the first `targets` step at nesting level
/// zero and return the index after it. Nested blocks of the same family are
/// skipped whole. Returns `steps.len()` when nothing matches.
pub fn find_matching_jump(steps: &[Step], from: usize, family: BlockFamily, targets: &[ActionKind]) -> usize {
    let mut level = 0usize;
    for (i, step) in steps.iter().enumerate().skip(from) {
        let Some(kind) = step.kind() else { continue };
        if family.opens(kind) {
            level += 1;
        } else if kind == family.close() {
            if level == 0 {
                if targets.contains(&kind) {
                    return i + 1;
                }
            } else {
                level -= 1;
            }
        } else if level == 0 && targets.contains(&kind) {
            return i + 1;
        }
    }
    steps.len()
}

#[derive(Debug)]
struct LoopFrame {
    start: usize,
    mode: LoopMode,
    max: u32,
    iteration: u32,
    remaining: i64,
}

fn progress(mode: &LoopMode, iteration: u32, max: u32) -> String {
    match mode {
        LoopMode::Fixed { times } => format!("loop {}/{}", iteration, times),
        _ => format!("iteration {} of max {}", iteration, max),
    }
}

/// Program-counter interpreter for a flat step list with IF/ELSE/LOOP
/// blocks.
pub struct Interpreter<'a> {
    platform: &'a mut dyn Platform,
    resolver: TargetResolver<'a>,
    settings: &'a EngineSettings,
    cache: LoopCacheManager,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        platform: &'a mut dyn Platform,
        matcher: &'a TemplateMatcher,
        ocr: &'a OcrResolver,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            platform,
            resolver: TargetResolver::new(matcher, ocr, settings),
            settings,
            cache: LoopCacheManager::new(),
        }
    }

    pub fn cache(&self) -> &LoopCacheManager {
        &self.cache
    }

    /// Run `steps` to completion, stop request or first failure. Updated
    /// `cache_box` hints are written back into `steps`. Never panics.
    pub fn execute(&mut self, steps: &mut [Step], ctx: &mut RunContext, status: &dyn Fn(&str)) -> RunOutcome {
        for issue in validate(steps) {
            warn!("{}", issue);
        }
        info!("run started ({} steps)", steps.len());
        self.cache.reset();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run(steps, ctx, status)));
        self.cache.reset();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                RunOutcome::failed(0, "", format!("interpreter panicked: {}", msg))
            }
        };
        match &outcome {
            RunOutcome::Completed => info!("run completed"),
            RunOutcome::Stopped => info!("run stopped by request"),
            RunOutcome::Failed { step, action, error } => {
                error!("run failed at step {} ({}): {}", step + 1, action, error)
            }
        }
        info!("{}", ctx.stats);
        outcome
    }

    fn run(&mut self, steps: &mut [Step], ctx: &mut RunContext, status: &dyn Fn(&str)) -> RunOutcome {
        let mut loops: Vec<LoopFrame> = Vec::new();
        let mut pc = 0;

        while pc < steps.len() {
            if ctx.stop_requested() {
                return RunOutcome::Stopped;
            }
            let action = match Action::parse(&steps[pc], self.settings) {
                Ok(a) => a,
                Err(e) => return RunOutcome::failed(pc, &steps[pc].action, e),
            };
            match self.step(steps, pc, &action, &mut loops, ctx, status) {
                Ok(next) => pc = next,
                Err(e) => return RunOutcome::failed(pc, &steps[pc].action, e),
            }
        }
        RunOutcome::Completed
    }

    /// Execute `steps[pc]` and return the next pc.
    fn step(
        &mut self,
        steps: &mut [Step],
        pc: usize,
        action: &Action,
        loops: &mut Vec<LoopFrame>,
        ctx: &mut RunContext,
        status: &dyn Fn(&str),
    ) -> Result<usize, StepError> {
        let next = pc + 1;
        match action {
            Action::FindImage(t) => {
                if !self.find(steps, pc, ActionKind::FindImage, Target::Image(t), ctx)? {
                    return Err(StepError::TargetNotFound(t.path.display().to_string()));
                }
                Ok(next)
            }
            Action::FindText(t) => {
                if !self.find(steps, pc, ActionKind::FindText, Target::Text(t), ctx)? {
                    return Err(StepError::TargetNotFound(t.text.clone()));
                }
                Ok(next)
            }
            Action::IfImageFound(t) => {
                let found = self.find(steps, pc, ActionKind::IfImageFound, Target::Image(t), ctx)?;
                Ok(self.branch(steps, pc, found))
            }
            Action::IfTextFound(t) => {
                let found = self.find(steps, pc, ActionKind::IfTextFound, Target::Text(t), ctx)?;
                Ok(self.branch(steps, pc, found))
            }
            Action::Else => Ok(find_matching_jump(steps, next, BlockFamily::If, &[ActionKind::EndIf])),
            Action::EndIf => Ok(next),
            Action::LoopStart(spec) => Ok(self.loop_start(steps, pc, spec, loops, status)),
            Action::EndLoop => Ok(self.loop_end(pc, loops, ctx, status)),
            other => {
                dispatch(other, self.platform, ctx, self.settings)?;
                Ok(next)
            }
        }
    }

    /// Resolve a target, move the pointer onto it and apply any hint to the
    /// step. Returns whether it was found.
    fn find(
        &mut self,
        steps: &mut [Step],
        pc: usize,
        kind: ActionKind,
        target: Target<'_>,
        ctx: &mut RunContext,
    ) -> Result<bool, StepError> {
        let res = self.resolver.resolve(self.platform, kind, target, &mut self.cache, ctx);
        if let Some(hint) = res.hint {
            steps[pc].apply_cache_hint(hint);
        }
        match res.point {
            Some(p) => {
                self.platform.move_cursor(p, Duration::ZERO)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn branch(&self, steps: &[Step], pc: usize, found: bool) -> usize {
        if found {
            return pc + 1;
        }
        find_matching_jump(steps, pc + 1, BlockFamily::If, &[ActionKind::Else, ActionKind::EndIf])
    }

    fn past_end_loop(steps: &[Step], pc: usize) -> usize {
        find_matching_jump(steps, pc + 1, BlockFamily::Loop, &[ActionKind::EndLoop])
    }

    fn loop_start(
        &mut self,
        steps: &[Step],
        pc: usize,
        spec: &LoopSpec,
        loops: &mut Vec<LoopFrame>,
        status: &dyn Fn(&str),
    ) -> usize {
        let revisit = loops.last().is_some_and(|f| f.start == pc);
        if !revisit {
            if spec.max_iterations == 0 {
                info!("loop at step {} has max_iterations 0, skipping", pc + 1);
                return Self::past_end_loop(steps, pc);
            }
            let remaining = match spec.mode {
                LoopMode::Fixed { times } if times <= 0 => {
                    info!("loop at step {} runs 0 times, skipping", pc + 1);
                    return Self::past_end_loop(steps, pc);
                }
                LoopMode::Fixed { times } => times - 1,
                _ => 0,
            };
            let id = format!("L{}_{}", pc, loops.len());
            self.cache.enter(&id);
            loops.push(LoopFrame {
                start: pc,
                mode: spec.mode.clone(),
                max: spec.max_iterations,
                iteration: 1,
                remaining,
            });
            status(&progress(&spec.mode, 1, spec.max_iterations));
            return pc + 1;
        }

        std::thread::sleep(Duration::from_millis(self.settings.loop_cooldown_ms));
        let Some(frame) = loops.last_mut() else { return pc + 1 };
        let cont = match frame.mode {
            LoopMode::Fixed { .. } if frame.iteration >= frame.max => {
                warn!("loop at step {} hit max_iterations {}", pc + 1, frame.max);
                false
            }
            LoopMode::Fixed { .. } if frame.remaining > 0 => {
                frame.remaining -= 1;
                true
            }
            LoopMode::Fixed { .. } => false,
            _ => true,
        };
        if !cont {
            loops.pop();
            self.cache.exit();
            status("loop finished");
            return Self::past_end_loop(steps, pc);
        }
        frame.iteration += 1;
        status(&progress(&frame.mode, frame.iteration, frame.max));
        pc + 1
    }

    fn loop_end(&mut self, pc: usize, loops: &mut Vec<LoopFrame>, ctx: &mut RunContext, status: &dyn Fn(&str)) -> usize {
        let Some(frame) = loops.last() else {
            warn!("END_LOOP at step {} has no open loop", pc + 1);
            return pc + 1;
        };
        if let LoopMode::Fixed { .. } = frame.mode {
            return frame.start;
        }

        let (start, iteration, max) = (frame.start, frame.iteration, frame.max);
        let mode = frame.mode.clone();
        if self.resolver.condition_met(self.platform, &mode, ctx) {
            info!("loop condition met after {} iterations", iteration);
            status(&format!("condition met, exiting after {} iterations", iteration));
            loops.pop();
            self.cache.exit();
            return pc + 1;
        }
        if iteration >= max {
            warn!("loop condition not met after {} iterations, giving up", max);
            status(&format!("reached max {} iterations, exiting", max));
            loops.pop();
            self.cache.exit();
            return pc + 1;
        }
        let interval = Duration::from_millis(self.settings.loop_check_interval_ms);
        sleep_interruptible(interval, Duration::from_millis(self.settings.wait_increment_ms), &ctx.stop);
        start
    }
}
