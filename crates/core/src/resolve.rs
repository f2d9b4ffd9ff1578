use std::path::Path;
use std::time::Instant;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::cache::LoopCacheManager;
use crate::context::RunContext;
use crate::matcher::{ImageMatch, TemplateMatcher};
use crate::ocr::{EngineChoice, Lang, OcrResolver, TextMatch};
use crate::platform::Platform;
use crate::settings::EngineSettings;
use crate::step::{is_usable_box, ActionKind, CacheHint, ImageTarget, LoopMode, TextTarget};
use crate::types::{CaptureRect, Point, Screenshot};

/// Half extents of the crop OCR'd around a cached text location.
const TEXT_CHECK_HALF_W: i32 = 160;
const TEXT_CHECK_HALF_H: i32 = 60;

/// Half extents of the hint box written after a global fallback hit.
const HINT_HALF_W: i32 = 20;
const HINT_HALF_H: i32 = 10;

#[derive(Debug, Clone, Copy)]
pub enum Target<'t> {
    Image(&'t ImageTarget),
    Text(&'t TextTarget),
}

impl Target<'_> {
    fn is_text(&self) -> bool {
        matches!(self, Target::Text(_))
    }

    fn cache_box(&self) -> Option<[i32; 4]> {
        match self {
            Target::Image(t) => t.cache_box,
            Target::Text(t) => t.cache_box,
        }
    }

    fn describe(&self) -> String {
        match self {
            Target::Image(t) => t.path.display().to_string(),
            Target::Text(t) => t.text.clone(),
        }
    }
}

/// Loop-cache key: the action name plus the image path or target text.
pub fn signature(kind: ActionKind, target: Target<'_>) -> String {
    format!("{}_{}", kind, target.describe())
}

/// Outcome of one lookup. `hint` is an update the caller should apply to the
/// step's persisted `cache_box`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resolution {
    pub point: Option<Point>,
    pub hint: Option<CacheHint>,
}

/// Finds images and text on screen for FIND/IF steps and loop conditions.
pub struct TargetResolver<'a> {
    matcher: &'a TemplateMatcher,
    ocr: &'a OcrResolver,
    settings: &'a EngineSettings,
}

impl<'a> TargetResolver<'a> {
    pub fn new(matcher: &'a TemplateMatcher, ocr: &'a OcrResolver, settings: &'a EngineSettings) -> Self {
        Self { matcher, ocr, settings }
    }

    /// Region search from the step's hint, loop-cache verification, full
    /// search and global fallback, in that order. A hit updates
    /// `ctx.last_position` and the current loop's cache.
    pub fn resolve(
        &self,
        platform: &mut dyn Platform,
        kind: ActionKind,
        target: Target<'_>,
        cache: &mut LoopCacheManager,
        ctx: &mut RunContext,
    ) -> Resolution {
        let t0 = Instant::now();
        let is_text = target.is_text();
        let mut hint = None;
        // Set when the hint cannot be captured; a full-screen hit replaces it.
        let mut stale = false;

        let mut region = match target.cache_box() {
            Some(b) if is_usable_box(&b) => match self.padded(b) {
                Some(r) => Some(r),
                None => {
                    debug!("cache_box {:?} lies off screen, searching full screen", b);
                    stale = true;
                    None
                }
            },
            Some(b) => {
                debug!("dropping empty cache_box {:?}", b);
                hint = Some(CacheHint::Clear);
                None
            }
            None => None,
        };

        let shot = match platform.capture(region) {
            Ok(s) => s,
            Err(e) if region.is_some() => {
                warn!("region capture failed, using full screen: {:#}", e);
                region = None;
                stale = true;
                match platform.capture(None) {
                    Ok(s) => s,
                    Err(e) => return self.capture_failed(e, is_text, t0, hint, ctx),
                }
            }
            Err(e) => return self.capture_failed(e, is_text, t0, hint, ctx),
        };

        let sig = signature(kind, target);
        if let Some(cached) = cache.get(&sig) {
            if let Some(p) = self.verify_cached(platform, target, &shot, cached, ctx) {
                info!("loop cache hit for {} at {}", sig, p);
                ctx.stats.record_cache_hit(is_text);
                ctx.stats.record_lookup(is_text, true, t0.elapsed());
                cache.set(&sig, p);
                ctx.last_position = Some(p);
                return Resolution { point: Some(p), hint };
            }
            debug!("cached {} for {} no longer matches", cached, sig);
        }

        let mut found = self.search(platform, target, &shot, ctx);
        if stale {
            hint = found.map(hint_around).or(hint);
        }
        if found.is_none() && region.is_some() && self.settings.enable_global_fallback {
            info!("{} not in hinted region, searching full screen", target.describe());
            match platform.capture(None) {
                Ok(full) => {
                    found = self.search(platform, target, &full, ctx);
                    if let Some(p) = found {
                        hint = Some(hint_around(p));
                    }
                }
                Err(e) => warn!("full screen capture failed: {:#}", e),
            }
        }

        ctx.stats.record_lookup(is_text, found.is_some(), t0.elapsed());
        if let Some(p) = found {
            cache.set(&sig, p);
            ctx.last_position = Some(p);
        }
        Resolution { point: found, hint }
    }

    /// Evaluate a loop exit condition on a fresh full-screen capture. The
    /// loop cache is never consulted here.
    pub fn condition_met(&self, platform: &mut dyn Platform, mode: &LoopMode, ctx: &mut RunContext) -> bool {
        let shot = match platform.capture(None) {
            Ok(s) => s,
            Err(e) => {
                warn!("condition capture failed: {:#}", e);
                return false;
            }
        };
        match mode {
            LoopMode::Fixed { .. } => true,
            LoopMode::UntilImage { condition_image, confidence } => {
                self.matcher.find(condition_image, *confidence, &shot).is_some()
            }
            LoopMode::UntilText { condition_text, lang } => self
                .ocr
                .find(condition_text, *lang, &shot, EngineChoice::Auto, &mut ctx.stats)
                .is_some(),
        }
    }

    /// One full-screen image lookup with no side effects.
    pub fn locate_image(
        &self,
        platform: &mut dyn Platform,
        path: &Path,
        confidence: f32,
    ) -> anyhow::Result<Option<ImageMatch>> {
        let shot = platform.capture(None)?;
        Ok(self.matcher.find(path, confidence, &shot))
    }

    /// One full-screen text lookup with no side effects beyond `ctx.stats`.
    pub fn locate_text(
        &self,
        platform: &mut dyn Platform,
        text: &str,
        lang: Lang,
        engine: EngineChoice,
        ctx: &mut RunContext,
    ) -> anyhow::Result<Option<TextMatch>> {
        let shot = platform.capture(None)?;
        Ok(self.ocr.find(text, lang, &shot, engine, &mut ctx.stats))
    }

    /// Capture region for a hint, clamped to the screen origin. `None` when
    /// nothing of the padded box is left, e.g. a box from a monitor at
    /// negative coordinates.
    fn padded(&self, b: [i32; 4]) -> Option<CaptureRect> {
        let pad = self.settings.cache_box_padding.max(0);
        let l = b[0].saturating_sub(pad).max(0);
        let t = b[1].saturating_sub(pad).max(0);
        let w = u32::try_from(b[2].saturating_add(pad) - l).ok().filter(|w| *w > 0)?;
        let h = u32::try_from(b[3].saturating_add(pad) - t).ok().filter(|h| *h > 0)?;
        Some(CaptureRect { l, t, w, h })
    }

    fn capture_failed(
        &self,
        e: anyhow::Error,
        is_text: bool,
        t0: Instant,
        hint: Option<CacheHint>,
        ctx: &mut RunContext,
    ) -> Resolution {
        warn!("screen capture failed: {:#}", e);
        ctx.stats.record_lookup(is_text, false, t0.elapsed());
        Resolution { point: None, hint }
    }

    fn search(
        &self,
        platform: &mut dyn Platform,
        target: Target<'_>,
        shot: &Screenshot,
        ctx: &mut RunContext,
    ) -> Option<Point> {
        match target {
            Target::Image(t) => {
                let m = self.matcher.find(&t.path, t.confidence, shot)?;
                info!("found {} at {} (score {:.3})", t.path.display(), m.center, m.score);
                Some(m.center)
            }
            Target::Text(t) => {
                let m = self.ocr.find(&t.text, t.lang, shot, t.engine, &mut ctx.stats)?;
                self.keep_text(platform, t, &m, ctx);
                Some(m.point)
            }
        }
    }

    fn verify_cached(
        &self,
        platform: &mut dyn Platform,
        target: Target<'_>,
        shot: &Screenshot,
        cached: Point,
        ctx: &mut RunContext,
    ) -> Option<Point> {
        match target {
            Target::Image(t) => self.matcher.verify_at(&t.path, t.confidence, shot, cached).then_some(cached),
            Target::Text(t) => {
                // Crop coordinates are relative to the capture.
                let x = cached.x - shot.offset.x;
                let y = cached.y - shot.offset.y;
                let crop = shot.crop(
                    x - TEXT_CHECK_HALF_W,
                    y - TEXT_CHECK_HALF_H,
                    x + TEXT_CHECK_HALF_W,
                    y + TEXT_CHECK_HALF_H,
                )?;
                let m = self.ocr.find(&t.text, t.lang, &crop, t.engine, &mut ctx.stats)?;
                self.keep_text(platform, t, &m, ctx);
                Some(m.point)
            }
        }
    }

    fn keep_text(&self, platform: &mut dyn Platform, t: &TextTarget, m: &TextMatch, ctx: &mut RunContext) {
        if !t.save_to_clipboard {
            return;
        }
        let text = extract(&m.full_text, t.extract_pattern.as_deref());
        info!("saving '{}' to clipboard", text);
        if let Err(e) = platform.set_clipboard(&text) {
            warn!("clipboard write failed: {:#}", e);
        }
        ctx.clipboard_var = text;
    }
}

/// Fresh hint of the fallback size centered on `p`.
fn hint_around(p: Point) -> CacheHint {
    CacheHint::Set([p.x - HINT_HALF_W, p.y - HINT_HALF_H, p.x + HINT_HALF_W, p.y + HINT_HALF_H])
}

/// First match of `pattern` in `full`, or `full` itself when the pattern is
/// absent, invalid or does not match.
pub fn extract(full: &str, pattern: Option<&str>) -> String {
    let Some(pattern) = pattern else { return full.to_string() };
    match Regex::new(pattern) {
        Ok(re) => match re.find(full) {
            Some(m) => m.as_str().to_string(),
            None => {
                debug!("pattern '{}' did not match, keeping full text", pattern);
                full.to_string()
            }
        },
        Err(e) => {
            warn!("invalid extract_pattern '{}': {}", pattern, e);
            full.to_string()
        }
    }
}
