use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Context as _;
use image::imageops::{self, FilterType};
use image::GrayImage;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::settings::EngineSettings;
use crate::types::{Point, Screenshot};

// Screens at least this large are searched coarse-to-fine.
const PYRAMID_MIN_PIXELS: u64 = 250_000;
const PYRAMID_MIN_TEMPLATE: u32 = 24;
const COARSE_CANDIDATES: usize = 4;
// Per-pixel variance below this counts as a flat patch.
const FLAT_VARIANCE: f64 = 1e-6;
const QUICK_CHECK_MARGIN: i32 = 15;

fn match_pool(threads: usize) -> Option<Arc<ThreadPool>> {
    if threads == 0 {
        return None;
    }
    match ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("replay-match-{}", i))
        .build()
    {
        Ok(pool) => Some(Arc::new(pool)),
        Err(e) => {
            warn!("match pool unavailable, using the global pool: {}", e);
            None
        }
    }
}

/// Best correlation peak: top-left of the matched window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

impl Peak {
    fn beats(&self, other: &Peak) -> bool {
        self.score > other.score
            || (self.score == other.score && (self.y, self.x) < (other.y, other.x))
    }
}

fn better(a: Option<Peak>, b: Option<Peak>) -> Option<Peak> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.beats(&a) { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Summed-area tables of pixel values and their squares.
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];
        let raw = img.as_raw();
        for y in 0..h {
            let (mut rs, mut rq) = (0.0, 0.0);
            for x in 0..w {
                let v = raw[y * w + x] as f64;
                rs += v;
                rq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + rs;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + rq;
            }
        }
        Self { stride, sum, sq }
    }

    fn rect(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.stride;
        table[(y + h) * s + x + w] - table[y * s + x + w] - table[(y + h) * s + x] + table[y * s + x]
    }
}

/// Mean-centred template.
struct Prepared {
    w: usize,
    h: usize,
    centered: Vec<f32>,
    norm: f64,
    flat: bool,
}

impl Prepared {
    fn new(t: &GrayImage) -> Self {
        let (w, h) = (t.width() as usize, t.height() as usize);
        let n = (w * h) as f64;
        let mean = t.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n;
        let centered: Vec<f32> = t.as_raw().iter().map(|&v| (v as f64 - mean) as f32).collect();
        let ss: f64 = centered.iter().map(|&c| (c as f64) * (c as f64)).sum();
        Self { w, h, centered, norm: ss.sqrt(), flat: ss / n < FLAT_VARIANCE }
    }
}

/// Normalized correlation coefficient of the template at (x, y).
fn score_at(img: &GrayImage, integ: &Integral, t: &Prepared, x: usize, y: usize) -> f32 {
    let n = (t.w * t.h) as f64;
    let s = integ.rect(&integ.sum, x, y, t.w, t.h);
    let q = integ.rect(&integ.sq, x, y, t.w, t.h);
    let var = (q - s * s / n).max(0.0);
    let window_flat = var / n < FLAT_VARIANCE;
    if t.flat || window_flat {
        return if t.flat && window_flat { 1.0 } else { 0.0 };
    }

    let iw = img.width() as usize;
    let raw = img.as_raw();
    let mut cross = 0.0f64;
    for ty in 0..t.h {
        let start = (y + ty) * iw + x;
        let row = &raw[start..start + t.w];
        let trow = &t.centered[ty * t.w..(ty + 1) * t.w];
        cross += row.iter().zip(trow).map(|(&a, &b)| a as f32 * b).sum::<f32>() as f64;
    }
    (cross / (var.sqrt() * t.norm)).clamp(-1.0, 1.0) as f32
}

/// Exhaustive search over top-left positions in `xs` x `ys` (inclusive bounds).
fn best_in(
    img: &GrayImage,
    integ: &Integral,
    t: &Prepared,
    (x0, x1): (usize, usize),
    (y0, y1): (usize, usize),
) -> Option<Peak> {
    (y0..=y1)
        .into_par_iter()
        .map(|y| {
            (x0..=x1).fold(None, |best, x| {
                let p = Peak { x: x as u32, y: y as u32, score: score_at(img, integ, t, x, y) };
                better(best, Some(p))
            })
        })
        .reduce(|| None, better)
}

fn score_map(img: &GrayImage, tpl: &GrayImage) -> (Vec<f32>, usize, usize) {
    let integ = Integral::new(img);
    let t = Prepared::new(tpl);
    let rw = img.width() as usize - t.w + 1;
    let rh = img.height() as usize - t.h + 1;
    let rows: Vec<Vec<f32>> = (0..rh)
        .into_par_iter()
        .map(|y| (0..rw).map(|x| score_at(img, &integ, &t, x, y)).collect())
        .collect();
    (rows.concat(), rw, rh)
}

/// Locate `tpl` in `img`. `None` when the template does not fit.
pub fn match_template(img: &GrayImage, tpl: &GrayImage) -> Option<Peak> {
    let (iw, ih) = img.dimensions();
    let (tw, th) = tpl.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }
    let big_screen = iw as u64 * ih as u64 >= PYRAMID_MIN_PIXELS;
    if big_screen && tw.min(th) >= PYRAMID_MIN_TEMPLATE {
        let factor = if tw.min(th) >= 64 { 4 } else { 2 };
        return match_pyramid(img, tpl, factor);
    }
    let integ = Integral::new(img);
    let t = Prepared::new(tpl);
    best_in(img, &integ, &t, (0, (iw - tw) as usize), (0, (ih - th) as usize))
}

/// Correlate downsampled copies, then refine the strongest few peaks at full
/// resolution within +/- 2 coarse pixels.
fn match_pyramid(img: &GrayImage, tpl: &GrayImage, factor: u32) -> Option<Peak> {
    let small_img = imageops::resize(img, img.width() / factor, img.height() / factor, FilterType::Triangle);
    let small_tpl = imageops::resize(tpl, tpl.width() / factor, tpl.height() / factor, FilterType::Triangle);
    let (map, rw, _) = score_map(&small_img, &small_tpl);

    let mut order: Vec<usize> = (0..map.len()).collect();
    order.sort_by(|&a, &b| map[b].total_cmp(&map[a]));
    let radius = (small_tpl.width().max(small_tpl.height()) / 2).max(1) as i64;
    let mut picks: Vec<(usize, usize)> = Vec::with_capacity(COARSE_CANDIDATES);
    for idx in order {
        let (cx, cy) = (idx % rw, idx / rw);
        let clear = picks.iter().all(|&(px, py)| {
            (px as i64 - cx as i64).abs() > radius || (py as i64 - cy as i64).abs() > radius
        });
        if clear {
            picks.push((cx, cy));
            if picks.len() == COARSE_CANDIDATES {
                break;
            }
        }
    }

    let integ = Integral::new(img);
    let t = Prepared::new(tpl);
    let max_x = (img.width() - tpl.width()) as i64;
    let max_y = (img.height() - tpl.height()) as i64;
    let span = 2 * factor as i64;
    picks
        .into_iter()
        .map(|(cx, cy)| {
            let (fx, fy) = (cx as i64 * factor as i64, cy as i64 * factor as i64);
            let xs = ((fx - span).clamp(0, max_x) as usize, (fx + span).clamp(0, max_x) as usize);
            let ys = ((fy - span).clamp(0, max_y) as usize, (fy + span).clamp(0, max_y) as usize);
            best_in(img, &integ, &t, xs, ys)
        })
        .fold(None, better)
}

/// Bounded FIFO of decoded, rescaled templates keyed by (path, scale).
pub struct TemplateCache {
    capacity: usize,
    map: HashMap<(PathBuf, u32), Arc<GrayImage>>,
    order: VecDeque<(PathBuf, u32)>,
}

impl TemplateCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), map: HashMap::new(), order: VecDeque::new() }
    }

    pub fn global() -> &'static Mutex<TemplateCache> {
        static CACHE: OnceLock<Mutex<TemplateCache>> = OnceLock::new();
        CACHE.get_or_init(|| Mutex::new(TemplateCache::new(500)))
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, path: &Path, scale: f32) -> Option<Arc<GrayImage>> {
        self.map.get(&(path.to_path_buf(), scale_key(scale))).cloned()
    }

    pub fn insert(&mut self, path: &Path, scale: f32, img: Arc<GrayImage>) {
        let key = (path.to_path_buf(), scale_key(scale));
        if self.map.insert(key.clone(), img).is_none() {
            self.order.push_back(key);
        }
        self.evict();
    }

    fn evict(&mut self) {
        while self.map.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.map.remove(&old);
                }
                None => break,
            }
        }
    }
}

fn scale_key(scale: f32) -> u32 {
    (scale * 1000.0).round() as u32
}

/// Decode `path` as grayscale and rescale it, going through the global cache.
pub fn load_template(path: &Path, scale: f32) -> anyhow::Result<Arc<GrayImage>> {
    let cache = TemplateCache::global();
    if let Some(hit) = cache.lock().unwrap_or_else(|e| e.into_inner()).get(path, scale) {
        return Ok(hit);
    }
    let base = image::open(path)
        .with_context(|| format!("cannot read template {}", path.display()))?
        .to_luma8();
    let img = if (scale - 1.0).abs() < f32::EPSILON {
        base
    } else {
        let w = ((base.width() as f32 * scale).round() as u32).max(1);
        let h = ((base.height() as f32 * scale).round() as u32).max(1);
        imageops::resize(&base, w, h, FilterType::Triangle)
    };
    let img = Arc::new(img);
    cache.lock().unwrap_or_else(|e| e.into_inner()).insert(path, scale, img.clone());
    Ok(img)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageMatch {
    pub center: Point,
    pub width: u32,
    pub height: u32,
    pub score: f32,
}

/// Multi-scale template search over screenshots.
///
/// Correlation runs on a private pool of `match_threads` workers (one by
/// default, so a lookup never fans out); `0` uses rayon's global pool.
#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    scales: Vec<f32>,
    quick_scales: Vec<f32>,
    early_exit: f32,
    pool: Option<Arc<ThreadPool>>,
}

impl TemplateMatcher {
    pub fn new(settings: &EngineSettings) -> Self {
        TemplateCache::global()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_capacity(settings.template_cache_size);
        Self {
            scales: settings.scales.clone(),
            quick_scales: settings.quick_check_scales.clone(),
            early_exit: settings.early_exit_score,
            pool: match_pool(settings.match_threads),
        }
    }

    /// Workers available to one correlation pass.
    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(p) => p.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    fn correlate(&self, img: &GrayImage, tpl: &GrayImage) -> Option<Peak> {
        match &self.pool {
            Some(p) => p.install(|| match_template(img, tpl)),
            None => match_template(img, tpl),
        }
    }

    /// Best match over all scales, if it clears `confidence`.
    pub fn find(&self, path: &Path, confidence: f32, shot: &Screenshot) -> Option<ImageMatch> {
        let gray = imageops::grayscale(&shot.image);
        let mut best: Option<(Peak, u32, u32)> = None;
        for &scale in &self.scales {
            let tpl = match load_template(path, scale) {
                Ok(t) => t,
                Err(e) => {
                    warn!("{:#}", e);
                    return None;
                }
            };
            if let Some(peak) = self.correlate(&gray, &tpl) {
                if best.map_or(true, |(b, _, _)| peak.score > b.score) {
                    best = Some((peak, tpl.width(), tpl.height()));
                }
            }
            if let Some((b, _, _)) = best {
                if b.score >= self.early_exit && b.score >= confidence {
                    break;
                }
            }
        }

        let (peak, w, h) = best?;
        if peak.score < confidence {
            debug!("{} best {:.3} below {:.2}", path.display(), peak.score, confidence);
            return None;
        }
        Some(ImageMatch {
            center: shot.offset.offset((peak.x + w / 2) as i32, (peak.y + h / 2) as i32),
            width: w,
            height: h,
            score: peak.score,
        })
    }

    /// Cheap re-match in a small window around a cached point.
    pub fn verify_at(&self, path: &Path, confidence: f32, shot: &Screenshot, at: Point) -> bool {
        let gray = imageops::grayscale(&shot.image);
        let rel = Point::new(at.x - shot.offset.x, at.y - shot.offset.y);
        for &scale in &self.quick_scales {
            let Ok(tpl) = load_template(path, scale) else { return false };
            let pad_w = tpl.width() as i32 / 2 + QUICK_CHECK_MARGIN;
            let pad_h = tpl.height() as i32 / 2 + QUICK_CHECK_MARGIN;
            let l = (rel.x - pad_w).max(0);
            let t = (rel.y - pad_h).max(0);
            let r = (rel.x + pad_w).min(gray.width() as i32);
            let b = (rel.y + pad_h).min(gray.height() as i32);
            if r <= l || b <= t {
                continue;
            }
            let crop = imageops::crop_imm(&gray, l as u32, t as u32, (r - l) as u32, (b - t) as u32).to_image();
            if let Some(peak) = self.correlate(&crop, &tpl) {
                if peak.score >= confidence {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    pub(crate) fn noise(w: u32, h: u32, seed: u32) -> GrayImage {
        let mut s = seed.wrapping_mul(2654435761).wrapping_add(1);
        GrayImage::from_fn(w, h, |_, _| {
            s = s.wrapping_mul(1664525).wrapping_add(1013904223);
            image::Luma([(s >> 24) as u8])
        })
    }

    pub(crate) fn to_rgba(g: &GrayImage) -> RgbaImage {
        DynamicImage::ImageLuma8(g.clone()).to_rgba8()
    }

    fn settings() -> EngineSettings {
        EngineSettings::default()
    }

    #[test]
    fn match_threads_bound_the_search() {
        let img = noise(200, 150, 4);
        let tpl = imageops::crop_imm(&img, 70, 40, 30, 24).to_image();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.png");
        tpl.save(&path).unwrap();
        let shot = Screenshot::new(to_rgba(&img), Point::default());

        let single = TemplateMatcher::new(&settings());
        assert_eq!(single.threads(), 1);
        let global = TemplateMatcher::new(&EngineSettings { match_threads: 0, ..settings() });
        assert_eq!(global.threads(), rayon::current_num_threads());

        let a = single.find(&path, 0.9, &shot).unwrap();
        let b = global.find(&path, 0.9, &shot).unwrap();
        assert_eq!(a.center, Point::new(85, 52));
        assert_eq!(a, b);
    }

    #[test]
    fn exact_cut_is_found() {
        let img = noise(120, 90, 1);
        let tpl = imageops::crop_imm(&img, 30, 20, 20, 16).to_image();
        let p = match_template(&img, &tpl).unwrap();
        assert_eq!((p.x, p.y), (30, 20));
        assert!(p.score > 0.999);
    }

    #[test]
    fn oversized_template_does_not_match() {
        assert!(match_template(&noise(10, 10, 1), &noise(11, 5, 2)).is_none());
    }

    #[test]
    fn flat_template_only_matches_flat_windows() {
        let flat = GrayImage::from_pixel(8, 8, image::Luma([40]));
        let p = match_template(&noise(40, 40, 3), &flat).unwrap();
        assert_eq!(p.score, 0.0);
        let mut img = noise(40, 40, 3);
        imageops::replace(&mut img, &GrayImage::from_pixel(10, 10, image::Luma([200])), 12, 14);
        let p = match_template(&img, &flat).unwrap();
        assert_eq!(p.score, 1.0);
    }

    #[test]
    fn pyramid_path_finds_target_on_large_screen() {
        let img = noise(640, 480, 7);
        let tpl = imageops::crop_imm(&img, 400, 300, 48, 48).to_image();
        let p = match_template(&img, &tpl).unwrap();
        assert_eq!((p.x, p.y), (400, 300));
        assert!(p.score > 0.99);
    }

    #[test]
    fn finds_template_rendered_at_ninety_percent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("button.png");
        let tpl = noise(50, 50, 11);
        tpl.save(&path).unwrap();

        let mut screen = noise(200, 150, 12);
        let shrunk = imageops::resize(&tpl, 45, 45, FilterType::Triangle);
        imageops::replace(&mut screen, &shrunk, 100, 60);
        let shot = Screenshot::new(to_rgba(&screen), Point::new(1000, 500));

        let m = TemplateMatcher::new(&settings()).find(&path, 0.8, &shot).unwrap();
        assert_eq!((m.width, m.height), (45, 45));
        assert_eq!(m.center, Point::new(1000 + 122, 500 + 82));
        assert!(m.score >= 0.95);
    }

    #[test]
    fn missing_file_is_not_found() {
        let shot = Screenshot::new(to_rgba(&noise(50, 50, 1)), Point::default());
        let m = TemplateMatcher::new(&settings());
        assert!(m.find(Path::new("/nonexistent/x.png"), 0.8, &shot).is_none());
    }

    #[test]
    fn verify_at_checks_only_the_neighbourhood() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icon.png");
        let screen = noise(300, 200, 5);
        imageops::crop_imm(&screen, 200, 120, 30, 30).to_image().save(&path).unwrap();
        let shot = Screenshot::new(to_rgba(&screen), Point::default());
        let m = TemplateMatcher::new(&settings());

        assert!(m.verify_at(&path, 0.9, &shot, Point::new(215, 135)));
        assert!(m.verify_at(&path, 0.9, &shot, Point::new(220, 130)));
        assert!(!m.verify_at(&path, 0.9, &shot, Point::new(40, 40)));
    }

    #[test]
    fn template_cache_is_bounded() {
        let mut c = TemplateCache::new(2);
        let img = Arc::new(GrayImage::new(1, 1));
        c.insert(Path::new("a.png"), 1.0, img.clone());
        c.insert(Path::new("a.png"), 0.9, img.clone());
        c.insert(Path::new("b.png"), 1.0, img.clone());
        assert_eq!(c.len(), 2);
        assert!(c.get(Path::new("a.png"), 1.0).is_none());
        assert!(c.get(Path::new("b.png"), 1.0).is_some());
        c.set_capacity(1);
        assert_eq!(c.len(), 1);
    }
}
