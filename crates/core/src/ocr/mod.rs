pub mod ml;
pub mod native;
pub mod tesseract;

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use image::RgbaImage;
use tracing::{debug, info, warn};

use crate::settings::OcrSettings;
use crate::stats::RunStats;
use crate::types::{BoundingBox, Point, Screenshot};

// Words merged after a prefix hit: the hit itself plus up to four followers.
const MERGE_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lang {
    #[default]
    Eng,
    ChiSim,
}

impl Lang {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "eng" | "en" | "en-us" | "english" => Some(Lang::Eng),
            "chi_sim" | "ch" | "zh" | "zh-hans" | "chinese" => Some(Lang::ChiSim),
            _ => None,
        }
    }

    /// Unknown names fall back to English.
    pub fn parse_lenient(s: &str) -> Self {
        Self::parse(s).unwrap_or_else(|| {
            warn!("unknown OCR language '{}', using eng", s);
            Lang::Eng
        })
    }

    pub fn tesseract_code(self) -> &'static str {
        match self {
            Lang::Eng => "eng",
            Lang::ChiSim => "chi_sim",
        }
    }

    pub fn bcp47(self) -> &'static str {
        match self {
            Lang::Eng => "en-US",
            Lang::ChiSim => "zh-Hans",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineKind {
    Native,
    Ml,
    Tesseract,
}

impl EngineKind {
    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Native => "native",
            EngineKind::Ml => "ml",
            EngineKind::Tesseract => "tesseract",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which engines a lookup may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineChoice {
    #[default]
    Auto,
    Native,
    Ml,
    Tesseract,
}

impl EngineChoice {
    /// Accepts the engine names plus the editor's historical aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Some(EngineChoice::Auto),
            "native" | "winocr" => Some(EngineChoice::Native),
            "ml" | "rapidocr" | "ocrs" => Some(EngineChoice::Ml),
            "tesseract" => Some(EngineChoice::Tesseract),
            _ => None,
        }
    }

    /// The single engine an explicit choice pins, `None` for auto.
    pub fn engine(self) -> Option<EngineKind> {
        match self {
            EngineChoice::Auto => None,
            EngineChoice::Native => Some(EngineKind::Native),
            EngineChoice::Ml => Some(EngineKind::Ml),
            EngineChoice::Tesseract => Some(EngineKind::Tesseract),
        }
    }
}

/// One recognized word in image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    pub bbox: BoundingBox,
    pub score: f32,
}

impl OcrWord {
    pub fn new(text: impl Into<String>, bbox: BoundingBox, score: f32) -> Self {
        Self { text: text.into(), bbox, score }
    }
}

/// Located text, image-relative until the resolver adds the capture offset.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    pub point: Point,
    pub full_text: String,
}

/// Lowercase with all whitespace removed.
pub fn normalize(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect()
}

/// Find `target` (already normalized) among `words`: first a single word
/// containing it, then a run of up to five adjacent words that concatenate
/// to it exactly.
pub fn match_words(words: &[OcrWord], target: &str) -> Option<TextMatch> {
    if target.is_empty() {
        return None;
    }
    let full_text = words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ");
    let norm: Vec<(String, &BoundingBox)> = words
        .iter()
        .map(|w| (normalize(&w.text), &w.bbox))
        .filter(|(t, _)| !t.is_empty())
        .collect();

    if let Some((_, b)) = norm.iter().find(|(t, _)| t.contains(target)) {
        return Some(TextMatch { point: b.center(), full_text });
    }

    for i in 0..norm.len() {
        if !target.starts_with(norm[i].0.as_str()) {
            continue;
        }
        let mut merged = norm[i].0.clone();
        let mut boxes = vec![norm[i].1];
        for next in &norm[i + 1..norm.len().min(i + MERGE_WINDOW)] {
            merged.push_str(&next.0);
            boxes.push(next.1);
            if merged == target {
                let n = boxes.len() as i32;
                let cx = boxes.iter().map(|b| b.center().x).sum::<i32>() / n;
                let cy = boxes.iter().map(|b| b.center().y).sum::<i32>() / n;
                return Some(TextMatch { point: Point::new(cx, cy), full_text });
            }
        }
    }
    None
}

/// One OCR engine. Implementations initialize lazily and report whether
/// they can run on this machine.
pub trait OcrBackend: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn is_available(&self) -> bool;

    fn supports(&self, _lang: Lang) -> bool {
        true
    }

    fn recognize(&self, image: &RgbaImage, lang: Lang) -> anyhow::Result<Vec<OcrWord>>;

    fn try_find(&self, image: &RgbaImage, lang: Lang, target: &str) -> anyhow::Result<Option<TextMatch>> {
        let words = self.recognize(image, lang)?;
        debug!("{} recognized {} words", self.kind(), words.len());
        Ok(match_words(&words, target))
    }
}

/// Value built at most once, on first use, even under concurrent access.
pub struct LazyEngine<T> {
    cell: OnceLock<T>,
}

impl<T> LazyEngine<T> {
    pub const fn new() -> Self {
        Self { cell: OnceLock::new() }
    }

    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        self.cell.get_or_init(init)
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }
}

impl<T> Default for LazyEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tries OCR engines in priority order: native, ML, tesseract.
pub struct OcrResolver {
    backends: Vec<Box<dyn OcrBackend>>,
    force: Option<EngineChoice>,
}

impl OcrResolver {
    pub fn new(settings: &OcrSettings) -> Self {
        let backends: Vec<Box<dyn OcrBackend>> = vec![
            Box::new(native::NativeOcr::new()),
            Box::new(ml::MlOcr::new(settings)),
            Box::new(tesseract::TesseractOcr::new(settings)),
        ];
        let force = settings
            .force_engine
            .as_deref()
            .and_then(|e| {
                let choice = EngineChoice::parse(e);
                if choice.is_none() {
                    warn!("ignoring unknown force_engine '{}'", e);
                }
                choice
            })
            .filter(|c| *c != EngineChoice::Auto);
        Self { backends, force }
    }

    pub fn with_backends(backends: Vec<Box<dyn OcrBackend>>) -> Self {
        Self { backends, force: None }
    }

    /// Engines that initialize on this machine.
    pub fn available_engines(&self) -> Vec<EngineKind> {
        self.backends.iter().filter(|b| b.is_available()).map(|b| b.kind()).collect()
    }

    /// Locate `target` in `shot`, returning an absolute point and the full
    /// recognized text. An explicit engine is used alone, with no fallback.
    pub fn find(
        &self,
        target: &str,
        lang: Lang,
        shot: &Screenshot,
        choice: EngineChoice,
        stats: &mut RunStats,
    ) -> Option<TextMatch> {
        let target_norm = normalize(target);
        if target_norm.is_empty() {
            return None;
        }
        let choice = self.force.unwrap_or(choice);

        let candidates: Vec<&dyn OcrBackend> = match choice.engine() {
            None => self.backends.iter().map(|b| b.as_ref()).collect(),
            Some(kind) => {
                let Some(b) = self.backends.iter().find(|b| b.kind() == kind) else {
                    warn!("OCR engine {} is not registered", kind);
                    return None;
                };
                if !b.is_available() {
                    warn!("OCR engine {} is not available", kind);
                    return None;
                }
                vec![b.as_ref()]
            }
        };

        for backend in candidates {
            if !backend.supports(lang) || !backend.is_available() {
                continue;
            }
            let t0 = Instant::now();
            let result = match backend.try_find(&shot.image, lang, &target_norm) {
                Ok(r) => r,
                Err(e) => {
                    warn!("{} failed: {:#}", backend.kind(), e);
                    None
                }
            };
            stats.record_engine(backend.kind().name(), result.is_some(), t0.elapsed());
            if let Some(m) = result {
                let point = shot.offset.offset(m.point.x, m.point.y);
                info!("{} found '{}' at {}", backend.kind(), target, point);
                return Some(TextMatch { point, full_text: m.full_text });
            }
        }
        info!("text '{}' not found ({:?})", target, choice);
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn word(text: &str, x: i32) -> OcrWord {
        OcrWord::new(text, BoundingBox::from_xywh(x, 10, 20, 10), 0.9)
    }

    /// Backend returning a fixed word list.
    pub(crate) struct FakeOcr {
        pub kind: EngineKind,
        pub available: bool,
        pub words: Vec<OcrWord>,
        pub calls: Arc<Mutex<u32>>,
    }

    impl FakeOcr {
        pub(crate) fn new(kind: EngineKind, words: Vec<OcrWord>) -> Self {
            Self { kind, available: true, words, calls: Arc::new(Mutex::new(0)) }
        }
    }

    pub(crate) const MARK: image::Rgba<u8> = image::Rgba([250, 0, 7, 255]);

    /// Paint an 8x8 marker block centered on (x, y).
    pub(crate) fn paint_mark(img: &mut RgbaImage, x: u32, y: u32) {
        for py in y.saturating_sub(4)..(y + 4).min(img.height()) {
            for px in x.saturating_sub(4)..(x + 4).min(img.width()) {
                img.put_pixel(px, py, MARK);
            }
        }
    }

    /// Backend that "reads" `text` wherever a marker block is visible, so
    /// hits move with the capture region.
    pub(crate) struct MarkerOcr {
        pub text: String,
    }

    impl OcrBackend for MarkerOcr {
        fn kind(&self) -> EngineKind {
            EngineKind::Tesseract
        }
        fn is_available(&self) -> bool {
            true
        }
        fn recognize(&self, image: &RgbaImage, _lang: Lang) -> anyhow::Result<Vec<OcrWord>> {
            let marked: Vec<(u32, u32)> =
                image.enumerate_pixels().filter(|(_, _, p)| **p == MARK).map(|(x, y, _)| (x, y)).collect();
            let (Some(l), Some(t)) = (marked.iter().map(|m| m.0).min(), marked.iter().map(|m| m.1).min()) else {
                return Ok(Vec::new());
            };
            let r = marked.iter().map(|m| m.0).max().unwrap_or(l) + 1;
            let b = marked.iter().map(|m| m.1).max().unwrap_or(t) + 1;
            let bbox = BoundingBox::from_xywh(l as i32, t as i32, (r - l) as i32, (b - t) as i32);
            Ok(vec![OcrWord::new(self.text.clone(), bbox, 0.9)])
        }
    }

    #[test]
    fn marker_backend_follows_the_crop() {
        let mut img = RgbaImage::new(100, 100);
        paint_mark(&mut img, 60, 40);
        let shot = Screenshot::new(img, Point::new(10, 20));
        let resolver = OcrResolver::with_backends(vec![Box::new(MarkerOcr { text: "Done".into() })]);
        let mut stats = RunStats::default();
        let m = resolver.find("done", Lang::Eng, &shot, EngineChoice::Auto, &mut stats).unwrap();
        assert_eq!(m.point, Point::new(70, 60));
        let crop = shot.crop(50, 30, 100, 100).unwrap();
        assert_eq!(resolver.find("done", Lang::Eng, &crop, EngineChoice::Auto, &mut stats).unwrap().point, Point::new(70, 60));
        assert!(resolver.find("done", Lang::Eng, &shot.crop(0, 0, 40, 30).unwrap(), EngineChoice::Auto, &mut stats).is_none());
    }

    impl OcrBackend for FakeOcr {
        fn kind(&self) -> EngineKind {
            self.kind
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn recognize(&self, _image: &RgbaImage, _lang: Lang) -> anyhow::Result<Vec<OcrWord>> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.words.clone())
        }
    }

    fn shot() -> Screenshot {
        Screenshot::new(RgbaImage::new(10, 10), Point::new(100, 200))
    }

    #[test]
    fn merges_split_words() {
        let words = vec![word("hello", 0), word("wor", 20), word("ld", 40)];
        let m = match_words(&words, "helloworld").unwrap();
        // centers 10, 30, 50
        assert_eq!(m.point, Point::new(30, 15));
        assert_eq!(m.full_text, "hello wor ld");
        assert!(match_words(&words, "goodbye").is_none());
    }

    #[test]
    fn substring_hit_wins_over_merge() {
        let words = vec![word("Total:", 0), word("$42", 20)];
        assert_eq!(match_words(&words, "total").unwrap().point, Point::new(10, 15));
        assert_eq!(match_words(&words, &normalize("Total: $42")).unwrap().point, Point::new(20, 15));
    }

    #[test]
    fn merge_window_is_bounded() {
        let words: Vec<_> = "abcdef".chars().enumerate().map(|(i, c)| word(&c.to_string(), i as i32 * 20)).collect();
        assert!(match_words(&words, "abcde").is_some());
        assert!(match_words(&words, "abcdef").is_none());
    }

    #[test]
    fn empty_words_are_ignored() {
        let words = vec![word(" ", 0), word("ok", 20)];
        assert_eq!(match_words(&words, "ok").unwrap().point, Point::new(30, 15));
        assert!(match_words(&words, "").is_none());
    }

    #[test]
    fn auto_falls_through_to_next_engine() {
        let mut first = FakeOcr::new(EngineKind::Native, vec![word("nothing", 0)]);
        first.available = true;
        let mut skipped = FakeOcr::new(EngineKind::Ml, vec![word("submit", 0)]);
        skipped.available = false;
        let last = FakeOcr::new(EngineKind::Tesseract, vec![word("Submit", 40)]);
        let resolver = OcrResolver::with_backends(vec![Box::new(first), Box::new(skipped), Box::new(last)]);

        let mut stats = RunStats::default();
        let m = resolver.find("submit", Lang::Eng, &shot(), EngineChoice::Auto, &mut stats).unwrap();
        assert_eq!(m.point, Point::new(150, 215));
        assert_eq!(stats.engines["native"].failure, 1);
        assert_eq!(stats.engines["tesseract"].success, 1);
        assert!(!stats.engines.contains_key("ml"));
        assert_eq!(resolver.available_engines(), vec![EngineKind::Native, EngineKind::Tesseract]);
    }

    #[test]
    fn explicit_engine_never_falls_back() {
        let native = FakeOcr::new(EngineKind::Native, vec![word("submit", 0)]);
        let mut ml = FakeOcr::new(EngineKind::Ml, vec![]);
        ml.available = false;
        let tess = FakeOcr::new(EngineKind::Tesseract, vec![]);
        let native_calls = native.calls.clone();
        let resolver = OcrResolver::with_backends(vec![Box::new(native), Box::new(ml), Box::new(tess)]);
        let mut stats = RunStats::default();

        assert!(resolver.find("submit", Lang::Eng, &shot(), EngineChoice::Tesseract, &mut stats).is_none());
        assert!(resolver.find("submit", Lang::Eng, &shot(), EngineChoice::Ml, &mut stats).is_none());
        assert_eq!(*native_calls.lock().unwrap(), 0);
        assert!(resolver.find("submit", Lang::Eng, &shot(), EngineChoice::Native, &mut stats).is_some());
    }

    #[test]
    fn engine_names_and_aliases() {
        assert_eq!(EngineChoice::parse("winocr"), Some(EngineChoice::Native));
        assert_eq!(EngineChoice::parse("RapidOCR"), Some(EngineChoice::Ml));
        assert_eq!(EngineChoice::parse("auto"), Some(EngineChoice::Auto));
        assert_eq!(EngineChoice::parse("paddle"), None);
        assert_eq!(Lang::parse_lenient("klingon"), Lang::Eng);
        assert_eq!(Lang::ChiSim.bcp47(), "zh-Hans");
    }

    #[test]
    fn lazy_engine_initializes_once_under_contention() {
        let cell: Arc<LazyEngine<u32>> = Arc::new(LazyEngine::new());
        let inits = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                let inits = inits.clone();
                std::thread::spawn(move || {
                    *cell.get_or_init(|| {
                        inits.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        7
                    })
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 7);
        }
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }
}
