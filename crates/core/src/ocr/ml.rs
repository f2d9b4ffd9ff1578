use std::path::PathBuf;

use image::RgbaImage;

use super::{EngineKind, LazyEngine, Lang, OcrBackend, OcrWord};
use crate::settings::OcrSettings;

const DETECTION_FILE: &str = "text-detection.rten";
const RECOGNITION_FILE: &str = "text-recognition.rten";

/// Neural detector + recognizer (`ocrs`), English only. Built with the
/// `ml-ocr` feature; models load on first use.
pub struct MlOcr {
    detection: Option<PathBuf>,
    recognition: Option<PathBuf>,
    engine: LazyEngine<Option<imp::Engine>>,
}

impl MlOcr {
    pub fn new(settings: &OcrSettings) -> Self {
        Self {
            detection: settings.detection_model.clone().or_else(|| default_model(DETECTION_FILE)),
            recognition: settings.recognition_model.clone().or_else(|| default_model(RECOGNITION_FILE)),
            engine: LazyEngine::new(),
        }
    }

    fn engine(&self) -> Option<&imp::Engine> {
        self.engine
            .get_or_init(|| match (&self.detection, &self.recognition) {
                (Some(d), Some(r)) => match imp::Engine::load(d, r) {
                    Ok(e) => Some(e),
                    Err(e) => {
                        tracing::info!("ml OCR unavailable: {:#}", e);
                        None
                    }
                },
                _ => None,
            })
            .as_ref()
    }
}

/// `models/` next to the executable, then `~/.cache/ocrs/`.
fn default_model(name: &str) -> Option<PathBuf> {
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("models").join(name)));
    let cache = std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache").join("ocrs").join(name));
    beside_exe.into_iter().chain(cache).find(|p| p.is_file())
}

impl OcrBackend for MlOcr {
    fn kind(&self) -> EngineKind {
        EngineKind::Ml
    }

    fn is_available(&self) -> bool {
        self.engine().is_some()
    }

    fn supports(&self, lang: Lang) -> bool {
        lang == Lang::Eng
    }

    fn recognize(&self, image: &RgbaImage, _lang: Lang) -> anyhow::Result<Vec<OcrWord>> {
        match self.engine() {
            Some(e) => e.recognize(image),
            None => anyhow::bail!("ml OCR models are not loaded"),
        }
    }
}

#[cfg(feature = "ml-ocr")]
mod imp {
    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::Context as _;
    use image::{DynamicImage, RgbaImage};
    use ocrs::{ImageSource, OcrEngine, OcrEngineParams, TextItem};

    use super::super::OcrWord;
    use crate::types::BoundingBox;

    pub struct Engine(Mutex<OcrEngine>);

    impl Engine {
        pub fn load(detection: &Path, recognition: &Path) -> anyhow::Result<Self> {
            let detection_model = rten::Model::load_file(detection)
                .with_context(|| format!("loading {}", detection.display()))?;
            let recognition_model = rten::Model::load_file(recognition)
                .with_context(|| format!("loading {}", recognition.display()))?;
            let engine = OcrEngine::new(OcrEngineParams {
                detection_model: Some(detection_model),
                recognition_model: Some(recognition_model),
                ..Default::default()
            })?;
            Ok(Self(Mutex::new(engine)))
        }

        pub fn recognize(&self, image: &RgbaImage) -> anyhow::Result<Vec<OcrWord>> {
            let rgb = DynamicImage::ImageRgba8(image.clone()).into_rgb8();
            let engine = self.0.lock().unwrap_or_else(|e| e.into_inner());
            let source = ImageSource::from_bytes(rgb.as_raw(), rgb.dimensions())?;
            let input = engine.prepare_input(source)?;
            let word_rects = engine.detect_words(&input)?;
            let line_rects = engine.find_text_lines(&input, &word_rects);
            let lines = engine.recognize_text(&input, &line_rects)?;

            let mut words = Vec::new();
            for line in lines.iter().flatten() {
                for word in line.words() {
                    let r = word.bounding_rect();
                    words.push(OcrWord::new(
                        word.to_string(),
                        BoundingBox {
                            l: r.left() as i32,
                            t: r.top() as i32,
                            r: r.right() as i32,
                            b: r.bottom() as i32,
                        },
                        1.0,
                    ));
                }
            }
            Ok(words)
        }
    }
}

#[cfg(not(feature = "ml-ocr"))]
mod imp {
    use std::path::Path;

    use image::RgbaImage;

    use super::super::OcrWord;

    pub struct Engine;

    impl Engine {
        pub fn load(_detection: &Path, _recognition: &Path) -> anyhow::Result<Self> {
            anyhow::bail!("built without the `ml-ocr` feature")
        }

        pub fn recognize(&self, _image: &RgbaImage) -> anyhow::Result<Vec<OcrWord>> {
            anyhow::bail!("built without the `ml-ocr` feature")
        }
    }
}
