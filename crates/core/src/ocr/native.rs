use image::RgbaImage;

use super::{EngineKind, LazyEngine, Lang, OcrBackend, OcrWord};

/// The operating system's built-in recognizer (Windows.Media.Ocr).
/// Unavailable on other systems or without the `native` feature.
pub struct NativeOcr {
    available: LazyEngine<bool>,
}

impl NativeOcr {
    pub fn new() -> Self {
        Self { available: LazyEngine::new() }
    }
}

impl Default for NativeOcr {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrBackend for NativeOcr {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(imp::available)
    }

    fn supports(&self, lang: Lang) -> bool {
        imp::supports(lang)
    }

    fn recognize(&self, image: &RgbaImage, lang: Lang) -> anyhow::Result<Vec<OcrWord>> {
        imp::recognize(image, lang)
    }
}

#[cfg(all(windows, feature = "native"))]
mod imp {
    use image::RgbaImage;
    use windows::core::HSTRING;
    use windows::Globalization::Language;
    use windows::Graphics::Imaging::{BitmapAlphaMode, BitmapPixelFormat, SoftwareBitmap};
    use windows::Media::Ocr::OcrEngine;
    use windows::Storage::Streams::DataWriter;

    use super::super::{Lang, OcrWord};
    use crate::types::BoundingBox;

    pub fn available() -> bool {
        OcrEngine::AvailableRecognizerLanguages()
            .and_then(|langs| langs.Size())
            .map(|n| n > 0)
            .unwrap_or(false)
    }

    fn language(lang: Lang) -> windows::core::Result<Language> {
        Language::CreateLanguage(&HSTRING::from(lang.bcp47()))
    }

    pub fn supports(lang: Lang) -> bool {
        language(lang)
            .and_then(|l| OcrEngine::IsLanguageSupported(&l))
            .unwrap_or(false)
    }

    pub fn recognize(image: &RgbaImage, lang: Lang) -> anyhow::Result<Vec<OcrWord>> {
        let engine = OcrEngine::TryCreateFromLanguage(&language(lang)?)?;

        let mut bgra = image.as_raw().clone();
        for px in bgra.chunks_exact_mut(4) {
            px.swap(0, 2);
        }
        let writer = DataWriter::new()?;
        writer.WriteBytes(&bgra)?;
        let buffer = writer.DetachBuffer()?;
        let bitmap = SoftwareBitmap::CreateCopyWithAlphaFromBuffer(
            &buffer,
            BitmapPixelFormat::Bgra8,
            image.width() as i32,
            image.height() as i32,
            BitmapAlphaMode::Premultiplied,
        )?;

        let result = engine.RecognizeAsync(&bitmap)?.get()?;
        let mut words = Vec::new();
        for line in result.Lines()? {
            for word in line.Words()? {
                let r = word.BoundingRect()?;
                words.push(OcrWord::new(
                    word.Text()?.to_string_lossy(),
                    BoundingBox::from_xywh(r.X as i32, r.Y as i32, r.Width as i32, r.Height as i32),
                    1.0,
                ));
            }
        }
        Ok(words)
    }
}

#[cfg(not(all(windows, feature = "native")))]
mod imp {
    use image::RgbaImage;

    use super::super::{Lang, OcrWord};

    pub fn available() -> bool {
        false
    }

    pub fn supports(_lang: Lang) -> bool {
        false
    }

    pub fn recognize(_image: &RgbaImage, _lang: Lang) -> anyhow::Result<Vec<OcrWord>> {
        anyhow::bail!("native OCR is only available on Windows builds with the `native` feature")
    }
}
