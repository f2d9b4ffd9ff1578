use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context as _};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::{debug, info};

use super::{match_words, EngineKind, LazyEngine, Lang, OcrBackend, OcrWord, TextMatch};
use crate::settings::OcrSettings;
use crate::types::BoundingBox;

const UPSCALE: u32 = 2;
const PAGE_SEG_MODES: [u8; 3] = [6, 11, 3];
const MIN_CONFIDENCE: f32 = 30.0;

/// Classical engine driven through the `tesseract` command-line program.
pub struct TesseractOcr {
    configured: Option<PathBuf>,
    tessdata: Option<PathBuf>,
    cmd: LazyEngine<Option<PathBuf>>,
}

impl TesseractOcr {
    pub fn new(settings: &OcrSettings) -> Self {
        Self {
            configured: settings.tesseract_cmd.clone(),
            tessdata: settings.tessdata_dir.clone().or_else(|| {
                bundled_dir().map(|d| d.join("tessdata")).filter(|d| d.is_dir())
            }),
            cmd: LazyEngine::new(),
        }
    }

    fn command(&self) -> Option<&Path> {
        self.cmd
            .get_or_init(|| {
                let found = discover(self.configured.as_deref());
                match &found {
                    Some(p) => info!("tesseract at {}", p.display()),
                    None => info!("tesseract not found"),
                }
                found
            })
            .as_deref()
    }

    fn run(&self, cmd: &Path, png: &Path, lang: Lang, psm: u8) -> anyhow::Result<Vec<OcrWord>> {
        let mut c = Command::new(cmd);
        c.arg(png).arg("stdout").arg("-l").arg(lang.tesseract_code());
        if let Some(dir) = &self.tessdata {
            c.arg("--tessdata-dir").arg(dir);
        }
        c.arg("--psm").arg(psm.to_string()).arg("tsv");
        let out = c.stdin(Stdio::null()).output().context("failed to run tesseract")?;
        if !out.status.success() {
            bail!("tesseract exited with {}: {}", out.status, String::from_utf8_lossy(&out.stderr).trim());
        }
        Ok(parse_tsv(&String::from_utf8_lossy(&out.stdout), UPSCALE))
    }

    /// Grayscale, upscale and write to a temporary PNG for the CLI.
    fn prepare(&self, image: &RgbaImage) -> anyhow::Result<tempfile::NamedTempFile> {
        let gray = imageops::grayscale(image);
        let scaled = imageops::resize(&gray, gray.width() * UPSCALE, gray.height() * UPSCALE, FilterType::CatmullRom);
        let file = tempfile::Builder::new().prefix("replay-ocr-").suffix(".png").tempfile()?;
        scaled.save_with_format(file.path(), image::ImageFormat::Png)?;
        Ok(file)
    }
}

impl OcrBackend for TesseractOcr {
    fn kind(&self) -> EngineKind {
        EngineKind::Tesseract
    }

    fn is_available(&self) -> bool {
        self.command().is_some()
    }

    /// Words from the first page segmentation mode that yields any.
    fn recognize(&self, image: &RgbaImage, lang: Lang) -> anyhow::Result<Vec<OcrWord>> {
        let Some(cmd) = self.command() else { bail!("tesseract is not installed") };
        let png = self.prepare(image)?;
        for psm in PAGE_SEG_MODES {
            let words = self.run(cmd, png.path(), lang, psm)?;
            if !words.is_empty() {
                return Ok(words);
            }
        }
        Ok(Vec::new())
    }

    /// Each segmentation mode gets its own matching attempt.
    fn try_find(&self, image: &RgbaImage, lang: Lang, target: &str) -> anyhow::Result<Option<TextMatch>> {
        let Some(cmd) = self.command() else { bail!("tesseract is not installed") };
        let png = self.prepare(image)?;
        for psm in PAGE_SEG_MODES {
            let words = self.run(cmd, png.path(), lang, psm)?;
            debug!("psm {} recognized {} words", psm, words.len());
            if let Some(m) = match_words(&words, target) {
                return Ok(Some(m));
            }
        }
        Ok(None)
    }
}

/// `tesseract_local/` next to the executable.
fn bundled_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join("tesseract_local"))
}

fn discover(configured: Option<&Path>) -> Option<PathBuf> {
    let exe_name = if cfg!(windows) { "tesseract.exe" } else { "tesseract" };
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(p) = configured {
        candidates.push(p.to_path_buf());
    }
    if let Some(dir) = bundled_dir() {
        candidates.push(dir.join(exe_name));
    }
    candidates.push(PathBuf::from("tesseract"));

    candidates.into_iter().find(|c| {
        Command::new(c)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

/// Parse `tsv` output, keeping confident word rows and mapping boxes back
/// through `scale`.
pub fn parse_tsv(tsv: &str, scale: u32) -> Vec<OcrWord> {
    let scale = scale.max(1) as i32;
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 {
                return None;
            }
            let conf: f32 = cols[10].trim().parse().ok()?;
            let text = cols[11].trim();
            if conf <= MIN_CONFIDENCE || text.is_empty() {
                return None;
            }
            let n = |i: usize| cols[i].trim().parse::<i32>().ok();
            let (l, t, w, h) = (n(6)?, n(7)?, n(8)?, n(9)?);
            Some(OcrWord::new(
                text,
                BoundingBox { l: l / scale, t: t / scale, r: (l + w) / scale, b: (t + h) / scale },
                conf / 100.0,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t400\t200\t-1\t
5\t1\t1\t1\t1\t1\t20\t40\t60\t20\t91.5\tHello
5\t1\t1\t1\t1\t2\t100\t40\t60\t20\t25\tnoise
5\t1\t1\t1\t1\t3\t180\t40\t40\t20\t88\tWorld
5\t1\t1\t1\t1\t4\t240\t40\t10\t20\t95\t ";

    #[test]
    fn tsv_rows_are_filtered_and_scaled() {
        let words = parse_tsv(SAMPLE, 2);
        let texts: Vec<_> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello", "World"]);
        assert_eq!(words[0].bbox, BoundingBox { l: 10, t: 20, r: 40, b: 30 });
        assert!((words[1].score - 0.88).abs() < 1e-6);
    }

    #[test]
    fn merged_lookup_on_parsed_words() {
        let words = parse_tsv(SAMPLE, 2);
        let m = match_words(&words, "helloworld").unwrap();
        assert_eq!(m.point.x, (25 + 100) / 2);
        assert_eq!(m.full_text, "Hello World");
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let settings = OcrSettings {
            tesseract_cmd: Some(PathBuf::from("/nonexistent/tesseract")),
            ..Default::default()
        };
        let t = TesseractOcr::new(&settings);
        if discover(None).is_none() {
            assert!(!t.is_available());
            assert!(t.recognize(&RgbaImage::new(4, 4), Lang::Eng).is_err());
        }
    }
}
