//! Data-driven macro scenarios. Each `scenarios/*.json` file describes a
//! macro, the screens the stub platform serves, and the input events the
//! run must produce.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use image::{imageops, GrayImage, Luma, Rgba, RgbaImage};
use libtest_mimic::{Arguments, Failed, Trial};
use serde::Deserialize;
use serde_json::Value;

use replay_core::context::RunContext;
use replay_core::interpreter::{Interpreter, RunOutcome};
use replay_core::matcher::TemplateMatcher;
use replay_core::ocr::{EngineKind, Lang, OcrBackend, OcrResolver, OcrWord};
use replay_core::platform::stub::StubPlatform;
use replay_core::settings::EngineSettings;
use replay_core::step::Step;
use replay_core::types::BoundingBox;

#[derive(Deserialize)]
struct Scenario {
    #[serde(default)]
    settings: Value,
    /// Templates written next to the macro, by file name.
    #[serde(default)]
    images: BTreeMap<String, Noise>,
    #[serde(default)]
    screens: Vec<Screen>,
    #[serde(rename = "macro")]
    steps: Vec<Step>,
    expect: Expect,
}

#[derive(Deserialize, Clone, Copy)]
struct Noise {
    seed: u32,
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct Screen {
    #[serde(flatten)]
    base: Noise,
    #[serde(default)]
    paste: Vec<Paste>,
    #[serde(default)]
    words: Vec<Word>,
}

/// A word the OCR backend will read at (x, y).
#[derive(Deserialize)]
struct Word {
    text: String,
    x: u32,
    y: u32,
}

#[derive(Deserialize)]
struct Paste {
    image: String,
    x: i64,
    y: i64,
}

#[derive(Deserialize)]
struct Expect {
    outcome: String,
    failed_step: Option<usize>,
    #[serde(default)]
    clicks: Vec<(i32, i32, String)>,
    captures: Option<usize>,
}

fn noise(spec: Noise) -> GrayImage {
    let mut s = spec.seed.wrapping_mul(2654435761).wrapping_add(1);
    GrayImage::from_fn(spec.width, spec.height, |_, _| {
        s = s.wrapping_mul(1664525).wrapping_add(1013904223);
        Luma([(s >> 24) as u8])
    })
}

fn to_rgba(g: &GrayImage) -> RgbaImage {
    image::DynamicImage::ImageLuma8(g.clone()).to_rgba8()
}

// Word markers are painted as 8x8 blocks of (WORD_R, index, WORD_B). Noise
// screens are gray, so the color never occurs by accident.
const WORD_R: u8 = 250;
const WORD_B: u8 = 7;

fn paint_word(img: &mut RgbaImage, index: u8, x: u32, y: u32) {
    for py in y.saturating_sub(4)..(y + 4).min(img.height()) {
        for px in x.saturating_sub(4)..(x + 4).min(img.width()) {
            img.put_pixel(px, py, Rgba([WORD_R, index, WORD_B, 255]));
        }
    }
}

/// OCR backend that reads the painted word markers.
struct MarkerOcr {
    words: Vec<String>,
}

impl OcrBackend for MarkerOcr {
    fn kind(&self) -> EngineKind {
        EngineKind::Tesseract
    }

    fn is_available(&self) -> bool {
        true
    }

    fn recognize(&self, image: &RgbaImage, _lang: Lang) -> anyhow::Result<Vec<OcrWord>> {
        let mut boxes: BTreeMap<u8, (u32, u32, u32, u32)> = BTreeMap::new();
        for (x, y, p) in image.enumerate_pixels() {
            if p[0] != WORD_R || p[2] != WORD_B {
                continue;
            }
            let b = boxes.entry(p[1]).or_insert((x, y, x, y));
            *b = (b.0.min(x), b.1.min(y), b.2.max(x), b.3.max(y));
        }
        Ok(boxes
            .into_iter()
            .filter_map(|(i, (l, t, r, b))| {
                let text = self.words.get(i as usize)?;
                let bbox = BoundingBox::from_xywh(l as i32, t as i32, (r + 1 - l) as i32, (b + 1 - t) as i32);
                Some(OcrWord::new(text.clone(), bbox, 0.9))
            })
            .collect())
    }
}

fn run_scenario(path: &Path) -> Result<(), Failed> {
    let text = fs::read_to_string(path).map_err(|e| format!("read {}: {}", path.display(), e))?;
    let mut sc: Scenario = serde_json::from_str(&text).map_err(|e| format!("parse {}: {}", path.display(), e))?;

    let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
    let mut templates = BTreeMap::new();
    for (name, spec) in &sc.images {
        let img = noise(*spec);
        img.save(dir.path().join(name)).map_err(|e| format!("write {}: {}", name, e))?;
        templates.insert(name.clone(), img);
    }

    let mut words: Vec<String> = Vec::new();
    let mut screens = Vec::new();
    for screen in &sc.screens {
        let mut img = noise(screen.base);
        for p in &screen.paste {
            let tpl = templates.get(&p.image).ok_or_else(|| format!("unknown image '{}'", p.image))?;
            imageops::replace(&mut img, tpl, p.x, p.y);
        }
        let mut img = to_rgba(&img);
        for w in &screen.words {
            let index = match words.iter().position(|t| *t == w.text) {
                Some(i) => i,
                None => {
                    words.push(w.text.clone());
                    words.len() - 1
                }
            };
            let index = u8::try_from(index).map_err(|_| "too many distinct words")?;
            paint_word(&mut img, index, w.x, w.y);
        }
        screens.push(img);
    }

    // Image paths in the macro are relative to the scenario's temp dir.
    for step in &mut sc.steps {
        for key in ["path", "condition_image"] {
            if let Some(Value::String(rel)) = step.params.get(key) {
                let abs = dir.path().join(rel).to_string_lossy().to_string();
                step.params.insert(key.into(), Value::String(abs));
            }
        }
    }

    let settings: EngineSettings = if sc.settings.is_null() {
        EngineSettings::default()
    } else {
        serde_json::from_value(sc.settings.clone()).map_err(|e| format!("settings: {}", e))?
    };

    let mut platform = StubPlatform::new().with_screens(screens);
    let log = platform.events();
    let matcher = TemplateMatcher::new(&settings);
    let ocr = OcrResolver::with_backends(vec![Box::new(MarkerOcr { words })]);
    let mut ctx = RunContext::new(Arc::new(AtomicBool::new(false)));
    let outcome = Interpreter::new(&mut platform, &matcher, &ocr, &settings).execute(&mut sc.steps, &mut ctx, &|_| {});

    let got = match &outcome {
        RunOutcome::Completed => ("completed", None),
        RunOutcome::Stopped => ("stopped", None),
        RunOutcome::Failed { step, .. } => ("failed", Some(*step)),
    };
    if got.0 != sc.expect.outcome || (sc.expect.failed_step.is_some() && got.1 != sc.expect.failed_step) {
        return Err(format!("outcome {:?}, expected {} {:?}", outcome, sc.expect.outcome, sc.expect.failed_step).into());
    }

    let clicks: Vec<(i32, i32, String)> = log
        .clicks()
        .into_iter()
        .map(|(p, b)| (p.x, p.y, format!("{:?}", b).to_lowercase()))
        .collect();
    if clicks != sc.expect.clicks {
        return Err(format!("clicks {:?}, expected {:?}", clicks, sc.expect.clicks).into());
    }
    if let Some(n) = sc.expect.captures {
        if log.captures() != n {
            return Err(format!("{} captures, expected {}", log.captures(), n).into());
        }
    }
    Ok(())
}

fn scenario_files() -> Vec<PathBuf> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios");
    let mut files: Vec<PathBuf> = fs::read_dir(&dir)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    files.retain(|p| p.extension().is_some_and(|e| e == "json"));
    files.sort();
    files
}

fn main() {
    let args = Arguments::from_args();
    let trials = scenario_files()
        .into_iter()
        .map(|path| {
            let name = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            Trial::test(name, move || run_scenario(&path))
        })
        .collect();
    libtest_mimic::run(&args, trials).exit();
}
