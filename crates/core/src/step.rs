use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StepError;
use crate::ocr::{EngineChoice, Lang};
use crate::settings::EngineSettings;
use crate::types::{MouseButton, Point};

/// One macro instruction as stored on disk. `action` stays a plain string so
/// files written by newer editors still load; it is only interpreted when the
/// step is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Step {
    pub fn new(action: ActionKind, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { action: action.as_str().to_string(), params }
    }

    pub fn kind(&self) -> Option<ActionKind> {
        ActionKind::parse(&self.action)
    }

    /// Write back (or drop) the persisted search-region hint.
    pub fn apply_cache_hint(&mut self, hint: CacheHint) {
        match hint {
            CacheHint::Set(b) => {
                self.params.insert("cache_box".into(), Value::from(b.to_vec()));
            }
            CacheHint::Clear => {
                self.params.remove("cache_box");
            }
        }
    }
}

/// Change to a step's `cache_box` produced by target resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHint {
    Set([i32; 4]),
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    FindImage,
    FindText,
    MoveOffset,
    MoveTo,
    Click,
    Scroll,
    Wait,
    TypeText,
    PressKey,
    ActivateWindow,
    IfImageFound,
    IfTextFound,
    Else,
    EndIf,
    LoopStart,
    EndLoop,
}

impl ActionKind {
    pub const ALL: [ActionKind; 16] = [
        ActionKind::FindImage,
        ActionKind::FindText,
        ActionKind::MoveOffset,
        ActionKind::MoveTo,
        ActionKind::Click,
        ActionKind::Scroll,
        ActionKind::Wait,
        ActionKind::TypeText,
        ActionKind::PressKey,
        ActionKind::ActivateWindow,
        ActionKind::IfImageFound,
        ActionKind::IfTextFound,
        ActionKind::Else,
        ActionKind::EndIf,
        ActionKind::LoopStart,
        ActionKind::EndLoop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::FindImage => "FIND_IMAGE",
            ActionKind::FindText => "FIND_TEXT",
            ActionKind::MoveOffset => "MOVE_OFFSET",
            ActionKind::MoveTo => "MOVE_TO",
            ActionKind::Click => "CLICK",
            ActionKind::Scroll => "SCROLL",
            ActionKind::Wait => "WAIT",
            ActionKind::TypeText => "TYPE_TEXT",
            ActionKind::PressKey => "PRESS_KEY",
            ActionKind::ActivateWindow => "ACTIVATE_WINDOW",
            ActionKind::IfImageFound => "IF_IMAGE_FOUND",
            ActionKind::IfTextFound => "IF_TEXT_FOUND",
            ActionKind::Else => "ELSE",
            ActionKind::EndIf => "END_IF",
            ActionKind::LoopStart => "LOOP_START",
            ActionKind::EndLoop => "END_LOOP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn is_if(self) -> bool {
        matches!(self, ActionKind::IfImageFound | ActionKind::IfTextFound)
    }

    /// True for steps that open a block closed by END_IF / END_LOOP.
    pub fn opens_block(self) -> bool {
        self.is_if() || self == ActionKind::LoopStart
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageTarget {
    pub path: PathBuf,
    pub confidence: f32,
    pub cache_box: Option<[i32; 4]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextTarget {
    pub text: String,
    pub lang: Lang,
    pub engine: EngineChoice,
    pub cache_box: Option<[i32; 4]>,
    pub save_to_clipboard: bool,
    pub extract_pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopMode {
    Fixed { times: i64 },
    UntilImage { condition_image: PathBuf, confidence: f32 },
    UntilText { condition_text: String, lang: Lang },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSpec {
    pub mode: LoopMode,
    pub max_iterations: u32,
}

/// Strongly typed form of a step, built when the step is about to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    FindImage(ImageTarget),
    FindText(TextTarget),
    IfImageFound(ImageTarget),
    IfTextFound(TextTarget),
    MoveOffset { dx: i32, dy: i32, duration: Duration },
    MoveTo { to: Point, duration: Duration },
    Click { at: Option<Point>, button: MouseButton, clicks: u32, interval: Duration, duration: Duration },
    Scroll { amount: i32, at: Option<Point> },
    Wait { ms: u64 },
    TypeText { text: String, interval: Duration },
    PressKey { keys: Vec<String> },
    ActivateWindow { title: String },
    LoopStart(LoopSpec),
    Else,
    EndIf,
    EndLoop,
}

impl Action {
    pub fn parse(step: &Step, defaults: &EngineSettings) -> Result<Action, StepError> {
        let kind = step.kind().ok_or_else(|| StepError::UnknownAction(step.action.clone()))?;
        let p = Params(&step.params);

        let action = match kind {
            ActionKind::FindImage => Action::FindImage(image_target(&p, defaults)?),
            ActionKind::IfImageFound => Action::IfImageFound(image_target(&p, defaults)?),
            ActionKind::FindText => Action::FindText(text_target(&p)?),
            ActionKind::IfTextFound => Action::IfTextFound(text_target(&p)?),
            ActionKind::MoveOffset => Action::MoveOffset {
                dx: p.req_i32("x_offset")?,
                dy: p.req_i32("y_offset")?,
                duration: p.secs("duration", 0.25)?,
            },
            ActionKind::MoveTo => Action::MoveTo {
                to: Point::new(p.req_i32("x")?, p.req_i32("y")?),
                duration: p.secs("duration", 0.25)?,
            },
            ActionKind::Click => {
                let button = match p.string("button") {
                    None => MouseButton::Left,
                    Some(name) => MouseButton::parse(&name).unwrap_or_else(|| {
                        tracing::warn!("unknown mouse button '{}', using left", name);
                        MouseButton::Left
                    }),
                };
                Action::Click {
                    at: p.point("x", "y")?,
                    button,
                    clicks: p.i64("clicks")?.unwrap_or(1).max(0) as u32,
                    interval: p.secs("interval", 0.0)?,
                    duration: p.secs("duration", 0.0)?,
                }
            }
            ActionKind::Scroll => Action::Scroll {
                amount: p.i32("amount")?.unwrap_or(0),
                at: p.point("x", "y")?,
            },
            ActionKind::Wait => Action::Wait { ms: p.req_i64("ms")?.max(0) as u64 },
            ActionKind::TypeText => Action::TypeText {
                text: p.string("text").ok_or_else(|| StepError::MissingParam("text".into()))?,
                interval: p.secs("interval", 0.0)?,
            },
            ActionKind::PressKey => {
                let raw = p.string("key").unwrap_or_default();
                let keys = parse_combo(&raw);
                if keys.is_empty() {
                    return Err(StepError::MissingParam("key".into()));
                }
                Action::PressKey { keys }
            }
            ActionKind::ActivateWindow => Action::ActivateWindow { title: p.req_string("title")? },
            ActionKind::LoopStart => Action::LoopStart(loop_spec(&p, defaults)?),
            ActionKind::Else => Action::Else,
            ActionKind::EndIf => Action::EndIf,
            ActionKind::EndLoop => Action::EndLoop,
        };
        Ok(action)
    }
}

/// `"Ctrl + Shift+S"` -> `["ctrl", "shift", "s"]`
pub fn parse_combo(raw: &str) -> Vec<String> {
    raw.to_lowercase()
        .replace(' ', "")
        .split('+')
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn image_target(p: &Params, defaults: &EngineSettings) -> Result<ImageTarget, StepError> {
    Ok(ImageTarget {
        path: PathBuf::from(p.req_string("path")?),
        confidence: p.f64("confidence")?.map(|c| c as f32).unwrap_or(defaults.default_confidence),
        cache_box: p.cache_box(),
    })
}

fn text_target(p: &Params) -> Result<TextTarget, StepError> {
    Ok(TextTarget {
        text: p.req_string("text")?,
        lang: p.string("lang").map(|l| Lang::parse_lenient(&l)).unwrap_or_default(),
        engine: match p.string("engine") {
            None => EngineChoice::Auto,
            Some(e) => EngineChoice::parse(&e).ok_or_else(|| StepError::invalid("engine", e))?,
        },
        cache_box: p.cache_box(),
        save_to_clipboard: p.bool("save_to_clipboard")?.unwrap_or(false),
        extract_pattern: p.string("extract_pattern").filter(|s| !s.trim().is_empty()),
    })
}

fn loop_spec(p: &Params, defaults: &EngineSettings) -> Result<LoopSpec, StepError> {
    let max_iterations = match p.i64("max_iterations")? {
        Some(m) => m.max(0) as u32,
        None => defaults.default_max_iterations,
    };
    let mode = p.string("mode").unwrap_or_else(|| "fixed".into());
    let mode = match mode.trim() {
        "fixed" | "" => LoopMode::Fixed { times: p.i64("times")?.unwrap_or(1) },
        "until_image" => LoopMode::UntilImage {
            condition_image: PathBuf::from(p.req_string("condition_image")?),
            confidence: p.f64("confidence")?.map(|c| c as f32).unwrap_or(defaults.default_confidence),
        },
        "until_text" => LoopMode::UntilText {
            condition_text: p.req_string("condition_text")?,
            lang: p.string("lang").map(|l| Lang::parse_lenient(&l)).unwrap_or_default(),
        },
        other => return Err(StepError::invalid("mode", other)),
    };
    Ok(LoopSpec { mode, max_iterations })
}

/// Lenient accessors over the raw parameter map. The editor writes numbers
/// as strings, so every numeric read accepts both.
struct Params<'a>(&'a Map<String, Value>);

impl Params<'_> {
    fn string(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn req_string(&self, name: &str) -> Result<String, StepError> {
        self.string(name)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| StepError::MissingParam(name.to_string()))
    }

    fn f64(&self, name: &str) -> Result<Option<f64>, StepError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| StepError::invalid(name, s)),
            Some(other) => Err(StepError::invalid(name, other)),
        }
    }

    fn i64(&self, name: &str) -> Result<Option<i64>, StepError> {
        let Some(v) = self.f64(name)? else { return Ok(None) };
        if !v.is_finite() {
            return Err(StepError::invalid(name, v));
        }
        Ok(Some(v.trunc() as i64))
    }

    fn req_i64(&self, name: &str) -> Result<i64, StepError> {
        self.i64(name)?.ok_or_else(|| StepError::MissingParam(name.to_string()))
    }

    /// Screen coordinates and offsets; out-of-range values are rejected.
    fn i32(&self, name: &str) -> Result<Option<i32>, StepError> {
        match self.i64(name)? {
            None => Ok(None),
            Some(v) => i32::try_from(v).map(Some).map_err(|_| StepError::invalid(name, v)),
        }
    }

    fn req_i32(&self, name: &str) -> Result<i32, StepError> {
        self.i32(name)?.ok_or_else(|| StepError::MissingParam(name.to_string()))
    }

    fn secs(&self, name: &str, default: f64) -> Result<Duration, StepError> {
        let secs = self.f64(name)?.unwrap_or(default);
        if !secs.is_finite() || secs < 0.0 {
            return Err(StepError::invalid(name, secs));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>, StepError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" | "" => Ok(Some(false)),
                _ => Err(StepError::invalid(name, s)),
            },
            Some(Value::Number(n)) => Ok(Some(n.as_f64().unwrap_or(0.0) != 0.0)),
            Some(other) => Err(StepError::invalid(name, other)),
        }
    }

    /// Both coordinates or neither.
    fn point(&self, x: &str, y: &str) -> Result<Option<Point>, StepError> {
        match (self.i32(x)?, self.i32(y)?) {
            (Some(x), Some(y)) => Ok(Some(Point::new(x, y))),
            _ => Ok(None),
        }
    }

    /// `[x1,y1,x2,y2]`; a bare point `[x,y]` widens to `[x,y,x,y]`.
    fn cache_box(&self) -> Option<[i32; 4]> {
        let items = self.0.get("cache_box")?.as_array()?;
        let nums: Vec<i32> = items
            .iter()
            .filter_map(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .filter(|f: &f64| f.is_finite() && (i32::MIN as f64..=i32::MAX as f64).contains(f))
            .map(|f| f as i32)
            .collect();
        if nums.len() != items.len() {
            return None;
        }
        match nums.as_slice() {
            [x, y] => Some([*x, *y, *x, *y]),
            [x1, y1, x2, y2, ..] => Some([*x1, *y1, *x2, *y2]),
            _ => None,
        }
    }
}

/// Width and height of a hint box are both positive.
pub fn is_usable_box(b: &[i32; 4]) -> bool {
    b[2] > b[0] && b[3] > b[1]
}

/// Read a macro file: a flat JSON array of steps.
pub fn load_macro(path: &Path) -> anyhow::Result<Vec<Step>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let steps: Vec<Step> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a macro file", path.display()))?;
    Ok(steps)
}

pub fn save_macro(path: &Path, steps: &[Step]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(steps)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<Action, StepError> {
        let step: Step = serde_json::from_value(v).unwrap();
        Action::parse(&step, &EngineSettings::default())
    }

    #[test]
    fn string_numbers_are_accepted() {
        let a = parse(json!({"action": "FIND_IMAGE", "params": {"path": "b.png", "confidence": "0.9", "cache_box": ["10", 10, 50, 30]}})).unwrap();
        match a {
            Action::FindImage(t) => {
                assert!((t.confidence - 0.9).abs() < 1e-6);
                assert_eq!(t.cache_box, Some([10, 10, 50, 30]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn default_confidence_applies() {
        let a = parse(json!({"action": "IF_IMAGE_FOUND", "params": {"path": "b.png"}})).unwrap();
        assert!(matches!(a, Action::IfImageFound(t) if (t.confidence - 0.8).abs() < 1e-6));
    }

    #[test]
    fn two_element_box_widens_and_is_unusable() {
        let step: Step = serde_json::from_value(json!({"action": "FIND_IMAGE", "params": {"path": "a.png", "cache_box": [5, 6]}})).unwrap();
        let b = Params(&step.params).cache_box().unwrap();
        assert_eq!(b, [5, 6, 5, 6]);
        assert!(!is_usable_box(&b));
    }

    #[test]
    fn unknown_action_loads_but_does_not_parse() {
        let steps: Vec<Step> = serde_json::from_str(r#"[{"action": "TELEPORT"}]"#).unwrap();
        assert_eq!(steps[0].kind(), None);
        let err = Action::parse(&steps[0], &EngineSettings::default()).unwrap_err();
        assert!(matches!(err, StepError::UnknownAction(a) if a == "TELEPORT"));
    }

    #[test]
    fn missing_action_loads_as_unknown() {
        let steps: Vec<Step> = serde_json::from_str(r#"[{"params": {"x": 1}}]"#).unwrap();
        assert_eq!(steps[0].action, "");
        let err = Action::parse(&steps[0], &EngineSettings::default()).unwrap_err();
        assert!(matches!(err, StepError::UnknownAction(a) if a.is_empty()));
        let issues = crate::validate::validate(&steps);
        assert_eq!(issues[0].to_string(), "step 1: unknown action ''");
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let err = parse(json!({"action": "MOVE_TO", "params": {"x": 3000000000i64, "y": 1}})).unwrap_err();
        assert!(matches!(err, StepError::InvalidParam { ref name, ref value } if name == "x" && value == "3000000000"));
        let err = parse(json!({"action": "MOVE_OFFSET", "params": {"x_offset": 1, "y_offset": -3000000000i64}})).unwrap_err();
        assert!(matches!(err, StepError::InvalidParam { ref name, .. } if name == "y_offset"));
        let err = parse(json!({"action": "SCROLL", "params": {"amount": 1e12}})).unwrap_err();
        assert!(matches!(err, StepError::InvalidParam { ref name, .. } if name == "amount"));

        let step = Step::new(ActionKind::FindImage, json!({"path": "a.png", "cache_box": [0, 0, 5e9, 10]}));
        assert_eq!(Params(&step.params).cache_box(), None);
    }

    #[test]
    fn bad_button_defaults_to_left() {
        let a = parse(json!({"action": "CLICK", "params": {"button": "thumb", "clicks": "2"}})).unwrap();
        assert!(matches!(a, Action::Click { button: MouseButton::Left, clicks: 2, at: None, .. }));
    }

    #[test]
    fn non_numeric_coordinate_is_invalid() {
        let err = parse(json!({"action": "MOVE_TO", "params": {"x": "abc", "y": 1}})).unwrap_err();
        assert!(matches!(err, StepError::InvalidParam { ref name, .. } if name == "x"));
        let err = parse(json!({"action": "MOVE_OFFSET", "params": {"x_offset": 3}})).unwrap_err();
        assert!(matches!(err, StepError::MissingParam(ref n) if n == "y_offset"));
    }

    #[test]
    fn loop_modes() {
        let a = parse(json!({"action": "LOOP_START", "params": {"times": "3"}})).unwrap();
        assert_eq!(a, Action::LoopStart(LoopSpec { mode: LoopMode::Fixed { times: 3 }, max_iterations: 1000 }));

        let a = parse(json!({"action": "LOOP_START", "params": {"mode": "until_text", "condition_text": "Done", "max_iterations": 5}})).unwrap();
        assert!(matches!(a, Action::LoopStart(LoopSpec { mode: LoopMode::UntilText { .. }, max_iterations: 5 })));

        assert!(parse(json!({"action": "LOOP_START", "params": {"mode": "forever"}})).is_err());
    }

    #[test]
    fn key_combo_is_normalized() {
        assert_eq!(parse_combo("Ctrl + Shift+S"), vec!["ctrl", "shift", "s"]);
        assert!(parse(json!({"action": "PRESS_KEY", "params": {"key": " "}})).is_err());
    }

    #[test]
    fn text_target_options() {
        let a = parse(json!({"action": "FIND_TEXT", "params": {
            "text": "Total", "lang": "chi_sim", "engine": "rapidocr",
            "save_to_clipboard": "true", "extract_pattern": "\\d+"
        }}))
        .unwrap();
        match a {
            Action::FindText(t) => {
                assert_eq!(t.lang, Lang::ChiSim);
                assert_eq!(t.engine, EngineChoice::Ml);
                assert!(t.save_to_clipboard);
                assert_eq!(t.extract_pattern.as_deref(), Some("\\d+"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cache_hint_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let mut steps = vec![Step::new(ActionKind::FindImage, json!({"path": "a.png"}))];
        steps[0].apply_cache_hint(CacheHint::Set([1, 2, 41, 22]));
        save_macro(&path, &steps).unwrap();

        let mut loaded = load_macro(&path).unwrap();
        assert_eq!(loaded[0].params["cache_box"], json!([1, 2, 41, 22]));
        loaded[0].apply_cache_hint(CacheHint::Clear);
        assert!(!loaded[0].params.contains_key("cache_box"));
    }
}
