use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const MAX_RECENT: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub ocr: OcrSettings,
    pub recent_files: Vec<PathBuf>,
    pub skip_confirm: bool,
    pub persist_cache_hints: bool,
}

/// Tuning knobs for target resolution and loop pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub scales: Vec<f32>,
    pub quick_check_scales: Vec<f32>,
    pub early_exit_score: f32,
    pub cache_box_padding: i32,
    pub template_cache_size: usize,
    pub enable_global_fallback: bool,
    pub loop_check_interval_ms: u64,
    pub loop_cooldown_ms: u64,
    pub wait_increment_ms: u64,
    pub clipboard_retries: u32,
    pub clipboard_retry_delay_ms: u64,
    pub activate_settle_ms: u64,
    pub default_max_iterations: u32,
    pub default_confidence: f32,
    /// Workers for template correlation; 0 uses every core.
    pub match_threads: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scales: vec![1.0, 0.9, 1.1, 0.8, 1.2],
            quick_check_scales: vec![1.0, 0.9, 1.1],
            early_exit_score: 0.95,
            cache_box_padding: 50,
            template_cache_size: 500,
            enable_global_fallback: true,
            loop_check_interval_ms: 200,
            loop_cooldown_ms: 50,
            wait_increment_ms: 100,
            clipboard_retries: 3,
            clipboard_retry_delay_ms: 200,
            activate_settle_ms: 500,
            default_max_iterations: 1000,
            default_confidence: 0.8,
            match_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Overrides every step's engine when set to anything but "auto".
    pub force_engine: Option<String>,
    pub tesseract_cmd: Option<PathBuf>,
    pub tessdata_dir: Option<PathBuf>,
    pub detection_model: Option<PathBuf>,
    pub recognition_model: Option<PathBuf>,
}

impl Settings {
    /// Missing or malformed files yield defaults.
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| match serde_json::from_str(&s) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("ignoring malformed settings {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Move `file` to the front of the recent list.
    pub fn touch_recent(&mut self, file: &Path) {
        self.recent_files.retain(|p| p != file);
        self.recent_files.insert(0, file.to_path_buf());
        self.recent_files.truncate(MAX_RECENT);
    }
}
