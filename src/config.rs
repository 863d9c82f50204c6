use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Describe what you see in this image.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub system_prompt: String,
    pub inference: InferenceConfig,
    pub capture: CaptureConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            inference: InferenceConfig::default(),
            capture: CaptureConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Shape of a KoboldCpp `/api/v1/generate` request, minus the per-call
/// image and prompt. Bump `schema_version` when a field changes meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub schema_version: u32,
    pub url: String,
    pub request_timeout_secs: u64,
    pub jpeg_quality: u8,
    pub n: u32,
    pub max_context_length: u32,
    pub max_length: u32,
    pub rep_pen: f32,
    pub rep_pen_range: u32,
    pub rep_pen_slope: f32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub top_a: f32,
    pub typical: f32,
    pub tfs: f32,
    pub sampler_order: Vec<u32>,
    pub memory: String,
    pub trim_stop: bool,
    /// Fixed request key. `None` generates a fresh key per request.
    pub genkey: Option<String>,
    pub min_p: f32,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub smoothing_factor: f32,
    pub banned_tokens: Vec<String>,
    pub render_special: bool,
    pub presence_penalty: f32,
    pub logit_bias: HashMap<String, f32>,
    pub quiet: bool,
    pub stop_sequence: Vec<String>,
    pub use_default_badwordsids: bool,
    pub bypass_eos: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            url: "http://localhost:5001/api/v1/generate".to_string(),
            request_timeout_secs: 60,
            jpeg_quality: 85,
            n: 1,
            max_context_length: 8192,
            max_length: 100,
            rep_pen: 1.15,
            rep_pen_range: 320,
            rep_pen_slope: 0.7,
            temperature: 0.3,
            top_p: 1.0,
            top_k: 0,
            top_a: 0.0,
            typical: 1.0,
            tfs: 1.0,
            sampler_order: vec![6, 0, 1, 3, 4, 2, 5],
            memory: "<|start_header_id|>system<|end_header_id|>\n\n <｜begin_of_sentence｜>{prompt}\n\n"
                .to_string(),
            trim_stop: true,
            genkey: Some("KCPP4535".to_string()),
            min_p: 0.1,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            smoothing_factor: 0.0,
            banned_tokens: Vec::new(),
            render_special: false,
            presence_penalty: 0.0,
            logit_bias: HashMap::new(),
            quiet: true,
            stop_sequence: vec![
                "<|eot_id|><|start_header_id|>user<|end_header_id|>".to_string(),
                "<|eot_id|><|start_header_id|>assistant<|end_header_id|>".to_string(),
            ],
            use_default_badwordsids: false,
            bypass_eos: false,
        }
    }
}

impl InferenceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Upper bound on width * height of the image sent to the model.
    pub max_pixels: u64,
    pub screenshot_dir: String,
    pub hide_overlay_during_capture: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_pixels: 1_800_000,
            screenshot_dir: "screenshots".to_string(),
            hide_overlay_during_capture: true,
        }
    }
}

impl CaptureConfig {
    pub fn screenshot_path(&self, data_dir: &Path) -> PathBuf {
        let dir = Path::new(&self.screenshot_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            data_dir.join(dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    pub capture_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            capture_timeout_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

impl AppConfig {
    pub fn load(app_data: &Path) -> Self {
        let config_path = app_data.join("config.json");
        let mut config = if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    log::warn!("Invalid {}: {}. Using defaults.", config_path.display(), e);
                    Self::default()
                }),
                Err(_) => Self::default(),
            }
        } else {
            let c = Self::default();
            c.save(app_data);
            c
        };

        if let Ok(url) = std::env::var("SCREENWATCH_URL") {
            if !url.is_empty() {
                config.inference.url = url;
            }
        }
        if let Ok(prompt) = std::env::var("SCREENWATCH_PROMPT") {
            if !prompt.is_empty() {
                config.system_prompt = prompt;
            }
        }

        config
    }

    pub fn save(&self, app_data: &Path) {
        let config_path = app_data.join("config.json");
        match serde_json::to_string_pretty(self) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&config_path, content) {
                    log::warn!("Could not write {}: {}", config_path.display(), e);
                }
            }
            Err(e) => log::warn!("Could not serialize config: {}", e),
        }
    }
}

/// `$XDG_DATA_HOME/screenwatch` or the platform equivalent.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("screenwatch")
}
