use anyhow::{bail, Context, Result};
use facemark_core::{LocatorConfig, ModelPaths, NormalizerConfig, PipelineConfig, WatermarkSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: optional TOML file, then `FACEMARK_*` environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: Option<PathBuf>,
    /// Maximum descriptor distance for a search match. No default: the
    /// right value depends on the encoding model in use.
    pub match_threshold: Option<f64>,
    /// Worker count for `ingest` (defaults to available parallelism).
    pub jobs: Option<usize>,
    pub font_path: Option<PathBuf>,
    pub normalizer: NormalizerConfig,
    pub locator: LocatorConfig,
    pub watermark: WatermarkSpec,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make `ingest` and `search` disagree.
    pub fn validate(&self) -> Result<()> {
        if let Some(width) = self.watermark.max_width {
            if width != self.normalizer.max_width {
                bail!(
                    "watermark.max_width ({width}) differs from normalizer.max_width ({}); \
                     set only normalizer.max_width",
                    self.normalizer.max_width
                );
            }
        }
        self.watermark.validate()?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("FACEMARK_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(dir));
        }
        if let Some(threshold) = env_parse::<f64>("FACEMARK_MATCH_THRESHOLD") {
            self.match_threshold = Some(threshold);
        }
        if let Some(max_width) = env_parse::<u32>("FACEMARK_MAX_WIDTH") {
            self.normalizer.max_width = max_width;
        }
        if let Some(size) = env_parse::<usize>("FACEMARK_DETECTION_SIZE") {
            self.locator.input_size = size;
        }
        if let Ok(text) = std::env::var("FACEMARK_WATERMARK_TEXT") {
            self.watermark.text = text;
        }
        if let Ok(font) = std::env::var("FACEMARK_FONT_PATH") {
            self.font_path = Some(PathBuf::from(font));
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        let dir = self
            .model_dir
            .clone()
            .unwrap_or_else(facemark_core::default_model_dir);
        ModelPaths::in_dir(&dir)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            normalizer: self.normalizer.clone(),
            locator: self.locator.clone(),
            font_path: self.font_path.clone(),
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
