use std::{fmt, path::PathBuf};

use clap::{Args, Parser, ValueEnum};

const CANDLE_SAM_REPO: &str = "https://huggingface.co/lmz/candle-sam/resolve/main";

/// Server configuration. Every flag can also be set through the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "sam-rest", about = "Segment Anything over HTTP")]
pub struct Config {
    #[arg(long, env = "SAM_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, env = "SAM_PORT", default_value_t = 5001)]
    pub port: u16,

    #[arg(short, long, env = "SAM_MODEL_TYPE", value_enum, default_value_t = ModelType::VitB)]
    pub model_type: ModelType,

    /// Directory holding downloaded weights.
    #[arg(long, env = "SAM_MODEL_DIR", default_value = "models")]
    pub model_dir: PathBuf,

    /// Overrides the download location of the weights file.
    #[arg(long, env = "SAM_WEIGHTS_URL")]
    pub weights_url: Option<String>,

    /// Run on CPU even if a GPU is available.
    #[arg(long, env = "SAM_CPU")]
    pub cpu: bool,

    /// Load the model at startup instead of on the first request.
    #[arg(long, env = "SAM_PRELOAD")]
    pub preload: bool,

    /// Maximum number of segments returned by automatic segmentation.
    #[arg(long, env = "SAM_MAX_SEGMENTS", default_value_t = 15)]
    pub max_segments: usize,

    /// Maximum request body size in bytes.
    #[arg(long, env = "SAM_BODY_LIMIT", default_value_t = 32 * 1024 * 1024)]
    pub body_limit: usize,

    #[command(flatten)]
    pub generator: GeneratorConfig,
}

impl Config {
    pub fn weights_path(&self) -> PathBuf {
        self.model_dir.join(self.model_type.weights_file())
    }

    pub fn weights_url(&self) -> Option<String> {
        self.weights_url
            .clone()
            .or_else(|| self.model_type.default_url())
    }
}

/// Automatic mask generation settings.
///
/// Generation runs on the full image only; there are no crop-layer settings.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    #[arg(long, default_value_t = 32)]
    pub points_per_side: usize,

    /// Islands and holes smaller than this many pixels are removed.
    #[arg(long, default_value_t = 100)]
    pub min_mask_region_area: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            points_per_side: 32,
            min_mask_region_area: 100,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// MobileSAM TinyViT encoder.
    #[value(name = "vit_t")]
    VitT,
    #[value(name = "vit_b")]
    VitB,
    #[value(name = "vit_l")]
    VitL,
    #[value(name = "vit_h")]
    VitH,
}

impl ModelType {
    pub fn weights_file(&self) -> &'static str {
        match self {
            ModelType::VitT => "mobile_sam-tiny-vitt.safetensors",
            ModelType::VitB => "sam_vit_b_01ec64.safetensors",
            ModelType::VitL => "sam_vit_l_0b3195.safetensors",
            ModelType::VitH => "sam_vit_h_4b8939.safetensors",
        }
    }

    /// Only the converted ViT-T and ViT-B checkpoints are published.
    pub fn default_url(&self) -> Option<String> {
        match self {
            ModelType::VitT | ModelType::VitB => {
                Some(format!("{}/{}", CANDLE_SAM_REPO, self.weights_file()))
            }
            ModelType::VitL | ModelType::VitH => None,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelType::VitT => "vit_t",
            ModelType::VitB => "vit_b",
            ModelType::VitL => "vit_l",
            ModelType::VitH => "vit_h",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_generator_defaults() {
        let config = Config::try_parse_from(["sam-rest"]).unwrap();
        assert_eq!(config.port, 5001);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.model_type, ModelType::VitB);
        assert_eq!(config.max_segments, 15);
        assert_eq!(config.generator, GeneratorConfig::default());
        assert_eq!(
            config.weights_path(),
            PathBuf::from("models/sam_vit_b_01ec64.safetensors")
        );
    }

    #[test]
    fn large_models_need_explicit_url() {
        let config =
            Config::try_parse_from(["sam-rest", "--model-type", "vit_h", "--model-dir", "w"])
                .unwrap();
        assert_eq!(config.weights_url(), None);
        assert_eq!(
            config.weights_path(),
            PathBuf::from("w/sam_vit_h_4b8939.safetensors")
        );

        let config = Config::try_parse_from([
            "sam-rest",
            "-m",
            "vit_l",
            "--weights-url",
            "http://mirror/vit_l.safetensors",
        ])
        .unwrap();
        assert_eq!(
            config.weights_url().as_deref(),
            Some("http://mirror/vit_l.safetensors")
        );
    }

    #[test]
    fn crop_layers_cannot_be_configured() {
        let config = Config::try_parse_from(["sam-rest", "--points-per-side", "16"]).unwrap();
        assert_eq!(config.generator.points_per_side, 16);
        assert!(Config::try_parse_from(["sam-rest", "--crop-n-layers", "1"]).is_err());
    }
}
