#[cfg(feature = "cli")]
pub mod cli;

use crate::domain::model::CanonicalColor;
use crate::utils::error::{CubeError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_positive_number, validate_range, validate_required_field,
    validate_url, Validate,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Upper bound on concurrent classifications per pipeline.
pub const MAX_CONCURRENT_LIMIT: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CubeVisionConfig {
    pub image: ImageConfig,
    pub sampling: SamplingConfig,
    pub classifier: ClassifierConfig,
    pub thresholds: Thresholds,
    pub fallback: FallbackConfig,
    pub pipeline: PipelineConfig,
}

/// Geometry and payload limits for the preprocessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub max_bytes: usize,
    /// Long side, in pixels, that larger images are downscaled to.
    pub working_resolution: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            min_dimension: 30,
            max_dimension: 8192,
            max_bytes: 20 * 1024 * 1024,
            working_resolution: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Fraction of the tile size trimmed from each side before sampling.
    pub inset: f32,
    /// Max per-channel distance from the median for a pixel to count as uniform.
    pub uniformity_tolerance: u8,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            inset: 0.2,
            uniformity_tolerance: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub lightness_weight: f32,
    /// Optional sRGB overrides for the reference centroids, keyed by color code.
    pub reference: BTreeMap<String, [u8; 3]>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            lightness_weight: 0.5,
            reference: BTreeMap::new(),
        }
    }
}

/// Accept/escalate thresholds. A CV result is accepted only when the weakest
/// tile reaches `tile` and the mean reaches `global`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub tile: f32,
    pub global: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            tile: 0.35,
            global: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Ollama,
    Cloudrun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub service_type: ServiceType,
    pub endpoint: String,
    pub model: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub auth_token: Option<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: ServiceType::Ollama,
            endpoint: "http://localhost:11434".to_string(),
            model: "gemma3:12b".to_string(),
            timeout_ms: 60_000,
            max_retries: 2,
            backoff_ms: 250,
            auth_token: None,
        }
    }
}

impl FallbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Total time budget for one classification, CV and fallback included.
    pub deadline_ms: u64,
    pub max_concurrent: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 90_000,
            max_concurrent: 4,
        }
    }
}

impl PipelineConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl CubeVisionConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(CubeError::Io)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| CubeError::InvalidConfigValue {
            field: "toml_parsing".to_string(),
            value: String::new(),
            reason: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${VISION_TOKEN})，未設定的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| CubeError::Internal {
            message: format!("env substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn validate_config(&self) -> Result<()> {
        let image = &self.image;
        validate_positive_number("image.min_dimension", image.min_dimension, 3)?;
        if image.max_dimension < image.min_dimension {
            return Err(CubeError::InvalidConfigValue {
                field: "image.max_dimension".to_string(),
                value: image.max_dimension.to_string(),
                reason: format!("Must not be below image.min_dimension ({})", image.min_dimension),
            });
        }
        validate_positive_number("image.max_bytes", image.max_bytes, 1)?;
        validate_positive_number("image.working_resolution", image.working_resolution, image.min_dimension)?;

        validate_range("sampling.inset", self.sampling.inset, 0.0, 0.45)?;
        validate_range("classifier.lightness_weight", self.classifier.lightness_weight, 0.0, 2.0)?;
        for code in self.classifier.reference.keys() {
            if CanonicalColor::from_code(code).is_none() {
                return Err(CubeError::InvalidConfigValue {
                    field: "classifier.reference".to_string(),
                    value: code.clone(),
                    reason: "Keys must be one of R, G, B, O, Y, W".to_string(),
                });
            }
        }
        validate_range("thresholds.tile", self.thresholds.tile, 0.0, 1.0)?;
        validate_range("thresholds.global", self.thresholds.global, 0.0, 1.0)?;

        let fallback = &self.fallback;
        if fallback.enabled {
            validate_url("fallback.endpoint", &fallback.endpoint)?;
            validate_non_empty_string("fallback.model", &fallback.model)?;
            validate_positive_number("fallback.timeout_ms", fallback.timeout_ms, 1)?;
            validate_range("fallback.max_retries", fallback.max_retries, 0, 10)?;
            if fallback.service_type == ServiceType::Cloudrun {
                let token = validate_required_field("fallback.auth_token", &fallback.auth_token)?;
                // an unresolved ${VAR} placeholder is as good as missing
                if token.starts_with("${") {
                    return Err(CubeError::MissingConfig {
                        field: "fallback.auth_token".to_string(),
                    });
                }
                validate_non_empty_string("fallback.auth_token", token)?;
            }
        }

        validate_positive_number("pipeline.deadline_ms", self.pipeline.deadline_ms, 1)?;
        validate_range(
            "pipeline.max_concurrent",
            self.pipeline.max_concurrent,
            1,
            MAX_CONCURRENT_LIMIT,
        )?;

        Ok(())
    }
}

impl Validate for CubeVisionConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
