use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "cube-vision")]
#[command(about = "Classify the nine tile colors of a photographed Rubik's cube face")]
pub struct CliArgs {
    #[arg(long, help = "Path to the face image (PNG, JPEG, BMP or WebP)")]
    pub image: PathBuf,

    #[arg(long, help = "TOML configuration file; built-in defaults when omitted")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Override thresholds.tile")]
    pub tile_threshold: Option<f32>,

    #[arg(long, help = "Override thresholds.global")]
    pub global_threshold: Option<f32>,

    #[arg(long, help = "Never call the vision model, even on low confidence")]
    pub no_fallback: bool,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON lines")]
    pub log_json: bool,
}

impl CliArgs {
    pub fn apply_overrides(&self, config: &mut super::CubeVisionConfig) {
        if let Some(tile) = self.tile_threshold {
            config.thresholds.tile = tile;
        }
        if let Some(global) = self.global_threshold {
            config.thresholds.global = global;
        }
        if self.no_fallback {
            config.fallback.enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CubeVisionConfig;

    #[test]
    fn test_overrides_apply_on_top_of_file_config() {
        let args = CliArgs::parse_from([
            "cube-vision",
            "--image",
            "face.png",
            "--tile-threshold",
            "0.5",
            "--no-fallback",
        ]);

        let mut config = CubeVisionConfig::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.thresholds.tile, 0.5);
        assert_eq!(config.thresholds.global, 0.6);
        assert!(!config.fallback.enabled);
    }
}
