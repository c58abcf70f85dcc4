//! Configuration management for camfusion
//!
//! One TOML file holds the settings of every pipeline: alignment, ghost
//! detection, HDR/DRO, averaging and panorama stitching. Missing sections
//! and fields fall back to their defaults.

use crate::align::{AlignConfig, MatchCost};
use crate::avg::brighten::AvgConfig;
use crate::avg::AccumulatorSettings;
use crate::errors::{ProcessorError, Result};
use crate::ghost::GhostConfig;
use crate::hdr::{hdr_alpha, ContrastEnhancement, FusionEngine, HdrOptions};
use crate::panorama::PanoramaOptions;
use crate::types::CaptureMetadata;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub align: AlignConfig,
    pub ghost: GhostConfig,
    pub hdr: HdrConfig,
    pub avg: AvgConfig,
    pub panorama: PanoramaOptions,
}

/// HDR and DRO settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdrConfig {
    #[serde(flatten)]
    pub options: HdrOptions,
    /// Decides the contrast strength per capture, overriding `alpha` for
    /// brackets
    pub contrast_enhancement: ContrastEnhancement,
    /// Matching cost used when aligning exposure brackets
    pub align_cost: MatchCost,
}

impl Default for HdrConfig {
    fn default() -> Self {
        Self {
            options: HdrOptions::default(),
            contrast_enhancement: ContrastEnhancement::Smart,
            align_cost: MatchCost::Normalized,
        }
    }
}

impl HdrConfig {
    /// Options for one capture with the contrast strength resolved
    pub fn options_for(&self, metadata: &CaptureMetadata, n_frames: usize) -> HdrOptions {
        HdrOptions {
            alpha: hdr_alpha(
                self.contrast_enhancement,
                metadata.iso,
                metadata.exposure_time_ns,
                n_frames,
            ),
            ..self.options.clone()
        }
    }
}

fn io_error(action: &str, path: &Path, e: impl std::fmt::Display) -> ProcessorError {
    ProcessorError::invalid_config(format!("Failed to {} {:?}: {}", action, path, e))
}

impl FusionConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| io_error("read", path, e))?;
        let config: FusionConfig =
            toml::from_str(&contents).map_err(|e| io_error("parse", path, e))?;
        config.validate()?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_error("create directory for", path, e))?;
            }
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| io_error("serialize", path, e))?;
        fs::write(path, toml_string).map_err(|e| io_error("write", path, e))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("camfusion.toml")
    }

    /// Load from default location, falling back to defaults on any error
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.align.validate()?;
        self.ghost.validate()?;
        self.hdr.options.validate()?;
        self.avg.validate()?;
        self.panorama.validate()?;
        Ok(())
    }

    /// Engine for HDR brackets and single-frame DRO
    pub fn fusion_engine(&self) -> Result<FusionEngine> {
        FusionEngine::new(
            AlignConfig {
                cost: self.hdr.align_cost,
                ..self.align.clone()
            },
            self.ghost.clone(),
        )
    }

    pub fn accumulator_settings(&self) -> AccumulatorSettings {
        AccumulatorSettings {
            align: self.align.clone(),
            ghost: self.ghost.clone(),
            avg: self.avg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdr::tonemap::TonemapAlgorithm;

    #[test]
    fn test_default_config() {
        let config = FusionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hdr.align_cost, MatchCost::Normalized);
        assert_eq!(config.hdr.contrast_enhancement, ContrastEnhancement::Smart);
    }

    #[test]
    fn test_config_validation() {
        let mut bad = FusionConfig::default();
        bad.align.levels = 9;
        assert!(matches!(
            bad.validate(),
            Err(ProcessorError::InvalidConfig(_))
        ));

        let mut bad_panorama = FusionConfig::default();
        bad_panorama.panorama.pics_per_screen = 0.0;
        assert!(bad_panorama.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("camfusion.toml");

        let mut config = FusionConfig::default();
        config.hdr.options.tonemap = TonemapAlgorithm::Filmic;
        config.avg.max_gain = 3.0;
        config.save_to_file(&path).unwrap();

        let loaded = FusionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_toml_format() {
        let toml_string = toml::to_string_pretty(&FusionConfig::default()).unwrap();
        assert!(toml_string.contains("[align]"));
        assert!(toml_string.contains("[ghost]"));
        assert!(toml_string.contains("[hdr]"));
        assert!(toml_string.contains("[avg]"));
        assert!(toml_string.contains("[panorama]"));
        assert!(toml_string.contains("contrast_enhancement"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[panorama]\npics_per_screen = 4.0\n").unwrap();

        let loaded = FusionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.panorama.pics_per_screen, 4.0);
        assert_eq!(loaded.align, AlignConfig::default());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[align]\nlevels = 12\n").unwrap();
        assert!(FusionConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let loaded = FusionConfig::load_from_file("nonexistent_camfusion.toml").unwrap();
        assert_eq!(loaded, FusionConfig::default());
    }

    #[test]
    fn test_options_for_resolves_alpha() {
        let config = FusionConfig::default();
        let long = CaptureMetadata::new(100, 1_000_000_000, 1.0);
        assert_eq!(config.hdr.options_for(&long, 3).alpha, 0.0);
        assert_eq!(config.hdr.options_for(&long, 1).alpha, 0.5);
    }
}
