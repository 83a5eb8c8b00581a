//! Configuration file support for podsim.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/podsim/config.toml`. Every
//! section is optional and falls back to defaults.

use crate::model::ModelParams;
use crate::session::PodSettings;
use crate::types::PatientParameters;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub patient: PatientParameters,

    #[serde(default)]
    pub pod: PodSettings,

    #[serde(default)]
    pub glucose: GlucoseConfig,

    #[serde(default)]
    pub model: ModelParams,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl DataConfig {
    /// Directory of per-pod report files
    pub fn pods_dir(&self) -> PathBuf {
        self.data_dir.join("pods")
    }

    pub fn glucose_path(&self) -> PathBuf {
        self.data_dir.join("glucose.csv")
    }

    pub fn injections_path(&self) -> PathBuf {
        self.data_dir.join("injections.csv")
    }
}

/// Glucose resampling configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlucoseConfig {
    /// Longest interior gap bridged by interpolation, minutes
    #[serde(default = "default_max_fill_minutes")]
    pub max_fill_minutes: usize,

    /// Use meter readings where the sensor has none
    #[serde(default = "default_include_manual")]
    pub include_manual: bool,
}

impl Default for GlucoseConfig {
    fn default() -> Self {
        Self {
            max_fill_minutes: default_max_fill_minutes(),
            include_manual: default_include_manual(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("podsim")
}

fn default_max_fill_minutes() -> usize {
    15
}

fn default_include_manual() -> bool {
    true
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("podsim").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject physically meaningless settings
    pub fn validate(&self) -> Result<()> {
        if self.patient.weight_kg <= 0.0 || self.patient.height_cm <= 0.0 {
            return Err(Error::Config(format!(
                "patient weight and height must be positive, got {} kg / {} cm",
                self.patient.weight_kg, self.patient.height_cm
            )));
        }
        if self.pod.quantum <= 0.0 || self.pod.lifetime_hours <= 0.0 {
            return Err(Error::Config(
                "pod quantum and lifetime_hours must be positive".into(),
            ));
        }
        if self.pod.initial_reservoir < 0.0 {
            return Err(Error::Config(
                "pod initial_reservoir cannot be negative".into(),
            ));
        }
        self.model.absorption.validate()?;
        self.model.action.validate()?;
        if self.model.trend.window < 3 || self.model.trend.window % 2 == 0 {
            return Err(Error::Config(format!(
                "trend window must be odd and at least 3, got {}",
                self.model.trend.window
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.patient.weight_kg, 50.0);
        assert_eq!(config.pod.quantum, 0.05);
        assert_eq!(config.glucose.max_fill_minutes, 15);
        assert!(config.glucose.include_manual);
        assert_eq!(config.model.trend.window, 41);
        assert!(config.data.data_dir.ends_with("podsim"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[patient]
weight_kg = 72.5
height_cm = 181.0

[model.absorption]
normalize_mass = false

[model.effect]
glucose_scale = 0.05
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.patient.weight_kg, 72.5);
        assert!(!config.model.absorption.normalize_mass);
        assert_eq!(config.model.absorption.slow_rate, 0.0112); // default
        assert_eq!(config.model.effect.glucose_scale, 0.05);
        assert_eq!(config.model.effect.min_trusted_run, 15); // default
        assert_eq!(config.pod.lifetime_hours, 80.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.patient.weight_kg = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.model.trend.window = 40;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.model.action.substeps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.data.data_dir = temp_dir.path().join("data");
        config.glucose.max_fill_minutes = 30;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.data.pods_dir(), temp_dir.path().join("data").join("pods"));
    }
}
