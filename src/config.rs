//! Build settings: YAML file, then environment, then command-line flags.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::compiler::DEFAULT_FPS;
use crate::error_codes::CodedError;
use crate::layers::DEFAULT_BAND_WIDTH;
use crate::proposals::{DEFAULT_MAX_PROCESSED, DEFAULT_SUGGEST_LIMIT};

pub const ENV_FPS: &str = "AUTOEDIT_FPS";
pub const ENV_BAND_WIDTH: &str = "AUTOEDIT_BAND_WIDTH";
pub const ENV_SCAFFOLD: &str = "AUTOEDIT_SCAFFOLD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub fps: f64,
    pub band_width: i64,
    pub scaffold: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub max_processed: usize,
    pub suggest_limit: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            band_width: DEFAULT_BAND_WIDTH,
            scaffold: None,
            model_path: None,
            max_processed: DEFAULT_MAX_PROCESSED,
            suggest_limit: DEFAULT_SUGGEST_LIMIT,
        }
    }
}

/// Values given on the command line; `None` leaves the lower layer in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub fps: Option<f64>,
    pub band_width: Option<i64>,
    pub scaffold: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

impl BuildConfig {
    /// Reads a YAML file. An empty file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|error| {
            anyhow!(CodedError::usage("CONFIG_PARSE", format!("config is not valid YAML: {error}")))
        })
    }

    /// Layers file, environment, and flags, then validates the result.
    pub fn resolve(file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_FPS) {
            self.fps = parse_env(ENV_FPS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_BAND_WIDTH) {
            self.band_width = parse_env(ENV_BAND_WIDTH, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SCAFFOLD).filter(|raw| !raw.trim().is_empty()) {
            self.scaffold = Some(PathBuf::from(raw.trim()));
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(fps) = overrides.fps {
            self.fps = fps;
        }
        if let Some(band_width) = overrides.band_width {
            self.band_width = band_width;
        }
        if let Some(scaffold) = &overrides.scaffold {
            self.scaffold = Some(scaffold.clone());
        }
        if let Some(model_path) = &overrides.model_path {
            self.model_path = Some(model_path.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(anyhow!(CodedError::usage(
                "CONFIG_INVALID",
                format!("fps must be a positive number, got {}", self.fps),
            )
            .with_details(json!({ "field": "fps" }))));
        }
        if self.band_width < 1 {
            return Err(anyhow!(CodedError::usage(
                "CONFIG_INVALID",
                format!("band_width must be at least 1, got {}", self.band_width),
            )
            .with_details(json!({ "field": "band_width" }))));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        anyhow!(CodedError::usage(
            "CONFIG_ENV",
            format!("environment variable {key} has an invalid value: {raw}"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::{BuildConfig, ConfigOverrides};
    use crate::error_codes::find_coded_error;

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(BuildConfig::from_yaml("  \n").expect("empty config"), BuildConfig::default());
    }

    #[test]
    fn flags_beat_env_and_env_beats_file() {
        let mut config = BuildConfig::from_yaml("fps: 30\nband_width: 4\nsuggest_limit: 5\n")
            .expect("config should parse");
        let env: HashMap<&str, &str> = [("AUTOEDIT_FPS", "24"), ("AUTOEDIT_SCAFFOLD", "base.ymmp")]
            .into_iter()
            .collect();
        config
            .apply_env(|key| env.get(key).map(|value| value.to_string()))
            .expect("env should apply");
        assert_eq!(config.fps, 24.0);
        assert_eq!(config.band_width, 4);
        assert_eq!(config.scaffold, Some(PathBuf::from("base.ymmp")));

        config.apply_overrides(&ConfigOverrides {
            fps: Some(59.94),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.fps, 59.94);
        assert_eq!(config.suggest_limit, 5);
    }

    #[test]
    fn invalid_values_are_usage_errors() {
        let mut config = BuildConfig::default();
        config.fps = 0.0;
        let error = config.validate().expect_err("zero fps should be rejected");
        assert_eq!(find_coded_error(&error).map(|coded| coded.code), Some("CONFIG_INVALID"));

        let mut config = BuildConfig::default();
        config.band_width = 0;
        assert!(config.validate().is_err());

        let mut config = BuildConfig::default();
        let error = config
            .apply_env(|key| (key == "AUTOEDIT_BAND_WIDTH").then(|| "wide".to_owned()))
            .expect_err("non-numeric band width should fail");
        assert_eq!(find_coded_error(&error).map(|coded| coded.code), Some("CONFIG_ENV"));

        assert!(BuildConfig::from_yaml("unknown_key: 1").is_err());
    }
}
