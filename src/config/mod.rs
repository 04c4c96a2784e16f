// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Application settings.
//!
//! Settings are read from a YAML file, or TOML when the file name ends
//! with `.toml`. Every field has a default so partial files are accepted.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::mix::MatchPolicy;

/// Settings of the synchronization pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Log level: error, warn, info, debug or trace
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Number of song mixes kept by the mix manager
    #[serde(default = "default_mix_cache_capacity")]
    pub mix_cache_capacity: usize,
    /// Directory holding default rhythm mixes (`<rhythm id>.mix.yaml`)
    #[serde(default)]
    pub rhythm_mix_dir: Option<PathBuf>,
    /// Voice name letters used when matching channels between mixes
    #[serde(default = "default_name_prefix_len")]
    pub name_prefix_len: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mix_cache_capacity() -> usize {
    8
}

fn default_name_prefix_len() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mix_cache_capacity: default_mix_cache_capacity(),
            rhythm_mix_dir: None,
            name_prefix_len: default_name_prefix_len(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML or TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let is_toml = path
            .as_ref()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Parse settings from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Parse settings from TOML string
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse TOML configuration")
    }

    /// Serialize to YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration to YAML")
    }

    /// Save settings to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = self.to_yaml()?;
        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config file: {:?}", path.as_ref()))
    }

    /// Matching heuristics for mix import and adaptation
    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy::new(self.name_prefix_len.max(1))
    }
}
