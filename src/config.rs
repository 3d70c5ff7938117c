use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::key::Hash32;

/// Which structures the single-pass cell segmentation should produce. With
/// [`Selection::Both`] the combined semantics (union vs. per-region choice)
/// are up to the stage implementation; the orchestrator only guarantees that
/// exactly one segmentation task runs and that the selector is part of its
/// cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    Nuclei,
    Cyto,
    Both,
}

impl Selection {
    pub fn as_str(self) -> &'static str {
        match self {
            Selection::Nuclei => "nuclei",
            Selection::Cyto => "cyto",
            Selection::Both => "both",
        }
    }
}

/// The resolved configuration of one pipeline run.
///
/// Loaded once, read-only afterwards. Every enable flag and parameter list
/// here shapes the task graph; the whole structure is fingerprinted into
/// every cache key, so any change invalidates prior artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub paths: Paths,
    #[serde(default)]
    pub alignment: Alignment,
    #[serde(default)]
    pub cells: Cells,
    #[serde(default)]
    pub other: OtherSegmentation,
    #[serde(default)]
    pub detect: Detection,
    #[serde(default)]
    pub acquisition: Acquisition,
    #[serde(default)]
    pub coloc: Colocalization,
    #[serde(default)]
    pub execution: Execution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Paths {
    pub input_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    #[serde(default = "default_pattern")]
    pub file_pattern: String,
}

fn default_pattern() -> String {
    String::from("*.tif")
}

/// Optional file-independent channel alignment executed before any per-file
/// task runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Alignment {
    pub enabled: bool,
    pub directory: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Cells {
    /// Enables the chained predict → merge → dilate strategy instead of a
    /// single segmentation pass.
    pub dual_pass: bool,
    pub selection: Selection,
}

impl Default for Cells {
    fn default() -> Self {
        Self {
            dual_pass: false,
            selection: Selection::Nuclei,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtherSegmentation {
    pub enabled: bool,
    pub channels: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Detection {
    pub channels: Vec<u32>,
    /// Per-channel model paths, zipped with `channels`. Empty means stages
    /// load whatever they need themselves.
    pub models: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Acquisition {
    pub three_dim: bool,
    pub timeseries: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Colocalization {
    pub enabled: bool,
    /// (reference, transform) channel pairs; both sides must be detection
    /// channels.
    pub pairs: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Execution {
    /// Pending-buffer threshold of the submitter/drainer.
    pub buffer_limit: usize,
    /// Permit count of the accelerator gate.
    pub accelerator_slots: usize,
    /// When false, no gate is handed to any stage and accelerated stages run
    /// unrestricted.
    pub use_accelerator: bool,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            buffer_limit: 6,
            accelerator_slots: 1,
            use_accelerator: false,
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path.as_ref())?)
    }

    /// Structural checks the graph builder depends on. Domain-level
    /// validation of parameter values stays with the caller.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.accelerator_slots == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        check_unique("detect.channels", &self.detect.channels)?;
        check_unique("other.channels", &self.other.channels)?;

        if !self.detect.models.is_empty() && self.detect.models.len() != self.detect.channels.len()
        {
            return Err(ConfigError::ModelCount {
                models: self.detect.models.len(),
                channels: self.detect.channels.len(),
            });
        }

        if self.coloc.enabled {
            for &(reference, transform) in &self.coloc.pairs {
                for channel in [reference, transform] {
                    if !self.detect.channels.contains(&channel) {
                        return Err(ConfigError::UnknownColocChannel {
                            reference,
                            transform,
                            missing: channel,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Tracking applies to 3D and time-series acquisitions.
    pub fn tracking_active(&self) -> bool {
        self.acquisition.three_dim || self.acquisition.timeseries
    }

    /// Canonical digest of the whole configuration, mixed into every cache
    /// key.
    pub fn fingerprint(&self) -> Result<Hash32, ConfigError> {
        Ok(Hash32::hash(serde_json::to_vec(self)?))
    }
}

fn check_unique(list: &'static str, channels: &[u32]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for &channel in channels {
        if !seen.insert(channel) {
            return Err(ConfigError::DuplicateChannel { list, channel });
        }
    }
    Ok(())
}
