use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Broad shape of a persisted result. Tables are CSV (detection, tracking,
/// colocalization, summaries), rasters are TIFF (preprocessed stacks, masks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Table,
    Raster,
}

/// Opaque handle to one persisted result.
///
/// Tasks communicate exclusively through artifacts materialized at
/// deterministic paths; no in-memory values cross task boundaries. This is
/// what makes cross-run reuse possible: if the cache key matches and the path
/// still exists, the artifact stands in for a fresh computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: Utf8PathBuf,
    pub kind: ArtifactKind,
}

impl Artifact {
    pub fn table(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ArtifactKind::Table,
        }
    }

    pub fn raster(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ArtifactKind::Raster,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// What one stage invocation produced: a single artifact for most stages, or
/// a map from a descriptive key to an artifact for multi-output stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutput {
    Single(Artifact),
    Keyed(BTreeMap<String, Artifact>),
}

impl StageOutput {
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        match self {
            StageOutput::Single(artifact) => {
                Box::new(std::iter::once(artifact)) as Box<dyn Iterator<Item = &Artifact>>
            }
            StageOutput::Keyed(map) => Box::new(map.values()),
        }
    }

    /// True when every referenced path is still on disk. Gatekeeper for
    /// honoring a manifest entry.
    pub fn exists(&self) -> bool {
        self.iter().all(Artifact::exists)
    }

    pub fn as_single(&self) -> Option<&Artifact> {
        match self {
            StageOutput::Single(artifact) => Some(artifact),
            StageOutput::Keyed(_) => None,
        }
    }
}

impl From<Artifact> for StageOutput {
    fn from(artifact: Artifact) -> Self {
        StageOutput::Single(artifact)
    }
}

/// The deterministic on-disk layout of one run.
///
/// Every task's output path is a pure function of (output root, stage,
/// channel, file stem), so downstream tasks and later runs can locate
/// artifacts without passing values around. The dual-pass segmentation chain
/// keeps its intermediates in their own directories but its terminal dilate
/// step lands at the same path as single-pass segmentation, which keeps
/// downstream stages agnostic to the strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: Utf8PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn alignment(&self) -> Utf8PathBuf {
        self.root.join("alignment.csv")
    }

    pub fn preprocessed(&self, file: &str) -> Utf8PathBuf {
        self.root.join("preprocessed").join(format!("{file}.tif"))
    }

    pub fn cells(&self, file: &str) -> Utf8PathBuf {
        self.root
            .join("segmentation_cells")
            .join(format!("{file}.tif"))
    }

    pub fn cells_predict(&self, file: &str) -> Utf8PathBuf {
        self.root
            .join("segmentation_cells_predict")
            .join(format!("{file}.tif"))
    }

    pub fn cells_merge(&self, file: &str) -> Utf8PathBuf {
        self.root
            .join("segmentation_cells_merge")
            .join(format!("{file}.tif"))
    }

    pub fn other(&self, channel: u32, file: &str) -> Utf8PathBuf {
        self.root
            .join(format!("segmentation_c{channel}"))
            .join(format!("{file}.tif"))
    }

    pub fn detection(&self, channel: u32, file: &str) -> Utf8PathBuf {
        self.root
            .join(format!("detection_c{channel}"))
            .join(format!("{file}.csv"))
    }

    pub fn tracking(&self, channel: u32, file: &str) -> Utf8PathBuf {
        self.root
            .join(format!("tracking_c{channel}"))
            .join(format!("{file}.csv"))
    }

    pub fn colocalization(&self, reference: u32, transform: u32, file: &str) -> Utf8PathBuf {
        self.root
            .join(format!("colocalization_c{reference}-c{transform}"))
            .join(format!("{file}.csv"))
    }

    pub fn file_summary(&self, file: &str) -> Utf8PathBuf {
        self.root.join("summary").join(format!("{file}.csv"))
    }

    pub fn run_summary(&self) -> Utf8PathBuf {
        self.root.join("summary.csv")
    }

    pub(crate) fn manifest(&self) -> Utf8PathBuf {
        self.root.join(".manifest.cbor")
    }

    /// Creates the parent directory of an output path.
    pub fn prepare(path: &Utf8Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
