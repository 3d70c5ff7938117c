#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod artifact;
mod buffer;
mod config;
mod error;
mod gate;
mod graph;
mod input;
mod key;
#[cfg(feature = "logging")]
mod logging;
mod manifest;
mod merge;
mod pipeline;
mod runner;
mod stage;
mod utils;

pub use crate::artifact::{Artifact, ArtifactKind, RunLayout, StageOutput};
pub use crate::buffer::{TaskRun, wait_for_runs};
pub use crate::config::{
    Acquisition, Alignment, Cells, Colocalization, Config, Detection, Execution,
    OtherSegmentation, Paths, Selection,
};
pub use crate::error::*;
pub use crate::gate::{GatePermit, ResourceGate};
pub use crate::graph::{PipelineGraph, TaskHandle, TaskNode};
pub use crate::input::{FileRef, discover};
pub use crate::key::{CacheKey, CacheKeyBuilder, Hash32};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::manifest::{Manifest, ManifestEntry};
pub use crate::merge::concat_tables;
pub use crate::pipeline::Pipeline;
pub use crate::runner::{RunReport, TaskRecord, TaskStatus};
pub use crate::stage::{ModelHandle, StageContext, StageKind, StageParams, Stages};
pub use crate::utils::as_overhead;
