use std::fs;
use std::sync::Arc;
use std::time::Instant;

use crate::artifact::RunLayout;
use crate::config::Config;
use crate::error::{PipelineError, RunError};
use crate::graph::PipelineGraph;
use crate::input::{self, FileRef};
use crate::key::Hash32;
use crate::manifest::Manifest;
use crate::runner::{self, RunReport};
use crate::stage::{StageContext, StageKind, StageParams, Stages, task_key};
use crate::utils;

/// The orchestrator: one configuration, one [`Stages`] implementation, any
/// number of runs.
///
/// A run discovers input files, wires the task graph, and executes it
/// against the persisted manifest, so repeated runs over unchanged inputs
/// reduce to cache hits. The pipeline owns no domain logic; everything a
/// stage writes comes from the [`Stages`] implementation it was built
/// around.
pub struct Pipeline<S: Stages> {
    config: Arc<Config>,
    stages: Arc<S>,
}

impl<S: Stages> Pipeline<S> {
    pub fn new(config: Config, stages: S) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            stages: Arc::new(stages),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Scans the configured input directory for files matching the
    /// configured pattern, hashing each one.
    pub fn discover(&self) -> Result<Vec<FileRef>, PipelineError> {
        let files = input::discover(&self.config.paths.input_dir, &self.config.paths.file_pattern)?;
        Ok(files)
    }

    /// The task graph a run over `files` would execute. Useful for
    /// inspection; its `Display` renders a Mermaid flowchart.
    pub fn graph(&self, files: &[FileRef]) -> Result<PipelineGraph, PipelineError> {
        let fingerprint = self.config.fingerprint()?;
        Ok(PipelineGraph::build(&self.config, fingerprint, files)?)
    }

    /// Runs the pipeline, reusing any cached results whose keys and
    /// artifacts are intact.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        self.run_inner(false).await
    }

    /// Runs the pipeline, recomputing every task. Completed tasks still
    /// enter the manifest, so a later [`Pipeline::run`] reuses them.
    pub async fn run_force(&self) -> Result<RunReport, PipelineError> {
        self.run_inner(true).await
    }

    async fn run_inner(&self, force: bool) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let config = &self.config;

        fs::create_dir_all(&config.paths.output_dir)?;
        let layout = RunLayout::new(config.paths.output_dir.clone());

        // Hashing every input is blocking, rayon-parallel work.
        let input_dir = config.paths.input_dir.clone();
        let pattern = config.paths.file_pattern.clone();
        let files = tokio::task::spawn_blocking(move || input::discover(&input_dir, &pattern))
            .await
            .map_err(RunError::from)??;

        if files.is_empty() {
            tracing::warn!(
                "No files matching '{}' under {}",
                config.paths.file_pattern,
                config.paths.input_dir,
            );
        } else {
            tracing::info!(
                "Discovered {} input files {}",
                files.len(),
                utils::as_overhead(started),
            );
        }

        let fingerprint = config.fingerprint()?;
        let graph = PipelineGraph::build(config, fingerprint, &files)?;
        let mut manifest = Manifest::load(&layout);

        if config.alignment.enabled {
            self.align(&layout, &mut manifest, fingerprint, force)
                .await?;
        }

        let report = runner::execute(&graph, config, &self.stages, &mut manifest, force).await?;
        manifest.store(&layout)?;

        tracing::info!("Pipeline finished {}", utils::as_overhead(started));
        Ok(report)
    }

    /// Channel alignment runs once per invocation, before any per-file
    /// task, and is cached under the same keying scheme as graph tasks.
    /// Its failure fails the run: preprocessing output would silently
    /// misregister channels otherwise.
    async fn align(
        &self,
        layout: &RunLayout,
        manifest: &mut Manifest,
        fingerprint: Hash32,
        force: bool,
    ) -> Result<(), PipelineError> {
        let key = task_key(StageParams::Align, None, fingerprint, layout.root(), None);

        if !force && manifest.lookup(key).is_some() {
            tracing::debug!("Reusing cached channel alignment");
            return Ok(());
        }

        let started = Instant::now();
        let ctx = StageContext::new(
            None,
            layout.clone(),
            Arc::clone(&self.config),
            StageParams::Align,
            None,
            None,
        );

        let artifact = self
            .stages
            .align(ctx)
            .await
            .map_err(PipelineError::Alignment)?;
        manifest.record(key, StageKind::Align, None, artifact.into());

        tracing::info!("Aligned channels {}", utils::as_overhead(started));
        Ok(())
    }
}
