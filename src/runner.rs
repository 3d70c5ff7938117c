use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{Instrument, Level};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::artifact::{Artifact, RunLayout, StageOutput};
use crate::buffer::{TaskRun, wait_for_runs};
use crate::config::Config;
use crate::error::PipelineError;
use crate::gate::ResourceGate;
use crate::graph::{PipelineGraph, TaskHandle};
use crate::key::CacheKey;
use crate::manifest::Manifest;
use crate::stage::{StageContext, StageKind, StageParams, Stages};
use crate::utils;

/// How one task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The stage function ran and returned an artifact.
    Completed,
    /// A prior run's artifact was reused; the stage function never ran.
    Cached,
    /// The stage function returned an error.
    Failed,
    /// A predecessor failed, so this task was never scheduled.
    Skipped,
}

impl TaskStatus {
    pub fn name(self) -> &'static str {
        match self {
            TaskStatus::Completed => "completed",
            TaskStatus::Cached => "cached",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One task's outcome, in completion order within [`RunReport`].
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub stage: StageKind,
    pub file: Option<String>,
    pub key: CacheKey,
    pub status: TaskStatus,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Everything a finished run has to say for itself.
#[derive(Debug)]
pub struct RunReport {
    pub records: Vec<TaskRecord>,
    /// The run-level summary artifact, when the run merge succeeded.
    pub summary: Option<Artifact>,
    pub elapsed: Duration,
}

impl RunReport {
    fn count(&self, status: TaskStatus) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == status)
            .count()
    }

    pub fn completed(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn cached(&self) -> usize {
        self.count(TaskStatus::Cached)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(TaskStatus::Skipped)
    }

    /// True when every task either ran or was served from cache.
    pub fn is_success(&self) -> bool {
        self.records
            .iter()
            .all(|record| matches!(record.status, TaskStatus::Completed | TaskStatus::Cached))
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records
            .iter()
            .filter(|record| record.status == TaskStatus::Failed)
    }
}

struct TaskEvent {
    handle: TaskHandle,
    result: anyhow::Result<StageOutput>,
    elapsed: Duration,
}

/// Executes the task graph.
///
/// Tasks become ready when every predecessor has settled; ready tasks are
/// spawned through a bounded buffer (`execution.buffer_limit`) that drains
/// whole batches in submission order. A task whose key is in the manifest
/// with outputs intact settles as [`TaskStatus::Cached`] without spawning;
/// `force` disables that lookup but completed tasks are still recorded. A
/// failed task fails only its own downstream cone, other branches continue.
pub(crate) async fn execute<S: Stages>(
    graph: &PipelineGraph,
    config: &Arc<Config>,
    stages: &Arc<S>,
    manifest: &mut Manifest,
    force: bool,
) -> Result<RunReport, PipelineError> {
    let started = Instant::now();
    let layout = RunLayout::new(config.paths.output_dir.clone());
    let gate = ResourceGate::new(config.execution.accelerator_slots);
    let limit = config.execution.buffer_limit;

    // Detection models load once per channel, ahead of any task.
    let mut models = HashMap::new();
    for (&channel, path) in config.detect.channels.iter().zip(&config.detect.models) {
        let handle = stages.load_model(path).map_err(PipelineError::Model)?;
        models.insert(channel, handle);
    }

    let span = tracing::span!(Level::INFO, "running_tasks");
    span.pb_set_length(graph.len() as u64);
    span.pb_set_style(&utils::style_bar());
    span.pb_set_message("Running tasks...");

    let mut scheduler = Scheduler::new(graph, span.clone());
    let mut buffer: Vec<TaskRun<TaskEvent>> = Vec::new();
    let mut events: Vec<TaskEvent> = Vec::new();

    while !scheduler.done() {
        // Launch everything currently ready.
        while let Some(handle) = scheduler.next_ready() {
            if !scheduler.runnable(handle) {
                scheduler.settle(handle, TaskStatus::Skipped, Duration::ZERO, None);
                continue;
            }

            let node = graph.task(handle);

            if !force && let Some(output) = manifest.lookup(node.key) {
                tracing::debug!("Reusing cached result for {}", node.label());
                scheduler.outputs.insert(handle, output.clone());
                scheduler.settle(handle, TaskStatus::Cached, Duration::ZERO, None);
                continue;
            }

            let inputs = match node.stage() {
                StageKind::MergeFile | StageKind::MergeRun => scheduler.merge_inputs(handle),
                _ => Vec::new(),
            };

            let model = match node.params {
                StageParams::Detect { channel } => models.get(&channel).cloned(),
                _ => None,
            };

            let ctx = StageContext::new(
                node.file.clone(),
                layout.clone(),
                Arc::clone(config),
                node.params,
                node.needs_gate.then(|| gate.clone()),
                model,
            );

            let label = node.label();
            let task_span = tracing::span!(parent: &span, Level::INFO, "task", name = label.as_str());
            task_span.pb_set_style(&utils::style_task());
            task_span.pb_set_message(&format!("Running {label}"));

            let stages = Arc::clone(stages);
            let future = async move {
                let clock = Instant::now();
                let result = run_stage(stages, ctx, inputs).await;
                TaskEvent {
                    handle,
                    result,
                    elapsed: clock.elapsed(),
                }
            };

            buffer.push(TaskRun::spawn(future.instrument(task_span)));
            wait_for_runs(&mut events, &mut buffer, limit, |event| event).await?;
            scheduler.absorb(&mut events, manifest);
        }

        // Nothing ready; flush the buffer so in-flight tasks can unlock
        // their dependents.
        if !scheduler.done() {
            wait_for_runs(&mut events, &mut buffer, 0, |event| event).await?;
            scheduler.absorb(&mut events, manifest);
        }
    }

    let summary = graph
        .stage_handles(StageKind::MergeRun)
        .next()
        .and_then(|handle| scheduler.outputs.get(&handle))
        .and_then(StageOutput::as_single)
        .cloned();

    let report = RunReport {
        records: scheduler.records,
        summary,
        elapsed: started.elapsed(),
    };

    tracing::info!(
        "Run complete: {} executed, {} cached, {} failed, {} skipped {}",
        report.completed(),
        report.cached(),
        report.failed(),
        report.skipped(),
        utils::as_overhead(started),
    );

    Ok(report)
}

async fn run_stage<S: Stages>(
    stages: Arc<S>,
    ctx: StageContext,
    inputs: Vec<Artifact>,
) -> anyhow::Result<StageOutput> {
    match ctx.params() {
        StageParams::Align => stages.align(ctx).await.map(StageOutput::from),
        StageParams::Preprocess => stages.preprocess(ctx).await.map(StageOutput::from),
        StageParams::SegmentCells { .. } => stages.segment_cells(ctx).await,
        StageParams::SegmentCellsPredict => {
            stages.segment_cells_predict(ctx).await.map(StageOutput::from)
        }
        StageParams::SegmentCellsMerge => {
            stages.segment_cells_merge(ctx).await.map(StageOutput::from)
        }
        StageParams::SegmentCellsDilate => stages.dilate_cells(ctx).await.map(StageOutput::from),
        StageParams::SegmentOther { .. } => stages.segment_other(ctx).await.map(StageOutput::from),
        StageParams::Detect { .. } => stages.detect(ctx).await.map(StageOutput::from),
        StageParams::Track { .. } => stages.track(ctx).await.map(StageOutput::from),
        StageParams::Colocalize { timeseries, .. } => {
            if timeseries {
                stages.colocalize_track(ctx).await.map(StageOutput::from)
            } else {
                stages.colocalize_frame(ctx).await.map(StageOutput::from)
            }
        }
        StageParams::MergeFile => stages.merge_file(ctx, inputs).await.map(StageOutput::from),
        StageParams::MergeRun => stages.merge_run(ctx, inputs).await.map(StageOutput::from),
    }
}

/// Dependency bookkeeping for one run.
///
/// Tracks how many predecessors each task still waits on; a task whose
/// count hits zero joins the ready queue. Every settlement, whatever the
/// status, decrements its dependents, so failure and skip propagate through
/// the same bookkeeping as success.
struct Scheduler<'g> {
    graph: &'g PipelineGraph,
    counts: HashMap<TaskHandle, usize>,
    pending: VecDeque<TaskHandle>,
    statuses: HashMap<TaskHandle, TaskStatus>,
    outputs: HashMap<TaskHandle, StageOutput>,
    records: Vec<TaskRecord>,
    settled: usize,
    span: tracing::Span,
}

impl<'g> Scheduler<'g> {
    fn new(graph: &'g PipelineGraph, span: tracing::Span) -> Self {
        let counts: HashMap<_, _> = graph
            .handles()
            .map(|handle| (handle, graph.predecessors(handle).len()))
            .collect();

        let pending = graph
            .handles()
            .filter(|handle| counts[handle] == 0)
            .collect();

        Self {
            graph,
            counts,
            pending,
            statuses: HashMap::new(),
            outputs: HashMap::new(),
            records: Vec::new(),
            settled: 0,
            span,
        }
    }

    fn done(&self) -> bool {
        self.settled == self.graph.len()
    }

    fn next_ready(&mut self) -> Option<TaskHandle> {
        self.pending.pop_front()
    }

    fn succeeded(&self, handle: TaskHandle) -> bool {
        matches!(
            self.statuses.get(&handle),
            Some(TaskStatus::Completed | TaskStatus::Cached)
        )
    }

    /// Whether a ready task should actually run. Regular tasks need every
    /// predecessor to have succeeded; the run merge needs at least one
    /// successful file and otherwise settles as skipped.
    fn runnable(&self, handle: TaskHandle) -> bool {
        let preds = self.graph.predecessors(handle);
        match self.graph.task(handle).stage() {
            StageKind::MergeRun => {
                preds.is_empty() || preds.iter().any(|&pred| self.succeeded(pred))
            }
            _ => preds.iter().all(|&pred| self.succeeded(pred)),
        }
    }

    /// Predecessor artifacts in wiring order, successful predecessors only.
    fn merge_inputs(&self, handle: TaskHandle) -> Vec<Artifact> {
        self.graph
            .predecessors(handle)
            .iter()
            .filter(|&&pred| self.succeeded(pred))
            .filter_map(|pred| self.outputs.get(pred))
            .flat_map(|output| output.iter().cloned())
            .collect()
    }

    fn settle(
        &mut self,
        handle: TaskHandle,
        status: TaskStatus,
        elapsed: Duration,
        error: Option<String>,
    ) {
        let graph = self.graph;
        let node = graph.task(handle);

        self.records.push(TaskRecord {
            stage: node.stage(),
            file: node.stem().map(str::to_string),
            key: node.key,
            status,
            elapsed,
            error,
        });
        self.statuses.insert(handle, status);
        self.settled += 1;
        self.span.pb_inc(1);

        for dependent in graph.dependents(handle) {
            if let Some(count) = self.counts.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    self.pending.push_back(dependent);
                }
            }
        }
    }

    /// Folds drained task events into the schedule. A result enters the
    /// manifest only when the task's full predecessor set succeeded; a run
    /// merge over a partial file set stays uncached so a later run redoes
    /// it once the missing branches recover.
    fn absorb(&mut self, events: &mut Vec<TaskEvent>, manifest: &mut Manifest) {
        for event in events.drain(..) {
            let graph = self.graph;
            let node = graph.task(event.handle);

            match event.result {
                Ok(output) => {
                    let complete = graph
                        .predecessors(event.handle)
                        .iter()
                        .all(|&pred| self.succeeded(pred));
                    if complete {
                        manifest.record(node.key, node.stage(), node.stem(), output.clone());
                    }
                    self.outputs.insert(event.handle, output);
                    self.settle(event.handle, TaskStatus::Completed, event.elapsed, None);
                }
                Err(err) => {
                    tracing::error!("Task {} failed: {err:#}", node.label());
                    self.settle(
                        event.handle,
                        TaskStatus::Failed,
                        event.elapsed,
                        Some(format!("{err:#}")),
                    );
                }
            }
        }
    }
}
