use std::collections::BTreeMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::config::Config;
use crate::error::GraphError;
use crate::input::FileRef;
use crate::key::{CacheKey, CacheKeyBuilder, Hash32};
use crate::stage::{StageKind, StageParams, task_key};

/// Stable identifier of a task within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(NodeIndex);

/// One vertex of the task graph: a stage invocation bound to one input file
/// (or to the whole run), together with its cache key and its ordered
/// predecessors.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub params: StageParams,
    pub file: Option<FileRef>,
    pub key: CacheKey,
    pub(crate) needs_gate: bool,
    preds: Vec<TaskHandle>,
}

impl TaskNode {
    pub fn stage(&self) -> StageKind {
        self.params.kind()
    }

    pub fn stem(&self) -> Option<&str> {
        self.file.as_ref().map(|file| file.stem.as_str())
    }

    pub fn label(&self) -> String {
        let mut label = self.stage().name().to_string();

        if let Some(channel) = self.params.channel() {
            label.push_str(&format!(" c{channel}"));
        }

        if let Some((reference, transform)) = self.params.pair() {
            label.push_str(&format!(" c{reference}-c{transform}"));
        }

        if let Some(file) = &self.file {
            label.push(' ');
            label.push_str(&file.stem);
        }

        label
    }
}

/// The complete task graph of one run.
///
/// Built once, up front, from the configuration and the discovered input
/// files; execution never adds or removes tasks. Every file contributes an
/// independent branch structure ending in its per-file merge; a single
/// run-level merge spans all of those.
pub struct PipelineGraph {
    graph: DiGraph<TaskNode, ()>,
}

impl PipelineGraph {
    /// Wires the branch structure the configuration calls for, per file,
    /// plus the run-level merge. `fingerprint` comes from
    /// [`Config::fingerprint`] and flows into every task's cache key.
    pub fn build(
        config: &Config,
        fingerprint: Hash32,
        files: &[FileRef],
    ) -> Result<Self, GraphError> {
        let mut builder = Builder {
            graph: DiGraph::new(),
            config,
            fingerprint,
        };

        let mut merges = Vec::with_capacity(files.len());
        for file in files {
            merges.push(builder.file_branch(file)?);
        }

        // The run merge key carries a census of the input set, so adding or
        // removing a file invalidates a cached summary even though the task
        // itself has no file or parameters of its own.
        let census = files
            .iter()
            .fold(CacheKeyBuilder::new(), |acc, file| {
                acc.field_hash(file.stem.as_str(), file.hash)
            })
            .finish()
            .digest();
        builder.add(StageParams::MergeRun, None, Some(census), &merges);

        let graph = PipelineGraph {
            graph: builder.graph,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<(), GraphError> {
        toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|cycle| GraphError::Cycle(self.graph[cycle.node_id()].label()))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn handles(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.graph.node_indices().map(TaskHandle)
    }

    pub fn task(&self, handle: TaskHandle) -> &TaskNode {
        &self.graph[handle.0]
    }

    /// Predecessors in wiring order. Merge stages receive their input
    /// artifacts in exactly this order.
    pub fn predecessors(&self, handle: TaskHandle) -> &[TaskHandle] {
        &self.graph[handle.0].preds
    }

    pub fn dependents(&self, handle: TaskHandle) -> impl Iterator<Item = TaskHandle> + '_ {
        self.graph
            .neighbors_directed(handle.0, Direction::Outgoing)
            .map(TaskHandle)
    }

    pub fn stage_handles(&self, kind: StageKind) -> impl Iterator<Item = TaskHandle> + '_ {
        self.graph
            .node_indices()
            .filter(move |&index| self.graph[index].stage() == kind)
            .map(TaskHandle)
    }

    pub fn count(&self, kind: StageKind) -> usize {
        self.stage_handles(kind).count()
    }
}

impl std::fmt::Display for PipelineGraph {
    /// Renders the graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph TD")?;

        for index in self.graph.node_indices() {
            let label = self.graph[index].label().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), label)?;
        }

        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

struct Builder<'a> {
    graph: DiGraph<TaskNode, ()>,
    config: &'a Config,
    fingerprint: Hash32,
}

impl Builder<'_> {
    fn add(
        &mut self,
        params: StageParams,
        file: Option<&FileRef>,
        inputs: Option<Hash32>,
        preds: &[TaskHandle],
    ) -> TaskHandle {
        let key = task_key(
            params,
            file,
            self.fingerprint,
            &self.config.paths.output_dir,
            inputs,
        );

        let node = TaskNode {
            params,
            file: file.cloned(),
            key,
            needs_gate: params.kind().accelerated() && self.config.execution.use_accelerator,
            preds: preds.to_vec(),
        };

        let handle = TaskHandle(self.graph.add_node(node));
        for pred in preds {
            self.graph.add_edge(pred.0, handle.0, ());
        }
        handle
    }

    /// Wires every branch for one file and returns its per-file merge task.
    ///
    /// A branch's downstream consumers always attach to its *terminal*
    /// task; disabled branches contribute nothing rather than a
    /// placeholder.
    fn file_branch(&mut self, file: &FileRef) -> Result<TaskHandle, GraphError> {
        let preprocess = self.add(StageParams::Preprocess, Some(file), None, &[]);

        let cells = if self.config.cells.dual_pass {
            let predict = self.add(
                StageParams::SegmentCellsPredict,
                Some(file),
                None,
                &[preprocess],
            );
            let merge = self.add(StageParams::SegmentCellsMerge, Some(file), None, &[predict]);
            self.add(StageParams::SegmentCellsDilate, Some(file), None, &[merge])
        } else {
            let selection = self.config.cells.selection;
            self.add(
                StageParams::SegmentCells { selection },
                Some(file),
                None,
                &[preprocess],
            )
        };

        let mut others = Vec::new();
        if self.config.other.enabled {
            for &channel in &self.config.other.channels {
                others.push(self.add(
                    StageParams::SegmentOther { channel },
                    Some(file),
                    None,
                    &[preprocess],
                ));
            }
        }

        // A spot branch ends at its tracking task when the acquisition has
        // a temporal or axial dimension to link over, at its detection task
        // otherwise.
        let tracked = self.config.tracking_active();
        let mut spots = Vec::new();
        let mut spot_by_channel = BTreeMap::new();
        for &channel in &self.config.detect.channels {
            let detect = self.add(
                StageParams::Detect { channel },
                Some(file),
                None,
                &[preprocess],
            );
            let terminal = if tracked {
                self.add(StageParams::Track { channel }, Some(file), None, &[detect])
            } else {
                detect
            };
            spots.push(terminal);
            spot_by_channel.insert(channel, terminal);
        }

        let mut colocs = Vec::new();
        if self.config.coloc.enabled {
            let timeseries = self.config.acquisition.timeseries;
            for &(reference, transform) in &self.config.coloc.pairs {
                let spot = |channel: u32| {
                    spot_by_channel
                        .get(&channel)
                        .copied()
                        .ok_or(GraphError::UnknownPair {
                            reference,
                            transform,
                        })
                };
                let preds = [spot(reference)?, spot(transform)?];
                colocs.push(self.add(
                    StageParams::Colocalize {
                        reference,
                        transform,
                        timeseries,
                    },
                    Some(file),
                    None,
                    &preds,
                ));
            }
        }

        // The per-file merge waits on the terminal task of every branch.
        // Input order here is the order the merge stage sees its artifacts.
        let mut inputs = spots;
        inputs.extend(colocs);
        inputs.push(cells);
        inputs.extend(others);

        Ok(self.add(StageParams::MergeFile, Some(file), None, &inputs))
    }
}
