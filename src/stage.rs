use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::artifact::{Artifact, RunLayout, StageOutput};
use crate::config::{Config, Selection};
use crate::error::GateError;
use crate::gate::{GatePermit, ResourceGate};
use crate::input::FileRef;
use crate::key::{CacheKey, CacheKeyBuilder, Hash32};

/// A type-erased, thread-safe container for loaded model objects.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// The named steps of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Align,
    Preprocess,
    SegmentCells,
    SegmentCellsPredict,
    SegmentCellsMerge,
    SegmentCellsDilate,
    SegmentOther,
    Detect,
    Track,
    Colocalize,
    MergeFile,
    MergeRun,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Align => "align",
            StageKind::Preprocess => "preprocess",
            StageKind::SegmentCells => "segment_cells",
            StageKind::SegmentCellsPredict => "segment_cells_predict",
            StageKind::SegmentCellsMerge => "segment_cells_merge",
            StageKind::SegmentCellsDilate => "dilate_cells",
            StageKind::SegmentOther => "segment_other",
            StageKind::Detect => "detect",
            StageKind::Track => "track",
            StageKind::Colocalize => "colocalize",
            StageKind::MergeFile => "merge_file",
            StageKind::MergeRun => "merge_run",
        }
    }

    /// Stages that use the accelerator and therefore go through the gate.
    pub(crate) fn accelerated(self) -> bool {
        matches!(
            self,
            StageKind::SegmentCellsPredict | StageKind::SegmentOther | StageKind::Detect
        )
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Exactly the parameters each stage recognizes, beyond the file reference
/// and the configuration every stage receives. These are the complete
/// identity-bearing arguments of a task; anything not representable here
/// (gates, model handles) is by construction outside the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageParams {
    Align,
    Preprocess,
    SegmentCells {
        selection: Selection,
    },
    SegmentCellsPredict,
    SegmentCellsMerge,
    SegmentCellsDilate,
    SegmentOther {
        channel: u32,
    },
    Detect {
        channel: u32,
    },
    Track {
        channel: u32,
    },
    Colocalize {
        reference: u32,
        transform: u32,
        timeseries: bool,
    },
    MergeFile,
    MergeRun,
}

impl StageParams {
    pub fn kind(self) -> StageKind {
        match self {
            StageParams::Align => StageKind::Align,
            StageParams::Preprocess => StageKind::Preprocess,
            StageParams::SegmentCells { .. } => StageKind::SegmentCells,
            StageParams::SegmentCellsPredict => StageKind::SegmentCellsPredict,
            StageParams::SegmentCellsMerge => StageKind::SegmentCellsMerge,
            StageParams::SegmentCellsDilate => StageKind::SegmentCellsDilate,
            StageParams::SegmentOther { .. } => StageKind::SegmentOther,
            StageParams::Detect { .. } => StageKind::Detect,
            StageParams::Track { .. } => StageKind::Track,
            StageParams::Colocalize { .. } => StageKind::Colocalize,
            StageParams::MergeFile => StageKind::MergeFile,
            StageParams::MergeRun => StageKind::MergeRun,
        }
    }

    pub fn channel(self) -> Option<u32> {
        match self {
            StageParams::SegmentOther { channel }
            | StageParams::Detect { channel }
            | StageParams::Track { channel } => Some(channel),
            _ => None,
        }
    }

    pub fn pair(self) -> Option<(u32, u32)> {
        match self {
            StageParams::Colocalize {
                reference,
                transform,
                ..
            } => Some((reference, transform)),
            _ => None,
        }
    }

    fn write_key_fields(self, builder: CacheKeyBuilder) -> CacheKeyBuilder {
        match self {
            StageParams::Align
            | StageParams::Preprocess
            | StageParams::SegmentCellsPredict
            | StageParams::SegmentCellsMerge
            | StageParams::SegmentCellsDilate
            | StageParams::MergeFile
            | StageParams::MergeRun => builder,
            StageParams::SegmentCells { selection } => {
                builder.field("selection", selection.as_str())
            }
            StageParams::SegmentOther { channel }
            | StageParams::Detect { channel }
            | StageParams::Track { channel } => builder.field_u32("channel", channel),
            StageParams::Colocalize {
                reference,
                transform,
                timeseries,
            } => builder
                .field_u32("reference", reference)
                .field_u32("transform", transform)
                .field_bool("timeseries", timeseries),
        }
    }
}

/// Computes the identity of one task invocation.
///
/// Consumes only declared identity-bearing fields: stage name, file stem and
/// content hash, stage parameters, the configuration fingerprint, the output
/// root, and (for the run-level merge) a census of all inputs. There is no
/// way to feed a [`ResourceGate`] or [`ModelHandle`] into this function,
/// which is what makes keys invariant under changes to live handles.
pub(crate) fn task_key(
    params: StageParams,
    file: Option<&FileRef>,
    fingerprint: Hash32,
    root: &Utf8Path,
    inputs: Option<Hash32>,
) -> CacheKey {
    let mut builder = CacheKeyBuilder::new()
        .field("stage", params.kind().name())
        .field_hash("config", fingerprint)
        .field("root", root.as_str());

    if let Some(file) = file {
        builder = builder
            .field("file", &file.stem)
            .field_hash("content", file.hash);
    }

    if let Some(inputs) = inputs {
        builder = builder.field_hash("inputs", inputs);
    }

    params.write_key_fields(builder).finish()
}

/// Opaque wrapper around a loaded accelerator model.
///
/// Deliberately neither serializable nor hashable: two handles to the same
/// weights are not meaningfully comparable, so cache keys never include
/// them. Stages downcast the inner object back to whatever they loaded.
#[derive(Clone)]
pub struct ModelHandle {
    path: Option<Utf8PathBuf>,
    object: Option<Dynamic>,
}

impl ModelHandle {
    /// A handle that only records where the model lives; the stage loads it
    /// lazily.
    pub fn from_path(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            object: None,
        }
    }

    /// A handle around an already loaded model object.
    pub fn loaded<T: Any + Send + Sync>(path: Option<Utf8PathBuf>, object: T) -> Self {
        Self {
            path,
            object: Some(Arc::new(object)),
        }
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.object.as_ref()?.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("path", &self.path)
            .field("loaded", &self.object.is_some())
            .finish()
    }
}

/// Everything a stage function receives: the file, the output layout, the
/// read-only configuration, its parameter record, and the live handles
/// (gate, model) that exist only for the duration of the run.
#[derive(Clone)]
pub struct StageContext {
    file: Option<FileRef>,
    layout: RunLayout,
    config: Arc<Config>,
    params: StageParams,
    gate: Option<ResourceGate>,
    model: Option<ModelHandle>,
}

impl StageContext {
    pub(crate) fn new(
        file: Option<FileRef>,
        layout: RunLayout,
        config: Arc<Config>,
        params: StageParams,
        gate: Option<ResourceGate>,
        model: Option<ModelHandle>,
    ) -> Self {
        Self {
            file,
            layout,
            config,
            params,
            gate,
            model,
        }
    }

    /// The input file this task works on. `None` only for the run-level
    /// merge and the alignment preliminary.
    pub fn file(&self) -> Option<&FileRef> {
        self.file.as_ref()
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn params(&self) -> StageParams {
        self.params
    }

    pub fn channel(&self) -> Option<u32> {
        self.params.channel()
    }

    pub fn gate(&self) -> Option<&ResourceGate> {
        self.gate.as_ref()
    }

    pub fn model(&self) -> Option<&ModelHandle> {
        self.model.as_ref()
    }

    /// Acquires the gate when this task declared a need for it, waiting for
    /// a free permit. Returns `None` when the task runs unrestricted. Hold
    /// the permit for exactly the protected section:
    ///
    /// ```rust,ignore
    /// let _permit = ctx.acquire_gate().await?;
    /// // accelerator work here; permit returns on any exit
    /// ```
    pub async fn acquire_gate(&self) -> Result<Option<GatePermit>, GateError> {
        match &self.gate {
            Some(gate) => Ok(Some(gate.acquire().await?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.params.kind().name())
            .field("file", &self.file.as_ref().map(|f| f.stem.as_str()))
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

/// The opaque domain operations of the pipeline.
///
/// Implement this trait with your numerics; the orchestrator decides what
/// runs, in which order, with which cached results, and under which gate.
/// Methods are declared as `impl Future` so implementations can be plain
/// `async fn`; heavy synchronous work belongs in `spawn_blocking` inside the
/// method. All paths a stage writes to should come from
/// [`StageContext::layout`], which is what downstream stages will read.
pub trait Stages: Send + Sync + 'static {
    /// File-independent channel alignment, run once before any per-file
    /// task when enabled.
    fn align(&self, ctx: StageContext) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    fn preprocess(
        &self,
        ctx: StageContext,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    /// Single-pass cell segmentation. The strategy selector arrives in
    /// `ctx.params()`; [`Selection::Both`] may return a keyed output with
    /// one artifact per structure.
    fn segment_cells(
        &self,
        ctx: StageContext,
    ) -> impl Future<Output = anyhow::Result<StageOutput>> + Send;

    fn segment_cells_predict(
        &self,
        ctx: StageContext,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    fn segment_cells_merge(
        &self,
        ctx: StageContext,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    fn dilate_cells(
        &self,
        ctx: StageContext,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    fn segment_other(
        &self,
        ctx: StageContext,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    fn detect(&self, ctx: StageContext) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    fn track(&self, ctx: StageContext) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    fn colocalize_frame(
        &self,
        ctx: StageContext,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    fn colocalize_track(
        &self,
        ctx: StageContext,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send;

    /// Loads the detection model for one channel, called once per channel
    /// before any of its detection tasks run. The default defers loading to
    /// the stage itself by recording the path.
    fn load_model(&self, path: &Utf8Path) -> anyhow::Result<ModelHandle> {
        Ok(ModelHandle::from_path(path))
    }

    /// Combines one file's artifacts into its summary. `inputs` holds the
    /// predecessor artifacts in deterministic order (spot terminals by
    /// channel, colocalization by pair order, the cell terminal, other
    /// segmentation by channel). The default concatenates the tabular
    /// inputs into `summary/<file>.csv`.
    fn merge_file(
        &self,
        ctx: StageContext,
        inputs: Vec<Artifact>,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send {
        async move {
            let file = ctx
                .file()
                .ok_or_else(|| anyhow::anyhow!("merge_file invoked without a file"))?;
            let dest = ctx.layout().file_summary(&file.stem);
            Ok(crate::merge::concat_tables(&inputs, &dest)?)
        }
    }

    /// Combines all per-file summaries into the run summary. `inputs` holds
    /// the successful per-file merge artifacts in file order. Idempotent:
    /// identical inputs in identical order produce identical bytes.
    fn merge_run(
        &self,
        ctx: StageContext,
        inputs: Vec<Artifact>,
    ) -> impl Future<Output = anyhow::Result<Artifact>> + Send {
        async move {
            let dest = ctx.layout().run_summary();
            Ok(crate::merge::concat_tables(&inputs, &dest)?)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn file() -> FileRef {
        FileRef {
            stem: String::from("20230112_egfp_2"),
            path: Utf8PathBuf::from("in/20230112_egfp_2.tif"),
            hash: Hash32::hash(b"pixels"),
        }
    }

    #[test]
    fn test_key_ignores_live_handles() {
        let params = StageParams::Detect { channel: 1 };
        let fingerprint = Hash32::hash(b"config");
        let file = file();

        // Two runs with distinct gate and model instances in scope. Neither
        // can reach the key computation, so the keys must match.
        let gate_a = ResourceGate::exclusive();
        let model_a = ModelHandle::loaded(None, vec![1u8, 2, 3]);
        let key_a = task_key(params, Some(&file), fingerprint, "out".into(), None);
        drop((gate_a, model_a));

        let gate_b = ResourceGate::new(4);
        let model_b = ModelHandle::from_path("models/other.h5");
        let key_b = task_key(params, Some(&file), fingerprint, "out".into(), None);
        drop((gate_b, model_b));

        assert_eq!(key_a, key_b);
    }

    #[test]
    fn test_key_changes_with_identity_fields() {
        let fingerprint = Hash32::hash(b"config");
        let file = file();
        let base = task_key(
            StageParams::Detect { channel: 1 },
            Some(&file),
            fingerprint,
            "out".into(),
            None,
        );

        let other_channel = task_key(
            StageParams::Detect { channel: 2 },
            Some(&file),
            fingerprint,
            "out".into(),
            None,
        );
        assert_ne!(base, other_channel);

        let other_stage = task_key(
            StageParams::Track { channel: 1 },
            Some(&file),
            fingerprint,
            "out".into(),
            None,
        );
        assert_ne!(base, other_stage);

        let other_config = task_key(
            StageParams::Detect { channel: 1 },
            Some(&file),
            Hash32::hash(b"config2"),
            "out".into(),
            None,
        );
        assert_ne!(base, other_config);

        let mut touched = file.clone();
        touched.hash = Hash32::hash(b"new pixels");
        let other_content = task_key(
            StageParams::Detect { channel: 1 },
            Some(&touched),
            fingerprint,
            "out".into(),
            None,
        );
        assert_ne!(base, other_content);
    }

    #[test]
    fn test_model_handle_downcast() {
        let handle = ModelHandle::loaded(Some("m.h5".into()), String::from("weights"));
        assert_eq!(handle.get::<String>().map(String::as_str), Some("weights"));
        assert!(handle.get::<u32>().is_none());

        let lazy = ModelHandle::from_path("m.h5");
        assert_eq!(lazy.path().map(Utf8Path::as_str), Some("m.h5"));
        assert!(lazy.get::<String>().is_none());
    }

    #[test]
    fn test_accelerated_stages() {
        assert!(StageKind::Detect.accelerated());
        assert!(StageKind::SegmentCellsPredict.accelerated());
        assert!(StageKind::SegmentOther.accelerated());
        assert!(!StageKind::SegmentCells.accelerated());
        assert!(!StageKind::Track.accelerated());
        assert!(!StageKind::MergeFile.accelerated());
    }
}
