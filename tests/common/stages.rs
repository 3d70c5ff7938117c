//! A [`Stages`] implementation that writes one-line CSVs and counts calls.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context as _;

use puncta::{Artifact, RunLayout, StageContext, StageOutput, Stages};

/// Which stage invocations should fail, by file stem.
#[derive(Debug, Default)]
pub struct Faults {
    pub detect_stem: Option<String>,
    pub align: bool,
}

/// Shared call counters, readable after the pipeline has consumed the
/// stages value.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub align: Arc<AtomicUsize>,
    pub preprocess: Arc<AtomicUsize>,
    pub detect: Arc<AtomicUsize>,
    /// Highest number of detect bodies observed inside the gated section at
    /// the same time.
    pub gate_high_water: Arc<AtomicUsize>,
    gate_active: Arc<AtomicUsize>,
}

pub struct CountingStages {
    counters: Counters,
    faults: Faults,
}

impl CountingStages {
    pub fn new(faults: Faults) -> (Self, Counters) {
        let counters = Counters::default();
        let stages = Self {
            counters: counters.clone(),
            faults,
        };
        (stages, counters)
    }
}

fn write_raster(dest: camino::Utf8PathBuf) -> anyhow::Result<Artifact> {
    RunLayout::prepare(&dest)?;
    fs::write(&dest, b"mask")?;
    Ok(Artifact::raster(dest))
}

fn write_table(dest: camino::Utf8PathBuf, row: String) -> anyhow::Result<Artifact> {
    RunLayout::prepare(&dest)?;
    fs::write(&dest, format!("file,channel,spot\n{row}\n"))?;
    Ok(Artifact::table(dest))
}

impl Stages for CountingStages {
    async fn align(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        self.counters.align.fetch_add(1, Ordering::SeqCst);
        if self.faults.align {
            anyhow::bail!("bead stack unusable");
        }

        let dest = ctx.layout().alignment();
        RunLayout::prepare(&dest)?;
        fs::write(&dest, "channel,shift_x,shift_y\n1,0.5,-0.25\n")?;
        Ok(Artifact::table(dest))
    }

    async fn preprocess(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        self.counters.preprocess.fetch_add(1, Ordering::SeqCst);
        let file = ctx.file().context("preprocess without a file")?;
        write_raster(ctx.layout().preprocessed(&file.stem))
    }

    async fn segment_cells(&self, ctx: StageContext) -> anyhow::Result<StageOutput> {
        let file = ctx.file().context("segment_cells without a file")?;
        Ok(write_raster(ctx.layout().cells(&file.stem))?.into())
    }

    async fn segment_cells_predict(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        let file = ctx.file().context("predict without a file")?;
        write_raster(ctx.layout().cells_predict(&file.stem))
    }

    async fn segment_cells_merge(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        let file = ctx.file().context("merge without a file")?;
        write_raster(ctx.layout().cells_merge(&file.stem))
    }

    async fn dilate_cells(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        let file = ctx.file().context("dilate without a file")?;
        write_raster(ctx.layout().cells(&file.stem))
    }

    async fn segment_other(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        let file = ctx.file().context("segment_other without a file")?;
        let channel = ctx.channel().context("segment_other without a channel")?;
        write_raster(ctx.layout().other(channel, &file.stem))
    }

    async fn detect(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        let _permit = ctx.acquire_gate().await?;

        // Count concurrent occupancy of the gated section. The decrement
        // runs before the permit drops, so the counter never reads a stale
        // occupant after its slot was handed on.
        let running = self.counters.gate_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.gate_high_water.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        self.counters.gate_active.fetch_sub(1, Ordering::SeqCst);

        self.counters.detect.fetch_add(1, Ordering::SeqCst);
        let file = ctx.file().context("detect without a file")?;
        if self.faults.detect_stem.as_deref() == Some(file.stem.as_str()) {
            anyhow::bail!("no spots found in {}", file.stem);
        }

        let channel = ctx.channel().context("detect without a channel")?;
        write_table(
            ctx.layout().detection(channel, &file.stem),
            format!("{},{channel},detected", file.stem),
        )
    }

    async fn track(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        let file = ctx.file().context("track without a file")?;
        let channel = ctx.channel().context("track without a channel")?;
        write_table(
            ctx.layout().tracking(channel, &file.stem),
            format!("{},{channel},tracked", file.stem),
        )
    }

    async fn colocalize_frame(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        let file = ctx.file().context("colocalize without a file")?;
        let (reference, transform) = ctx.params().pair().context("colocalize without a pair")?;
        write_table(
            ctx.layout().colocalization(reference, transform, &file.stem),
            format!("{},c{reference}-c{transform},paired", file.stem),
        )
    }

    async fn colocalize_track(&self, ctx: StageContext) -> anyhow::Result<Artifact> {
        let file = ctx.file().context("colocalize without a file")?;
        let (reference, transform) = ctx.params().pair().context("colocalize without a pair")?;
        write_table(
            ctx.layout().colocalization(reference, transform, &file.stem),
            format!("{},c{reference}-c{transform},paired", file.stem),
        )
    }
}
