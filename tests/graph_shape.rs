use std::error::Error;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{TempDir, tempdir};

use puncta::{Config, PipelineGraph, StageKind, discover};

type TestResult = Result<(), Box<dyn Error>>;

fn seeded(stems: &[&str]) -> Result<(TempDir, Utf8PathBuf), Box<dyn Error>> {
    let dir = tempdir()?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .map_err(|path| format!("non-utf8 tempdir: {}", path.display()))?;

    for stem in stems {
        fs::write(root.join(format!("{stem}.tif")), format!("pixels of {stem}"))?;
    }

    Ok((dir, root))
}

fn config(input: &Utf8Path, extra: &str) -> Result<Config, Box<dyn Error>> {
    let raw = format!("[paths]\ninput_dir = \"{input}\"\noutput_dir = \"{input}/out\"\n{extra}");
    Ok(Config::from_toml_str(&raw)?)
}

fn build(config: &Config, input: &Utf8Path) -> Result<PipelineGraph, Box<dyn Error>> {
    let files = discover(input, &config.paths.file_pattern)?;
    Ok(PipelineGraph::build(config, config.fingerprint()?, &files)?)
}

#[test]
fn discovery_sorts_files_by_stem() -> TestResult {
    let (_dir, input) = seeded(&["zebra", "apple", "mango"])?;
    let files = discover(&input, "*.tif")?;

    let stems: Vec<_> = files.iter().map(|file| file.stem.as_str()).collect();
    assert_eq!(stems, ["apple", "mango", "zebra"]);

    Ok(())
}

#[test]
fn branch_counts_scale_per_file() -> TestResult {
    let (_dir, input) = seeded(&["a", "b", "c"])?;
    let cfg = config(&input, "[detect]\nchannels = [0, 1]\n")?;
    let graph = build(&cfg, &input)?;

    assert_eq!(graph.count(StageKind::Preprocess), 3);
    assert_eq!(graph.count(StageKind::SegmentCells), 3);
    assert_eq!(graph.count(StageKind::Detect), 6);
    assert_eq!(graph.count(StageKind::Track), 0);
    assert_eq!(graph.count(StageKind::Colocalize), 0);
    assert_eq!(graph.count(StageKind::MergeFile), 3);
    assert_eq!(graph.count(StageKind::MergeRun), 1);
    assert_eq!(graph.len(), 16);

    Ok(())
}

#[test]
fn detection_hangs_off_preprocessing() -> TestResult {
    let (_dir, input) = seeded(&["a"])?;
    let cfg = config(&input, "[detect]\nchannels = [0]\n")?;
    let graph = build(&cfg, &input)?;

    let detect = graph
        .stage_handles(StageKind::Detect)
        .next()
        .ok_or("no detect task")?;
    let preds: Vec<_> = graph
        .predecessors(detect)
        .iter()
        .map(|&handle| graph.task(handle).stage())
        .collect();
    assert_eq!(preds, [StageKind::Preprocess]);

    let merge = graph
        .stage_handles(StageKind::MergeFile)
        .next()
        .ok_or("no file merge task")?;
    let preds: Vec<_> = graph
        .predecessors(merge)
        .iter()
        .map(|&handle| graph.task(handle).stage())
        .collect();
    assert_eq!(preds, [StageKind::Detect, StageKind::SegmentCells]);

    Ok(())
}

#[test]
fn dual_pass_replaces_single_segmentation() -> TestResult {
    let (_dir, input) = seeded(&["a"])?;
    let cfg = config(&input, "[cells]\ndual_pass = true\n")?;
    let graph = build(&cfg, &input)?;

    assert_eq!(graph.count(StageKind::SegmentCells), 0);
    assert_eq!(graph.count(StageKind::SegmentCellsPredict), 1);
    assert_eq!(graph.count(StageKind::SegmentCellsMerge), 1);
    assert_eq!(graph.count(StageKind::SegmentCellsDilate), 1);

    // predict <- preprocess, merge <- predict, dilate <- merge
    let dilate = graph
        .stage_handles(StageKind::SegmentCellsDilate)
        .next()
        .ok_or("no dilate task")?;
    let merge = graph.predecessors(dilate)[0];
    assert_eq!(graph.task(merge).stage(), StageKind::SegmentCellsMerge);
    let predict = graph.predecessors(merge)[0];
    assert_eq!(graph.task(predict).stage(), StageKind::SegmentCellsPredict);
    let root = graph.predecessors(predict)[0];
    assert_eq!(graph.task(root).stage(), StageKind::Preprocess);

    Ok(())
}

#[test]
fn tracking_becomes_the_spot_terminal() -> TestResult {
    let (_dir, input) = seeded(&["a"])?;
    let cfg = config(
        &input,
        "[detect]\nchannels = [0, 1]\n\
         [acquisition]\ntimeseries = true\n\
         [coloc]\nenabled = true\npairs = [[0, 1]]\n",
    )?;
    let graph = build(&cfg, &input)?;

    let coloc = graph
        .stage_handles(StageKind::Colocalize)
        .next()
        .ok_or("no colocalization task")?;
    let preds: Vec<_> = graph
        .predecessors(coloc)
        .iter()
        .map(|&handle| graph.task(handle).stage())
        .collect();
    assert_eq!(preds, [StageKind::Track, StageKind::Track]);

    let merge = graph
        .stage_handles(StageKind::MergeFile)
        .next()
        .ok_or("no file merge task")?;
    let preds: Vec<_> = graph
        .predecessors(merge)
        .iter()
        .map(|&handle| graph.task(handle).stage())
        .collect();
    assert_eq!(
        preds,
        [
            StageKind::Track,
            StageKind::Track,
            StageKind::Colocalize,
            StageKind::SegmentCells,
        ]
    );

    Ok(())
}

#[test]
fn detection_key_follows_file_content() -> TestResult {
    let (_dir, input) = seeded(&["a"])?;
    let cfg = config(&input, "[detect]\nchannels = [0]\n")?;

    let key_of = |graph: &PipelineGraph| {
        graph
            .stage_handles(StageKind::Detect)
            .next()
            .map(|handle| graph.task(handle).key)
    };

    let before = key_of(&build(&cfg, &input)?).ok_or("no detect task")?;

    fs::write(input.join("a.tif"), "different pixels")?;
    let touched = key_of(&build(&cfg, &input)?).ok_or("no detect task")?;
    assert_ne!(before, touched);

    fs::write(input.join("a.tif"), "pixels of a")?;
    let restored = key_of(&build(&cfg, &input)?).ok_or("no detect task")?;
    assert_eq!(before, restored);

    Ok(())
}
