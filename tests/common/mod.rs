pub mod stages;

use std::fs;
use std::sync::Once;

use camino::{Utf8Path, Utf8PathBuf};
use tracing_subscriber::{EnvFilter, fmt};

use puncta::Config;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Uses `with_test_writer()`, so output is captured per-test and only
/// printed for failing tests unless `--nocapture` is passed. Enable levels
/// with e.g. `RUST_LOG=debug cargo test`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// A fresh temp directory with an `in/` subdirectory for inputs. The `out/`
/// path is returned uncreated; the pipeline creates it itself.
pub fn workspace() -> (tempfile::TempDir, Utf8PathBuf, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");

    let input = root.join("in");
    let output = root.join("out");
    fs::create_dir_all(&input).expect("create input dir");

    (dir, input, output)
}

/// Writes one `<stem>.tif` per stem, with stem-derived bytes so every file
/// hashes differently.
pub fn seed_inputs(dir: &Utf8Path, stems: &[&str]) {
    for stem in stems {
        let path = dir.join(format!("{stem}.tif"));
        fs::write(path, format!("pixels of {stem}")).expect("seed input file");
    }
}

pub fn config_with(input: &Utf8Path, output: &Utf8Path, extra: &str) -> Config {
    let raw = format!("[paths]\ninput_dir = \"{input}\"\noutput_dir = \"{output}\"\n{extra}");
    Config::from_toml_str(&raw).expect("test config")
}
