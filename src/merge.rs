use std::fs;

use camino::Utf8Path;

use crate::artifact::{Artifact, ArtifactKind, RunLayout};
use crate::error::MergeError;

/// Concatenates tabular artifacts into one CSV at `dest`.
///
/// The first table's header line is kept, subsequent headers are dropped,
/// raster inputs are skipped, and rows keep their input order. Inputs are
/// consumed read-only, and the output is byte-identical across invocations
/// over the same inputs in the same order.
pub fn concat_tables(inputs: &[Artifact], dest: &Utf8Path) -> Result<Artifact, MergeError> {
    let mut out = String::new();
    let mut header_written = false;

    for artifact in inputs.iter().filter(|a| a.kind == ArtifactKind::Table) {
        let table = fs::read_to_string(&artifact.path)?;
        let mut lines = table.lines();

        if let Some(header) = lines.next()
            && !header_written
        {
            out.push_str(header);
            out.push('\n');
            header_written = true;
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
    }

    RunLayout::prepare(dest)?;
    fs::write(dest, out.as_bytes())?;

    Ok(Artifact::table(dest))
}
