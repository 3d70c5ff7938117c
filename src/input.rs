use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use glob::glob;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::error::InputError;
use crate::key::Hash32;

/// Stable identity of one input file.
///
/// The stem names every derived artifact; the content hash flows into every
/// cache key computed for this file, so editing an input invalidates its
/// whole branch on the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub stem: String,
    pub path: Utf8PathBuf,
    pub hash: Hash32,
}

/// Finds input files matching `pattern` under `dir`, hashes their content in
/// parallel, and returns them in deterministic path order.
pub fn discover(dir: &Utf8Path, pattern: &str) -> Result<Vec<FileRef>, InputError> {
    let mut paths = Vec::new();
    for entry in glob(dir.join(pattern).as_str())? {
        paths.push(Utf8PathBuf::try_from(entry?)?);
    }
    paths.sort();

    let files = paths
        .into_par_iter()
        .map(|path| {
            let stem = path
                .file_stem()
                .ok_or_else(|| InputError::NoStem(path.clone()))?
                .to_string();
            let hash = Hash32::hash_file(&path)?;
            Ok(FileRef { stem, path, hash })
        })
        .collect::<Result<Vec<_>, InputError>>()?;

    let mut seen = HashSet::new();
    for file in &files {
        if !seen.insert(file.stem.as_str()) {
            return Err(InputError::DuplicateStem(file.stem.clone()));
        }
    }

    Ok(files)
}
