use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::artifact::{RunLayout, StageOutput};
use crate::error::ManifestError;
use crate::key::CacheKey;
use crate::stage::StageKind;

/// What one completed task left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub stage: String,
    pub file: Option<String>,
    pub output: StageOutput,
    /// Unix seconds at record time. Informational only.
    pub created: u64,
}

/// The persisted record of completed tasks, keyed by cache key.
///
/// Lives at a fixed path inside the output root and carries this run's
/// memory across invocations: a task whose key has a manifest entry with
/// all output paths still on disk is not recomputed. All invalidation
/// happens through the keys themselves (content, parameters, configuration
/// fingerprint), so the manifest never needs to reason about staleness.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Reads the manifest from the output root. A missing or unreadable
    /// manifest is an empty one; the worst case is recomputation.
    pub fn load(layout: &RunLayout) -> Self {
        let path = layout.manifest();
        if !path.exists() {
            return Self::default();
        }

        File::open(&path)
            .ok()
            .and_then(|file| ciborium::from_reader(BufReader::new(file)).ok())
            .unwrap_or_default()
    }

    pub fn store(&self, layout: &RunLayout) -> Result<(), ManifestError> {
        fs::create_dir_all(layout.root())?;
        let file = File::create(layout.manifest())?;
        ciborium::into_writer(self, file).map_err(std::io::Error::other)?;
        Ok(())
    }

    /// The reusable output for `key`, if every artifact it references still
    /// exists on disk.
    pub fn lookup(&self, key: CacheKey) -> Option<&StageOutput> {
        let entry = self.entries.get(&key.to_hex())?;
        entry.output.exists().then_some(&entry.output)
    }

    pub fn record(
        &mut self,
        key: CacheKey,
        stage: StageKind,
        file: Option<&str>,
        output: StageOutput,
    ) {
        self.entries.insert(
            key.to_hex(),
            ManifestEntry {
                stage: stage.name().to_string(),
                file: file.map(str::to_string),
                output,
                created: now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
