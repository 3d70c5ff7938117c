use thiserror::Error;

/// Top-level error for one pipeline invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while scanning input files:\n{0}")]
    Input(#[from] InputError),

    #[error("Error while constructing the task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Error while reading or writing the run manifest:\n{0}")]
    Manifest(#[from] ManifestError),

    #[error("Alignment stage:\n{0}")]
    Alignment(anyhow::Error),

    #[error("Couldn't load the detection model:\n{0}")]
    Model(anyhow::Error),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read the configuration file.\n{0}")]
    Read(#[from] std::io::Error),

    #[error("Couldn't parse the configuration.\n{0}")]
    Parse(#[from] toml::de::Error),

    #[error("Couldn't fingerprint the configuration.\n{0}")]
    Fingerprint(#[from] serde_json::Error),

    #[error(
        "Colocalization pair ({reference}, {transform}) references channel {missing}, \
         which is not a configured detection channel"
    )]
    UnknownColocChannel {
        reference: u32,
        transform: u32,
        missing: u32,
    },

    #[error("Detection lists {models} model paths for {channels} channels")]
    ModelCount { models: usize, channels: usize },

    #[error("Channel {channel} appears more than once in `{list}`")]
    DuplicateChannel { list: &'static str, channel: u32 },

    #[error("Accelerator slot count must be at least 1")]
    ZeroCapacity,
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Couldn't read input file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Input file '{0}' has no usable file stem")]
    NoStem(camino::Utf8PathBuf),

    #[error("Two input files share the stem '{0}'")]
    DuplicateStem(String),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected in the task graph at '{0}'")]
    Cycle(String),

    #[error("Colocalization pair ({reference}, {transform}) has no spot branch to attach to")]
    UnknownPair { reference: u32, transform: u32 },
}

/// The gate was closed before a permit could be acquired. Does not occur
/// during normal operation since the gate lives as long as the run.
#[derive(Debug, Error)]
#[error("The resource gate was closed before a permit could be acquired")]
pub struct GateError(#[from] tokio::sync::AcquireError);

/// Failure of a spawned task at the runtime level, as opposed to a domain
/// failure returned by a stage function.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task was cancelled before completion")]
    Cancelled,
}

impl From<tokio::task::JoinError> for RunError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            let panic = err.into_panic();
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };
            RunError::Panicked(msg)
        } else {
            RunError::Cancelled
        }
    }
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct MergeError(#[from] pub(crate) std::io::Error);

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ManifestError(#[from] std::io::Error);
