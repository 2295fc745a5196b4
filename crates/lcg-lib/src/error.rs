use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building, writing or parsing stimulus files.
#[derive(Debug, Error)]
pub enum StimulusError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed stimulus row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },
    #[error("unknown waveform code {0}")]
    UnknownWaveform(i32),
    #[error("invalid segment description `{0}`")]
    InvalidSegment(String),
    #[error("frequency must be positive, got {0}")]
    InvalidFrequency(f64),
    #[error("pulse duration {duration} s does not fit in a period of {period} s")]
    PulseTooLong { duration: f64, period: f64 },
    #[error("unknown synapse type `{0}`: allowed values are 'exc' or 'inh'")]
    UnknownSynapse(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl StimulusError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by configuration writers and the environment defaults.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingVariable(String),
    #[error("environment variable {name} has invalid value `{value}`")]
    InvalidVariable { name: String, value: String },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("unable to serialise xml: {0}")]
    XmlWrite(#[from] std::io::Error),
    #[error("unable to parse defaults file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("configuration has no channels")]
    NoChannels,
    #[error("output channel {0} has no stimulus file")]
    MissingStimulus(u32),
    #[error("unable to determine the duration: no duration given and no stimulus files referenced")]
    UnknownDuration,
    #[error("configuration template `{0}` not found")]
    TemplateNotFound(String),
    #[error(transparent)]
    Stimulus(#[from] StimulusError),
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while decoding recorded trace files.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("{0}: no such file")]
    NotFound(PathBuf),
    #[error("unsupported trace file version {0}")]
    UnsupportedVersion(i64),
    #[error("missing node `{0}`")]
    MissingNode(String),
    #[error("cannot extract an entity id from node `{0}`")]
    BadEntityName(String),
    #[error("node `{node}` refers to entity {id}, which has no data")]
    OrphanNode { node: String, id: u32 },
    #[error("metadata of `{node}` has {len} values, not a multiple of {cols} columns")]
    BadMatrix { node: String, len: usize, cols: usize },
    #[cfg(feature = "hdf5")]
    #[error("hdf5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

/// Errors raised by the analysis helpers.
#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("no samples to analyse")]
    Empty,
    #[error("traces have different lengths ({0} and {1})")]
    LengthMismatch(usize, usize),
    #[error("window `{0}` contains no samples")]
    EmptyWindow(&'static str),
    #[error("current step is zero: resistance is undefined")]
    ZeroCurrentStep,
    #[error("kernel length {ksize} is invalid for {samples} samples")]
    BadKernelSize { ksize: usize, samples: usize },
    #[error("tail start {start} is outside the kernel (length {len})")]
    BadTailStart { start: usize, len: usize },
    #[error("the linear system is singular")]
    Singular,
    #[error("not enough positive samples in the kernel tail to fit an exponential")]
    TailFit,
    #[error("fft failed: {0}")]
    Fft(String),
}
