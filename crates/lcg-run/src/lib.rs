//! Running acquisitions: invoking the engine, planning stimulus trials and
//! keeping the state of a seal test.

use lcg_lib::{AnalysisError, ConfigError, StimulusError, TraceError};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::str::FromStr;
use thiserror::Error;

pub mod plan;
pub mod seal;

pub use plan::{progress_line, run_trials, stimuli_in_dir, RunPlan, RunSummary};
pub use seal::{SealTest, SealTestSettings, SessionFiles};

/// Environment variable naming the acquisition program.
pub const ENGINE_VARIABLE: &str = "LCG_ENGINE";
pub const DEFAULT_ENGINE: &str = "lcg-experiment";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    EngineFailed { program: String, status: ExitStatus },
    #[error("invalid channel list `{0}`")]
    BadChannels(String),
    #[error("expected {expected} {what} (one per channel), got {found}")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("the number of repetitions must be at least one")]
    NoRepetitions,
    #[error("the interval between repetitions must be a non-negative number of seconds, got {0}")]
    BadInterval(f64),
    #[error("the sampling rate must be positive, got {0}")]
    BadSamplingRate(f64),
    #[error("there are {channels} output channels and {files} stimulus files")]
    StimulusCount { channels: usize, files: usize },
    #[error("no input or output channels specified")]
    NoChannels,
    #[error("no stimulus given: use a stimulus file, a directory or pipe one in")]
    NoStimulus,
    #[error("an offset was given but there are no output channels")]
    OffsetWithoutOutputs,
    #[error("{}: no such file", .0.display())]
    NoSuchFile(PathBuf),
    #[error("{}: no such directory", .0.display())]
    NoSuchDirectory(PathBuf),
    #[error("the directory {} contains no stimulus files", .0.display())]
    EmptyDirectory(PathBuf),
    #[error("the recording has no trace in {0}")]
    MissingTrace(&'static str),
    #[error("session directory: {0}")]
    Session(#[source] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stimulus(#[from] StimulusError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl RunError {
    /// Conditions that leave nothing to do. They are reported to the user but
    /// do not make the command fail.
    pub fn is_no_op(&self) -> bool {
        matches!(
            self,
            RunError::NoChannels
                | RunError::NoStimulus
                | RunError::OffsetWithoutOutputs
                | RunError::EmptyDirectory(_)
        )
    }
}

/// Channels requested on the command line: `none`, a single index, a comma
/// separated list or an inclusive range such as `0-3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelection {
    Disabled,
    Channels(Vec<u32>),
}

impl ChannelSelection {
    pub fn channels(&self) -> &[u32] {
        match self {
            ChannelSelection::Disabled => &[],
            ChannelSelection::Channels(channels) => channels,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, ChannelSelection::Disabled)
    }
}

impl FromStr for ChannelSelection {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |value: &str| {
            value
                .trim()
                .parse::<u32>()
                .map_err(|_| RunError::BadChannels(s.to_string()))
        };
        if s.eq_ignore_ascii_case("none") {
            return Ok(ChannelSelection::Disabled);
        }
        if let Some((first, last)) = s.split_once('-') {
            let (first, last) = (parse(first)?, parse(last)?);
            if last < first {
                return Err(RunError::BadChannels(s.to_string()));
            }
            return Ok(ChannelSelection::Channels((first..=last).collect()));
        }
        s.split(',')
            .map(parse)
            .collect::<Result<Vec<_>, _>>()
            .map(ChannelSelection::Channels)
    }
}

/// Something that performs the acquisition described by a configuration file.
pub trait AcquisitionEngine {
    fn run(&self, config: &Path) -> Result<(), RunError>;
}

impl<E: AcquisitionEngine + ?Sized> AcquisitionEngine for &E {
    fn run(&self, config: &Path) -> Result<(), RunError> {
        (**self).run(config)
    }
}

/// The external acquisition program, run as `<program> -c <config> -V <verbosity>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEngine {
    program: String,
    verbosity: u8,
}

impl ExternalEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            verbosity: 3,
        }
    }

    /// The program named by `LCG_ENGINE`, `lcg-experiment` otherwise.
    pub fn from_env() -> Self {
        Self::new(std::env::var(ENGINE_VARIABLE).unwrap_or_else(|_| DEFAULT_ENGINE.to_string()))
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl AcquisitionEngine for ExternalEngine {
    fn run(&self, config: &Path) -> Result<(), RunError> {
        log::debug!(
            "{} -c {} -V {}",
            self.program,
            config.display(),
            self.verbosity
        );
        let status = Command::new(&self.program)
            .arg("-c")
            .arg(config)
            .arg("-V")
            .arg(self.verbosity.to_string())
            .status()
            .map_err(|source| RunError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(RunError::EngineFailed {
                program: self.program.clone(),
                status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_lists() {
        assert_eq!(
            "3".parse::<ChannelSelection>().unwrap(),
            ChannelSelection::Channels(vec![3])
        );
        assert_eq!(
            "0,2, 5".parse::<ChannelSelection>().unwrap().channels(),
            &[0, 2, 5]
        );
        assert_eq!(
            "1-4".parse::<ChannelSelection>().unwrap().channels(),
            &[1, 2, 3, 4]
        );
        assert!("None".parse::<ChannelSelection>().unwrap().is_disabled());
    }

    #[test]
    fn rejects_bad_channel_lists() {
        for bad in ["", "a", "4-1", "1,,2", "-3"] {
            assert!(
                matches!(bad.parse::<ChannelSelection>(), Err(RunError::BadChannels(_))),
                "{} was accepted",
                bad
            );
        }
    }

    #[test]
    fn no_op_conditions() {
        assert!(RunError::NoChannels.is_no_op());
        assert!(RunError::EmptyDirectory(PathBuf::from("stimuli")).is_no_op());
        assert!(!RunError::NoRepetitions.is_no_op());
    }

    #[cfg(unix)]
    #[test]
    fn reports_engine_failures() {
        let config = Path::new("config.xml");
        assert!(ExternalEngine::new("true").run(config).is_ok());
        assert!(matches!(
            ExternalEngine::new("false").run(config),
            Err(RunError::EngineFailed { .. })
        ));
        assert!(matches!(
            ExternalEngine::new("lcg-no-such-program").run(config),
            Err(RunError::Spawn { .. })
        ));
    }
}
