//! Trials of a stimulus run.
//!
//! Either every output channel gets its own stimulus file (one file may be
//! shared by all of them), in which case each repetition is a single trial, or
//! a single output channel plays every file in turn, one trial per file.

use crate::{AcquisitionEngine, RunError};
use lcg_lib::env::Gain;
use lcg_lib::io::config::{Channel, Device, Direction, IoConfiguration};
use lcg_lib::ConfigError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn per_channel<T: Clone>(
    values: &[T],
    count: usize,
    default: T,
    what: &'static str,
) -> Result<Vec<T>, RunError> {
    if values.is_empty() {
        return Ok(vec![default; count]);
    }
    if values.len() != count {
        return Err(RunError::CountMismatch {
            what,
            expected: count,
            found: values.len(),
        });
    }
    Ok(values.to_vec())
}

/// Input descriptors, falling back to `gain` when no factors or units are given.
pub fn input_channels(
    channels: &[u32],
    factors: &[f64],
    units: &[String],
    gain: &Gain,
) -> Result<Vec<Channel>, RunError> {
    let factors = per_channel(factors, channels.len(), gain.factor, "input gains")?;
    let units = per_channel(units, channels.len(), gain.units.clone(), "input units")?;
    Ok(channels
        .iter()
        .zip(factors)
        .zip(units)
        .map(|((&channel, factor), units)| Channel::input(channel, factor, units))
        .collect())
}

/// Output descriptors without a stimulus: each trial assigns one.
pub fn output_channels(
    channels: &[u32],
    factors: &[f64],
    units: &[String],
    offsets: &[f64],
    gain: &Gain,
) -> Result<Vec<Channel>, RunError> {
    let factors = per_channel(factors, channels.len(), gain.factor, "output gains")?;
    let units = per_channel(units, channels.len(), gain.units.clone(), "output units")?;
    let offsets = per_channel(offsets, channels.len(), 0.0, "offsets")?;
    Ok(channels
        .iter()
        .zip(factors)
        .zip(units)
        .zip(offsets)
        .map(|(((&channel, factor), units), offset)| Channel {
            direction: Direction::Output,
            channel,
            factor,
            units,
            stimulus: None,
            offset,
        })
        .collect())
}

/// Every `*.stim` file in `dir`, sorted by name.
pub fn stimuli_in_dir(dir: &Path) -> Result<Vec<PathBuf>, RunError> {
    if !dir.is_dir() {
        return Err(RunError::NoSuchDirectory(dir.to_path_buf()));
    }
    let entries = fs::read_dir(dir).map_err(RunError::Session)?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(RunError::Session)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "stim") {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(RunError::EmptyDirectory(dir.to_path_buf()));
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub sampling_rate: f64,
    pub device: Device,
    pub realtime: bool,
    pub inputs: Vec<Channel>,
    pub outputs: Vec<Channel>,
    pub stimuli: Vec<PathBuf>,
    /// Only used when there are no output channels.
    pub duration: Option<f64>,
    pub repetitions: usize,
    /// Pause between trials in seconds.
    pub interval: f64,
}

impl RunPlan {
    pub fn new(sampling_rate: f64, inputs: Vec<Channel>, outputs: Vec<Channel>) -> Self {
        Self {
            sampling_rate,
            device: Device::default(),
            realtime: false,
            inputs,
            outputs,
            stimuli: Vec::new(),
            duration: None,
            repetitions: 1,
            interval: 0.0,
        }
    }

    pub fn with_stimuli(mut self, stimuli: Vec<PathBuf>) -> Self {
        self.stimuli = stimuli;
        self
    }

    /// Repetition count and inter-trial interval, checked before anything is
    /// read or written.
    pub fn check_schedule(repetitions: usize, interval: f64) -> Result<(), RunError> {
        if repetitions == 0 {
            return Err(RunError::NoRepetitions);
        }
        if !(interval.is_finite() && interval >= 0.0) {
            return Err(RunError::BadInterval(interval));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), RunError> {
        if !(self.sampling_rate > 0.0) {
            return Err(RunError::BadSamplingRate(self.sampling_rate));
        }
        Self::check_schedule(self.repetitions, self.interval)?;
        if self.inputs.is_empty() && self.outputs.is_empty() {
            return Err(RunError::NoChannels);
        }
        if let Some(missing) = self.stimuli.iter().find(|path| !path.is_file()) {
            return Err(RunError::NoSuchFile(missing.clone()));
        }
        Ok(())
    }

    fn configuration(&self, outputs: Vec<Channel>, duration: Option<f64>) -> IoConfiguration {
        let mut channels = self.inputs.clone();
        channels.extend(outputs);
        let mut config = IoConfiguration::new(self.sampling_rate, channels);
        config.duration = duration;
        config.realtime = self.realtime;
        config.device = self.device.clone();
        config
    }

    fn with_stimulus(channel: &Channel, stimulus: &Path) -> Channel {
        Channel {
            stimulus: Some(stimulus.to_path_buf()),
            ..channel.clone()
        }
    }

    /// One configuration per trial, in the order they are run.
    pub fn trials(&self) -> Result<Vec<IoConfiguration>, RunError> {
        self.validate()?;
        if self.outputs.is_empty() {
            let duration = self.duration.ok_or(ConfigError::UnknownDuration)?;
            let config = self.configuration(Vec::new(), Some(duration));
            return Ok(vec![config; self.repetitions]);
        }
        if self.stimuli.is_empty() {
            return Err(RunError::NoStimulus);
        }
        if let Some(duration) = self.duration {
            log::warn!(
                "the duration of the recording is given by the stimuli: ignoring {} s",
                duration
            );
        }
        let stimuli = if self.stimuli.len() == 1 && self.outputs.len() > 1 {
            vec![self.stimuli[0].clone(); self.outputs.len()]
        } else {
            self.stimuli.clone()
        };
        if stimuli.len() == self.outputs.len() {
            let outputs: Vec<Channel> = self
                .outputs
                .iter()
                .zip(&stimuli)
                .map(|(channel, stimulus)| Self::with_stimulus(channel, stimulus))
                .collect();
            return Ok(vec![self.configuration(outputs, None); self.repetitions]);
        }
        if self.outputs.len() != 1 {
            return Err(RunError::StimulusCount {
                channels: self.outputs.len(),
                files: stimuli.len(),
            });
        }
        let output = &self.outputs[0];
        let per_repetition: Vec<IoConfiguration> = stimuli
            .iter()
            .map(|stimulus| self.configuration(vec![Self::with_stimulus(output, stimulus)], None))
            .collect();
        Ok(per_repetition
            .iter()
            .cycle()
            .take(per_repetition.len() * self.repetitions)
            .cloned()
            .collect())
    }

    pub fn run<E: AcquisitionEngine + ?Sized>(
        &self,
        engine: &E,
        config_path: &Path,
        progress: impl FnMut(usize, usize),
    ) -> Result<RunSummary, RunError> {
        let trials = self.trials()?;
        run_trials(engine, config_path, &trials, self.interval, progress)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub trials: usize,
    pub failed: usize,
}

/// Write each configuration to `config_path` and hand it to the engine. A
/// failed trial is logged and the run goes on.
pub fn run_trials<E: AcquisitionEngine + ?Sized>(
    engine: &E,
    config_path: &Path,
    trials: &[IoConfiguration],
    interval: f64,
    mut progress: impl FnMut(usize, usize),
) -> Result<RunSummary, RunError> {
    RunPlan::check_schedule(1, interval)?;
    let total = trials.len();
    let mut summary = RunSummary::default();
    for (k, trial) in trials.iter().enumerate() {
        trial.write(config_path)?;
        progress(k + 1, total);
        if let Err(err) = engine.run(config_path) {
            log::warn!("trial {} of {} failed: {}", k + 1, total, err);
            summary.failed += 1;
        }
        summary.trials += 1;
        if k + 1 < total && interval > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(interval));
        }
    }
    Ok(summary)
}

/// `Trial 02/10   [=====>        ] ` with a bar `width` characters wide.
pub fn progress_line(count: usize, total: usize, width: usize) -> String {
    let fraction = if total == 0 {
        1.0
    } else {
        count as f64 / total as f64
    };
    let steps = ((fraction * width as f64).round() as usize).min(width);
    format!(
        "Trial {:02}/{:02}   [{}>{}] ",
        count,
        total,
        "=".repeat(steps.saturating_sub(1)),
        " ".repeat(width - steps)
    )
}
