//! Seal test: repeated voltage-clamp test pulses and a running estimate of the
//! pipette (or membrane) resistance.

use crate::{AcquisitionEngine, RunError};
use lcg_lib::analysis::fit::{fit_biexponential, BiExponential, FitReport};
use lcg_lib::analysis::resistance::{
    displayed_resistance, estimate_resistance, representative_trace, ResistanceEstimate,
    AVERAGED_TRACES,
};
use lcg_lib::env::{ClampMode, Gain, LabDefaults};
use lcg_lib::io::config::{Channel, Device, IoConfiguration};
use lcg_lib::io::trace::{load_trace, Recording};
use lcg_lib::signal::{average_traces, linspace};
use lcg_lib::stimulus::{write_stimulus, Segment};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

/// Repetitions kept for display and averaging.
pub const MAX_TRACES: usize = 20;

const STIMULUS_FILE: &str = "seal_test.stim";
const CONFIG_FILE: &str = "seal_test.xml";
const OUTPUT_FILE: &str = "seal_test.h5";

/// Scratch directory for the files of one session, removed when dropped.
#[derive(Debug)]
pub struct SessionFiles {
    dir: TempDir,
}

impl SessionFiles {
    pub fn new(prefix: &str) -> Result<Self, RunError> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .map_err(RunError::Session)?;
        log::debug!("session files in {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the directory now, reporting failures that drop would swallow.
    pub fn close(self) -> Result<(), RunError> {
        self.dir.close().map_err(RunError::Session)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SealTestSettings {
    pub input_channel: u32,
    pub output_channel: u32,
    /// Pulse duration (ms).
    pub duration_ms: f64,
    /// Pulse amplitude (mV).
    pub amplitude: f64,
    pub sampling_rate: f64,
    pub input: Gain,
    pub output: Gain,
    pub device: Device,
}

impl SealTestSettings {
    /// 15 ms pulses of 10 mV with the voltage-clamp gains of the rig.
    pub fn from_defaults(defaults: &LabDefaults) -> Self {
        Self {
            input_channel: defaults.ai_channel,
            output_channel: defaults.ao_channel,
            duration_ms: 15.0,
            amplitude: 10.0,
            sampling_rate: defaults.sampling_rate,
            input: defaults.input_gain(ClampMode::Voltage).clone(),
            output: defaults.output_gain(ClampMode::Voltage).clone(),
            device: defaults.device(),
        }
    }

    /// `d/4` at rest, the pulse, then `d/2` at rest.
    pub fn stimulus(&self) -> Vec<Segment> {
        let d = self.duration_ms * 1e-3;
        vec![
            Segment::dc(d / 4.0, 0.0),
            Segment::dc(d, self.amplitude),
            Segment::dc(d / 2.0, 0.0),
        ]
    }

    pub fn configuration(&self, stimulus: &Path, output: &Path) -> IoConfiguration {
        let channels = vec![
            Channel::input(self.input_channel, self.input.factor, &self.input.units),
            Channel::output(
                self.output_channel,
                self.output.factor,
                &self.output.units,
                stimulus,
            ),
        ];
        let mut config = IoConfiguration::new(self.sampling_rate, channels);
        config.duration = Some(self.duration_ms * 1e-3 * 7.0 / 4.0);
        config.realtime = true;
        config.output_filename = Some(output.to_path_buf());
        config.device = self.device.clone();
        config
    }
}

pub struct SealTest<E> {
    engine: E,
    settings: SealTestSettings,
    files: SessionFiles,
    time: Vec<f64>,
    currents: Vec<Vec<f64>>,
    voltages: Vec<Vec<f64>>,
    resistance: Vec<(f64, f64)>,
    last: Option<ResistanceEstimate>,
    count: usize,
}

impl<E: AcquisitionEngine> SealTest<E> {
    /// Write the stimulus and the configuration into a fresh session directory.
    pub fn new(engine: E, settings: SealTestSettings) -> Result<Self, RunError> {
        let files = SessionFiles::new("seal_test")?;
        let stimulus = files.path(STIMULUS_FILE);
        write_stimulus(&stimulus, &settings.stimulus(), false)?;
        settings
            .configuration(&stimulus, &files.path(OUTPUT_FILE))
            .write(&files.path(CONFIG_FILE))?;
        log::info!(
            "conversion factors are {} {} and {} {}",
            settings.input.factor,
            settings.input.units,
            settings.output.factor,
            settings.output.units
        );
        Ok(Self {
            engine,
            settings,
            files,
            time: Vec::new(),
            currents: Vec::new(),
            voltages: Vec::new(),
            resistance: Vec::new(),
            last: None,
            count: 0,
        })
    }

    pub fn settings(&self) -> &SealTestSettings {
        &self.settings
    }

    pub fn files(&self) -> &SessionFiles {
        &self.files
    }

    pub fn config_path(&self) -> PathBuf {
        self.files.path(CONFIG_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.files.path(OUTPUT_FILE)
    }

    /// Forget every trace and estimate.
    pub fn reset(&mut self) {
        self.time.clear();
        self.currents.clear();
        self.voltages.clear();
        self.resistance.clear();
        self.last = None;
        self.count = 0;
    }

    /// One acquisition cycle. A failure is logged and the cycle skipped; what
    /// was accumulated so far is kept. Returns whether the cycle succeeded.
    pub fn pulse(&mut self) -> bool {
        let result = self
            .engine
            .run(&self.config_path())
            .and_then(|()| load_trace(&self.output_path()).map_err(RunError::from))
            .and_then(|recording| self.ingest(&recording));
        match result {
            Ok(estimate) => {
                log::trace!("R = {:.1} MOhm", estimate.resistance);
                true
            }
            Err(err) => {
                log::warn!("skipping pulse {}: {}", self.count + 1, err);
                false
            }
        }
    }

    /// Add the current (pA) and voltage (mV) traces of a recording and update
    /// the estimate. The traces are kept even when the estimate fails.
    pub fn ingest(&mut self, recording: &Recording) -> Result<ResistanceEstimate, RunError> {
        let current = recording
            .first_with_units("pA")
            .ok_or(RunError::MissingTrace("pA"))?;
        let voltage = recording
            .first_with_units("mV")
            .ok_or(RunError::MissingTrace("mV"))?;
        self.time = linspace(0.0, recording.info.tend * 1e3, voltage.data.len());
        self.currents.push(current.data.clone());
        self.voltages.push(voltage.data.clone());
        if self.currents.len() > MAX_TRACES {
            self.currents.remove(0);
            self.voltages.remove(0);
        }
        self.count += 1;
        let estimate = estimate_resistance(
            &self.time,
            &self.voltages,
            &self.currents,
            self.settings.duration_ms,
        )?;
        let started = recording
            .info
            .extra
            .get("startTimeSec")
            .and_then(|value| value.as_number())
            .unwrap_or_else(now);
        self.resistance.push((started, estimate.resistance));
        self.last = Some(estimate);
        Ok(estimate)
    }

    /// Sample times (ms) of the latest repetition.
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn currents(&self) -> &[Vec<f64>] {
        &self.currents
    }

    pub fn voltages(&self) -> &[Vec<f64>] {
        &self.voltages
    }

    /// Repetitions ingested since the last reset.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn last_estimate(&self) -> Option<&ResistanceEstimate> {
        self.last.as_ref()
    }

    /// Resistance estimates (MOhm) against the seconds elapsed since the first.
    pub fn resistance_history(&self) -> Vec<(f64, f64)> {
        let Some(&(start, _)) = self.resistance.first() else {
            return Vec::new();
        };
        self.resistance
            .iter()
            .map(|&(t, r)| (t - start, r))
            .collect()
    }

    pub fn displayed_resistance(&self) -> Option<f64> {
        let values: Vec<f64> = self.resistance.iter().map(|(_, r)| *r).collect();
        displayed_resistance(&values)
    }

    /// The current trace the estimate is computed on.
    pub fn mean_current(&self) -> Option<Vec<f64>> {
        representative_trace(&self.currents)
    }

    /// Smallest and largest current held.
    pub fn current_bounds(&self) -> Option<(f64, f64)> {
        self.currents
            .iter()
            .flatten()
            .fold(None, |bounds, &i| match bounds {
                None => Some((i, i)),
                Some((lo, hi)) => Some((f64::min(lo, i), f64::max(hi, i))),
            })
    }

    /// Bi-exponential fit of the capacitive transient at the start of the pulse,
    /// on the mean of the latest repetitions. Returns the fitted curve against
    /// time (ms) with the fit itself.
    pub fn fit_transient(&self) -> Result<(Vec<[f64; 2]>, FitReport), RunError> {
        let d = self.settings.duration_ms;
        let last_before = |limit: f64| self.time.iter().rposition(|&t| t < limit);
        let (Some(start), Some(end)) = (last_before(d / 4.0), last_before(d * 5.0 / 4.0)) else {
            return Err(lcg_lib::AnalysisError::EmptyWindow("transient").into());
        };
        let tail = self.currents.len().saturating_sub(AVERAGED_TRACES);
        let current = average_traces(&self.currents[tail..]);
        if end <= start || current.len() < end {
            return Err(lcg_lib::AnalysisError::EmptyWindow("transient").into());
        }
        let t0 = self.time[start];
        let t: Vec<f64> = self.time[start..end].iter().map(|t| t - t0).collect();
        let report = fit_biexponential(&t, &current[start..end], BiExponential::default())?;
        let curve = t
            .iter()
            .map(|&x| [x + t0, report.params.eval(x)])
            .collect();
        Ok((curve, report))
    }

    /// Stop the session and remove its files.
    pub fn close(self) -> Result<(), RunError> {
        log::info!("stopping after {} pulses", self.count);
        self.files.close()
    }
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcg_lib::io::trace::{write_recording, AttrValue, RunInfo, SchemaVersion, TraceEntity};
    use lcg_lib::stimulus::read_stimulus;
    use std::cell::Cell;
    use std::collections::BTreeMap;

    fn settings() -> SealTestSettings {
        SealTestSettings {
            input_channel: 0,
            output_channel: 1,
            duration_ms: 15.0,
            amplitude: 5.0,
            sampling_rate: 20000.0,
            input: Gain {
                factor: 0.001,
                units: "pA".into(),
            },
            output: Gain {
                factor: 20.0,
                units: "mV".into(),
            },
            device: Device::default(),
        }
    }

    /// A 0/0 -> 5 mV/50 pA pulse sampled every 0.05 ms, started at `start` s.
    fn recording(start: f64, current_step: f64) -> Recording {
        let tend = 0.015 * 7.0 / 4.0;
        let time = linspace(0.0, tend * 1e3, 526);
        let pulse = |amplitude: f64| -> Vec<f64> {
            time.iter()
                .map(|&t| if (3.75..18.75).contains(&t) { amplitude } else { 0.0 })
                .collect()
        };
        let mut current = TraceEntity::new(1, pulse(current_step));
        current.units = Some("pA".into());
        let mut voltage = TraceEntity::new(2, pulse(5.0));
        voltage.units = Some("mV".into());
        Recording {
            entities: vec![current, voltage],
            info: RunInfo {
                dt: 5e-5,
                tend,
                version: SchemaVersion::V2,
                extra: BTreeMap::from([("startTimeSec".to_string(), AttrValue::Number(start))]),
            },
        }
    }

    struct FailingEngine;

    impl AcquisitionEngine for FailingEngine {
        fn run(&self, _config: &Path) -> Result<(), RunError> {
            Err(RunError::NoStimulus)
        }
    }

    /// Writes a recording next to the configuration, as the engine would.
    struct ReplayEngine {
        calls: Cell<usize>,
    }

    impl AcquisitionEngine for ReplayEngine {
        fn run(&self, config: &Path) -> Result<(), RunError> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            write_recording(&config.with_file_name(OUTPUT_FILE), &recording(call as f64, 50.0))?;
            Ok(())
        }
    }

    #[test]
    fn writes_the_session_files() {
        let test = SealTest::new(FailingEngine, settings()).unwrap();
        let stimulus = read_stimulus(&test.files().path(STIMULUS_FILE)).unwrap();
        assert_eq!(stimulus.len(), 3);
        let total: f64 = stimulus.iter().map(|s| s.duration).sum();
        assert!((total - 0.02625).abs() < 1e-12);
        let xml = std::fs::read_to_string(test.config_path()).unwrap();
        assert!(xml.contains("H5Recorder"));
        assert!(xml.contains(OUTPUT_FILE));
        let dir = test.files().dir().to_path_buf();
        test.close().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn estimates_from_ingested_recordings() {
        let mut test = SealTest::new(FailingEngine, settings()).unwrap();
        let estimate = test.ingest(&recording(100.0, 50.0)).unwrap();
        assert!((estimate.resistance - 100.0).abs() < 1e-9);
        assert_eq!(test.time().len(), 526);
        assert!((test.time()[525] - 26.25).abs() < 1e-9);
        for k in 1..25 {
            test.ingest(&recording(100.0 + k as f64, 50.0)).unwrap();
        }
        assert_eq!(test.currents().len(), MAX_TRACES);
        assert_eq!(test.count(), 25);
        let history = test.resistance_history();
        assert_eq!(history.len(), 25);
        assert_eq!(history[24].0, 24.0);
        assert!((test.displayed_resistance().unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(test.current_bounds(), Some((0.0, 50.0)));
        test.reset();
        assert!(test.currents().is_empty());
        assert!(test.displayed_resistance().is_none());
    }

    #[test]
    fn keeps_traces_when_the_estimate_fails() {
        let mut test = SealTest::new(FailingEngine, settings()).unwrap();
        assert!(matches!(
            test.ingest(&recording(0.0, 0.0)),
            Err(RunError::Analysis(_))
        ));
        assert_eq!(test.currents().len(), 1);
        assert!(test.resistance_history().is_empty());
    }

    #[test]
    fn failed_pulses_are_skipped() {
        let mut test = SealTest::new(FailingEngine, settings()).unwrap();
        test.ingest(&recording(0.0, 50.0)).unwrap();
        assert!(!test.pulse());
        assert_eq!(test.count(), 1);
        assert_eq!(test.resistance_history().len(), 1);
    }

    #[test]
    fn pulses_read_the_engine_output() {
        let engine = ReplayEngine {
            calls: Cell::new(0),
        };
        let mut test = SealTest::new(engine, settings()).unwrap();
        assert!(test.pulse());
        assert!(test.pulse());
        assert_eq!(test.count(), 2);
        let history = test.resistance_history();
        assert_eq!(history[1].0, 1.0);
        assert!((history[1].1 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn fits_the_transient() {
        let mut test = SealTest::new(FailingEngine, settings()).unwrap();
        test.ingest(&recording(0.0, 50.0)).unwrap();
        let (curve, report) = test.fit_transient().unwrap();
        assert!(!curve.is_empty());
        assert!(report.rms.is_finite());
    }
}
