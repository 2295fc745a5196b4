//! Ready-made stimulation protocols built on top of [`Segment`].

use super::{compose, default_preamble, write_stimulus, Composition, Segment, DEFAULT_SEED};
use crate::error::{ConfigError, StimulusError};
use crate::io::template::{find_configuration_file, substitute_strings};
use rand::Rng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Seed stored in the gain-modulation and f-I protocols.
pub const PROTOCOL_SEED: u64 = 3532765;

/// Draw a seed the way the engine's stochastic generators expect them: Poisson with mean 10000.
pub fn random_seed<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    match Poisson::new(10000.0) {
        Ok(poisson) => {
            let value: f64 = poisson.sample(rng);
            value as u64
        }
        Err(_) => 10000,
    }
}

/// A train of `count` square pulses at `frequency`, framed by `delay` seconds of
/// silence, optionally followed by a recovery pulse 500 ms after the train.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseTrain {
    pub frequency: f64,
    /// Pulse duration in milliseconds.
    pub pulse_ms: f64,
    pub amplitude: f64,
    pub count: usize,
    pub delay: f64,
    pub with_recovery: bool,
}

impl Default for PulseTrain {
    fn default() -> Self {
        Self {
            frequency: 10.0,
            pulse_ms: 1.0,
            amplitude: 0.0,
            count: 10,
            delay: 1.0,
            with_recovery: true,
        }
    }
}

impl PulseTrain {
    pub fn segments(&self) -> Result<Vec<Segment>, StimulusError> {
        if !(self.frequency > 0.0) {
            return Err(StimulusError::InvalidFrequency(self.frequency));
        }
        let pulse = self.pulse_ms * 1e-3;
        let period = 1.0 / self.frequency;
        if pulse > period {
            return Err(StimulusError::PulseTooLong {
                duration: pulse,
                period,
            });
        }
        let row = |duration: f64, amplitude: f64| {
            Segment::dc(duration, amplitude).with_seed_column(DEFAULT_SEED)
        };
        let mut rows = vec![row(self.delay, 0.0)];
        for i in 0..self.count {
            rows.push(row(pulse, self.amplitude));
            if i + 1 != self.count {
                rows.push(row(period - pulse, 0.0));
            }
        }
        if self.with_recovery {
            rows.push(row(0.5, 0.0));
            rows.push(row(pulse, self.amplitude));
        }
        rows.push(row(self.delay, 0.0));
        Ok(rows)
    }

    /// Write the train and return its duration in seconds.
    pub fn write(&self, path: &Path) -> Result<f64, StimulusError> {
        let summary = write_stimulus(path, &self.segments()?, false)?;
        log::info!("the total duration of the stimulus is {} s", summary.duration);
        Ok(summary.duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Synapse {
    Excitatory,
    Inhibitory,
}

impl Synapse {
    /// Unitary conductance (nS) for an input resistance in MOhm.
    pub fn unitary_conductance(self, input_resistance: f64) -> f64 {
        let scale = match self {
            Synapse::Excitatory => 0.02,
            Synapse::Inhibitory => 0.06,
        };
        scale / input_resistance * 1e3
    }
}

impl FromStr for Synapse {
    type Err = StimulusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exc" => Ok(Synapse::Excitatory),
            "inh" => Ok(Synapse::Inhibitory),
            other => Err(StimulusError::UnknownSynapse(other.to_string())),
        }
    }
}

/// OU conductance whose mean and variance are modulated by a sinusoid of frequency
/// `frequency`, for a presynaptic rate `rate + modulation * sin(2 pi f t)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModulatedConductance {
    pub frequency: f64,
    pub rate: f64,
    pub modulation: f64,
    /// Input resistance (MOhm).
    pub input_resistance: f64,
    /// Synaptic time constant (ms).
    pub tau: f64,
    pub duration: f64,
    pub synapse: Synapse,
    pub seed: u64,
}

impl ModulatedConductance {
    pub fn segments(&self) -> Vec<Segment> {
        let g = self.synapse.unitary_conductance(self.input_resistance);
        let tau = self.tau * 1e-3;
        let variance = g * g * tau / 2.0;
        let mean = g * tau;
        let mut rows = vec![Segment::dc(PREAMBLE_LENGTH, 0.0)];
        rows.extend(compose(
            Segment::ornstein_uhlenbeck(self.duration, 0.0, 1.0, self.tau).with_seed(self.seed),
            vec![
                (
                    Segment::sine(
                        0.0,
                        variance * self.modulation,
                        self.frequency,
                        0.0,
                        variance * self.rate,
                    )
                    .with_exponent(0.5),
                    Composition::Product,
                ),
                (
                    Segment::sine(
                        0.0,
                        mean * self.modulation,
                        self.frequency,
                        0.0,
                        mean * self.rate,
                    ),
                    Composition::Sum,
                ),
            ],
        ));
        rows.push(Segment::dc(1.0, 0.0));
        rows
    }

    pub fn write(&self, path: &Path) -> Result<f64, StimulusError> {
        Ok(write_stimulus(path, &self.segments(), false)?.duration)
    }
}

/// Silence preceding conductance stimuli, matching the length of the current preamble.
const PREAMBLE_LENGTH: f64 = super::PREAMBLE_DURATION;

/// Parameters of an OU conductance: mean and standard deviation in nS, tau in ms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conductance {
    pub mean: f64,
    pub std: f64,
    pub tau: f64,
    pub seed: Option<u64>,
}

impl Conductance {
    pub fn excitatory(mean: f64, std: f64) -> Self {
        Self {
            mean,
            std,
            tau: 5.0,
            seed: None,
        }
    }

    pub fn inhibitory(mean: f64, std: f64) -> Self {
        Self {
            mean,
            std,
            tau: 10.0,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn segment<R: Rng + ?Sized>(&self, duration: f64, rng: &mut R) -> Segment {
        let seed = self.seed.unwrap_or_else(|| random_seed(rng));
        Segment::ornstein_uhlenbeck(duration, self.mean, self.std, self.tau).with_seed(seed)
    }
}

/// Write `gexc.stim`-style files: silence, OU conductance, silence.
pub fn write_conductance_files<R: Rng + ?Sized>(
    excitatory: &Conductance,
    inhibitory: &Conductance,
    duration: f64,
    before: f64,
    after: f64,
    outfiles: [&Path; 2],
    rng: &mut R,
) -> Result<(), StimulusError> {
    for (conductance, path) in [excitatory, inhibitory].into_iter().zip(outfiles) {
        let rows = vec![
            Segment::dc(before, 0.0),
            conductance.segment(duration, rng),
            Segment::dc(after, 0.0),
        ];
        write_stimulus(path, &rows, false)?;
    }
    Ok(())
}

/// A DC current on top of excitatory and inhibitory background conductances.
///
/// Writes `current.stim`, `gexc.stim` and `ginh.stim` to a directory and fills in
/// the channels and duration of a configuration template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPlusBackground {
    pub current: f64,
    pub excitatory: Conductance,
    pub inhibitory: Conductance,
    pub input_channel: u32,
    pub output_channel: u32,
    pub duration: f64,
}

/// Name of the configuration template used by [`CurrentPlusBackground`].
pub const CURRENT_PLUS_BACKGROUND_TEMPLATE: &str = "I_plus_bg_G_template.xml";

impl CurrentPlusBackground {
    /// Spontaneous activity: standard synaptic time constants, random seeds.
    pub fn spontaneous(
        current: f64,
        excitatory: (f64, f64),
        inhibitory: (f64, f64),
        duration: f64,
    ) -> Self {
        Self {
            current,
            excitatory: Conductance::excitatory(excitatory.0, excitatory.1),
            inhibitory: Conductance::inhibitory(inhibitory.0, inhibitory.1),
            input_channel: 0,
            output_channel: 0,
            duration,
        }
    }

    pub fn with_channels(mut self, input: u32, output: u32) -> Self {
        self.input_channel = input;
        self.output_channel = output;
        self
    }

    pub fn current_segments(&self) -> Vec<Segment> {
        let mut rows = default_preamble();
        rows.push(Segment::dc(self.duration, self.current));
        rows.push(Segment::dc(1.0, 0.0));
        rows
    }

    /// Length of the configured run: the stimulus plus preamble and trailing second.
    pub fn total_duration(&self) -> f64 {
        self.duration + PREAMBLE_LENGTH + 1.0
    }

    /// Write the stimulus files into `dir` and the configuration to `outfile`.
    /// Without an explicit template the default one is looked up in the
    /// configurations directory.
    pub fn write<R: Rng + ?Sized>(
        &self,
        dir: &Path,
        outfile: &Path,
        template: Option<&Path>,
        rng: &mut R,
    ) -> Result<(), ConfigError> {
        let template = resolve_template(template, CURRENT_PLUS_BACKGROUND_TEMPLATE)?;
        write_stimulus(&dir.join("current.stim"), &self.current_segments(), false)?;
        write_conductance_files(
            &self.excitatory,
            &self.inhibitory,
            self.duration,
            PREAMBLE_LENGTH,
            1.0,
            [&dir.join("gexc.stim"), &dir.join("ginh.stim")],
            rng,
        )?;
        let rules = [
            (
                "<readChannel>0</readChannel>",
                format!("<readChannel>{}</readChannel>", self.input_channel),
            ),
            (
                "<writeChannel>0</writeChannel>",
                format!("<writeChannel>{}</writeChannel>", self.output_channel),
            ),
            (
                "<tend>0</tend>",
                format!("<tend>{}</tend>", self.total_duration()),
            ),
        ];
        substitute_strings(&template, outfile, &rules)
    }
}

fn resolve_template(template: Option<&Path>, default: &str) -> Result<PathBuf, ConfigError> {
    match template {
        Some(path) => Ok(path.to_path_buf()),
        None => find_configuration_file(default)
            .ok_or_else(|| ConfigError::TemplateNotFound(default.to_string())),
    }
}

/// Background current for the sinusoids protocol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackgroundCurrent {
    Dc(f64),
    Noisy { mean: f64, std: f64, tau: f64 },
}

/// Current templates with a sinusoid whose frequency is the placeholder `F`,
/// on top of fixed-seed background conductances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinusoidsProtocol {
    pub background: BackgroundCurrent,
    pub modulation: f64,
    pub excitatory: (f64, f64),
    pub inhibitory: (f64, f64),
    pub input_channel: u32,
    pub output_channel: u32,
    pub duration: f64,
}

impl SinusoidsProtocol {
    pub fn current_segments(&self) -> Vec<Segment> {
        let sine = Segment::sine(self.duration, self.modulation, "F", 0.0, 0.0);
        let mut rows = match self.background {
            BackgroundCurrent::Dc(amplitude) if amplitude == 0.0 => vec![sine],
            BackgroundCurrent::Noisy { mean, std, .. } if mean == 0.0 && std == 0.0 => {
                vec![sine]
            }
            BackgroundCurrent::Dc(amplitude) => compose(
                Segment::dc(self.duration, amplitude),
                vec![(sine, Composition::Sum)],
            ),
            BackgroundCurrent::Noisy { mean, std, tau } => compose(
                Segment::ornstein_uhlenbeck(self.duration, mean, std, tau).with_seed(DEFAULT_SEED),
                vec![(sine, Composition::Sum)],
            ),
        };
        rows.push(Segment::dc(1.0, 0.0));
        rows
    }

    /// Writes `current_template.stim`, `gexc_template.stim`, `ginh_template.stim`
    /// and the configuration.
    pub fn write(
        &self,
        dir: &Path,
        outfile: &Path,
        template: Option<&Path>,
    ) -> Result<(), ConfigError> {
        let base = CurrentPlusBackground {
            current: 0.0,
            excitatory: Conductance::excitatory(self.excitatory.0, self.excitatory.1)
                .with_seed(DEFAULT_SEED),
            inhibitory: Conductance::inhibitory(self.inhibitory.0, self.inhibitory.1)
                .with_seed(DEFAULT_SEED),
            input_channel: self.input_channel,
            output_channel: self.output_channel,
            duration: self.duration,
        };
        let template = resolve_template(template, CURRENT_PLUS_BACKGROUND_TEMPLATE)?;
        base.write(dir, outfile, Some(&template), &mut rand::thread_rng())?;
        for name in ["gexc", "ginh"] {
            let from = dir.join(format!("{}.stim", name));
            let to = dir.join(format!("{}_template.stim", name));
            std::fs::rename(&from, &to).map_err(|e| ConfigError::io(&from, e))?;
        }
        let current = dir.join("current.stim");
        std::fs::remove_file(&current).map_err(|e| ConfigError::io(&current, e))?;
        write_stimulus(
            &dir.join("current_template.stim"),
            &self.current_segments(),
            true,
        )?;
        Ok(())
    }
}

/// Current steps of amplitude `I` (placeholder) on top of background conductances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainModulationProtocol {
    pub excitatory: (f64, f64),
    pub inhibitory: (f64, f64),
    pub input_channel: u32,
    pub output_channel: u32,
    pub duration: f64,
}

impl GainModulationProtocol {
    pub fn current_segments(&self) -> Vec<Segment> {
        let mut rows = default_preamble();
        if let Some(last) = rows.last_mut() {
            last.duration = 4.0;
        }
        rows.push(Segment::dc(self.duration, "I"));
        rows.push(Segment::dc(1.0, 0.0));
        rows.into_iter()
            .map(|row| row.with_seed_column(PROTOCOL_SEED))
            .collect()
    }

    /// Writes `template.stim`, `gexc.stim`, `ginh.stim` and the configuration.
    pub fn write<R: Rng + ?Sized>(
        &self,
        dir: &Path,
        outfile: &Path,
        template: Option<&Path>,
        rng: &mut R,
    ) -> Result<(), ConfigError> {
        let base = CurrentPlusBackground {
            current: 0.0,
            excitatory: Conductance::excitatory(self.excitatory.0, self.excitatory.1),
            inhibitory: Conductance::inhibitory(self.inhibitory.0, self.inhibitory.1),
            input_channel: self.input_channel,
            output_channel: self.output_channel,
            duration: self.duration + 3.0,
        };
        base.write(dir, outfile, template, rng)?;
        let current = dir.join("current.stim");
        std::fs::remove_file(&current).map_err(|e| ConfigError::io(&current, e))?;
        write_stimulus(&dir.join("template.stim"), &self.current_segments(), false)?;
        Ok(())
    }
}

/// Frequency clamp: a PID controller drives the injected current towards a target
/// firing rate read from `frequency.stim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyClamp {
    pub frequency: f64,
    pub baseline_current: f64,
    pub duration: f64,
    pub gp: f64,
    pub gi: f64,
    pub gd: f64,
    pub tau: f64,
    pub input_channel: u32,
    pub output_channel: u32,
    pub background: Option<(Conductance, Conductance)>,
}

pub const FCLAMP_TEMPLATE: &str = "fclamp_template.xml";
pub const FCLAMP_BACKGROUND_TEMPLATE: &str = "fclamp_plus_bg_G_template.xml";

impl FrequencyClamp {
    pub fn new(frequency: f64, baseline_current: f64, duration: f64, gp: f64, gi: f64) -> Self {
        Self {
            frequency,
            baseline_current,
            duration,
            gp,
            gi,
            gd: 0.0,
            tau: 1.0,
            input_channel: 0,
            output_channel: 0,
            background: None,
        }
    }

    /// Placeholders of the frequency clamp templates, in substitution order.
    pub fn rules(&self) -> Vec<(&'static str, String)> {
        vec![
            ("TEND", self.duration.to_string()),
            ("AI", self.input_channel.to_string()),
            ("AO", self.output_channel.to_string()),
            ("TAU", self.tau.to_string()),
            ("F0", (0.75 * self.frequency).to_string()),
            ("I0", self.baseline_current.to_string()),
            ("GP", self.gp.to_string()),
            ("GI", self.gi.to_string()),
            ("GD", self.gd.to_string()),
        ]
    }

    pub fn write<R: Rng + ?Sized>(
        &self,
        dir: &Path,
        outfile: &Path,
        template: Option<&Path>,
        rng: &mut R,
    ) -> Result<(), ConfigError> {
        let default = if self.background.is_some() {
            FCLAMP_BACKGROUND_TEMPLATE
        } else {
            FCLAMP_TEMPLATE
        };
        let template = resolve_template(template, default)?;
        write_stimulus(
            &dir.join("frequency.stim"),
            &[Segment::dc(self.duration, self.frequency)],
            false,
        )?;
        if let Some((exc, inh)) = &self.background {
            for (conductance, name) in [(exc, "gexc.stim"), (inh, "ginh.stim")] {
                write_stimulus(
                    &dir.join(name),
                    &[conductance.segment(self.duration, rng)],
                    false,
                )?;
            }
        }
        substitute_strings(&template, outfile, &self.rules())
    }
}

/// One stimulus per current step for an f-I curve: preamble, 5 s step, 100 ms rest.
pub fn fi_curve_segments(amplitudes: &[f64], noisy: bool) -> Vec<Vec<Segment>> {
    amplitudes
        .iter()
        .map(|&amplitude| {
            let mut rows = default_preamble();
            if noisy {
                if let Some(last) = rows.last_mut() {
                    last.duration = 4.0;
                }
            }
            rows.push(Segment::dc(5.0, amplitude));
            rows.push(Segment::dc(0.1, 0.0));
            rows.into_iter()
                .map(|row| row.with_seed_column(PROTOCOL_SEED))
                .collect()
        })
        .collect()
}

/// Write `fi_01.stim`, `fi_02.stim`, ... for amplitudes from `min` to `max` inclusive.
pub fn write_fi_stimuli(
    dir: &Path,
    min: f64,
    max: f64,
    step: f64,
    noisy: bool,
) -> Result<Vec<PathBuf>, StimulusError> {
    if !(step > 0.0) {
        return Err(StimulusError::InvalidSegment(format!(
            "current step must be positive, got {}",
            step
        )));
    }
    let count = ((max - min) / step + 1e-9).floor() as usize + 1;
    let amplitudes: Vec<f64> = (0..count).map(|k| min + k as f64 * step).collect();
    let mut written = Vec::with_capacity(count);
    for (k, rows) in fi_curve_segments(&amplitudes, noisy).into_iter().enumerate() {
        let path = dir.join(format!("fi_{:02}.stim", k + 1));
        write_stimulus(&path, &rows, false)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::{param, read_stimulus, Field, Waveform};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn pulse_train_duration() {
        let train = PulseTrain {
            frequency: 10.0,
            pulse_ms: 1.0,
            amplitude: 500.0,
            count: 3,
            delay: 1.0,
            with_recovery: false,
        };
        let rows = train.segments().unwrap();
        // delay + 3 pulses + 2 gaps + delay
        assert_eq!(rows.len(), 7);
        let total: f64 = rows.iter().map(|r| r.duration).sum();
        assert!((total - (2.0 + 3.0 * 0.001 + 2.0 * 0.099)).abs() < 1e-9);
        assert!(rows
            .iter()
            .all(|r| r.params[param::SEED] == Field::Number(DEFAULT_SEED as f64)));
    }

    #[test]
    fn pulse_train_rejects_bad_frequency() {
        let train = PulseTrain {
            frequency: 0.0,
            ..PulseTrain::default()
        };
        assert!(matches!(
            train.segments(),
            Err(StimulusError::InvalidFrequency(_))
        ));
        let train = PulseTrain {
            frequency: 1000.0,
            pulse_ms: 5.0,
            ..PulseTrain::default()
        };
        assert!(matches!(
            train.segments(),
            Err(StimulusError::PulseTooLong { .. })
        ));
    }

    #[test]
    fn modulated_conductance_rows() {
        let stim = ModulatedConductance {
            frequency: 5.0,
            rate: 1000.0,
            modulation: 100.0,
            input_resistance: 100.0,
            tau: 5.0,
            duration: 10.0,
            synapse: "exc".parse().unwrap(),
            seed: 1,
        };
        let rows = stim.segments();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[1].code, -3);
        assert_eq!(rows[2].params[param::EXPONENT], Field::Number(0.5));
        let g = 0.2;
        let expected = g * 5e-3 * 1000.0;
        assert!((rows[3].params[param::P4].as_number().unwrap() - expected).abs() < 1e-12);
        assert!("glu".parse::<Synapse>().is_err());
    }

    #[test]
    fn conductance_files_use_given_or_random_seeds() {
        let dir = tempdir().unwrap();
        let exc = dir.path().join("gexc.stim");
        let inh = dir.path().join("ginh.stim");
        let mut rng = StdRng::seed_from_u64(3);
        write_conductance_files(
            &Conductance::excitatory(10.0, 2.0).with_seed(17),
            &Conductance::inhibitory(20.0, 4.0),
            5.0,
            1.0,
            0.5,
            [&exc, &inh],
            &mut rng,
        )
        .unwrap();
        let rows = read_stimulus(&exc).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].waveform().unwrap(), Waveform::OrnsteinUhlenbeck);
        assert_eq!(rows[1].params[param::SEED], Field::Number(17.0));
        let rows = read_stimulus(&inh).unwrap();
        let seed = rows[1].params[param::SEED].as_number().unwrap();
        assert!(seed > 9000.0 && seed < 11000.0);
        assert_eq!(rows[1].params[param::P3], Field::Number(10.0));
    }

    #[test]
    fn current_plus_background_fills_template() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("template.xml");
        fs::write(
            &template,
            "<readChannel>0</readChannel>\n<writeChannel>0</writeChannel>\n<tend>0</tend>\n",
        )
        .unwrap();
        let out = dir.path().join("config.xml");
        let protocol =
            CurrentPlusBackground::spontaneous(100.0, (10.0, 2.0), (20.0, 4.0), 10.0)
                .with_channels(2, 1);
        let mut rng = StdRng::seed_from_u64(0);
        protocol
            .write(dir.path(), &out, Some(&template), &mut rng)
            .unwrap();
        let config = fs::read_to_string(&out).unwrap();
        assert!(config.contains("<readChannel>2</readChannel>"));
        assert!(config.contains("<writeChannel>1</writeChannel>"));
        let tend: f64 = config
            .split("<tend>")
            .nth(1)
            .and_then(|rest| rest.split("</tend>").next())
            .unwrap()
            .parse()
            .unwrap();
        assert!((tend - 13.61).abs() < 1e-9);
        let current = read_stimulus(&dir.path().join("current.stim")).unwrap();
        assert_eq!(current.len(), 7);
        assert!(dir.path().join("ginh.stim").exists());
    }

    #[test]
    fn sinusoids_write_templates() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("template.xml");
        fs::write(&template, "<tend>0</tend>\n").unwrap();
        let protocol = SinusoidsProtocol {
            background: BackgroundCurrent::Dc(50.0),
            modulation: 20.0,
            excitatory: (10.0, 2.0),
            inhibitory: (20.0, 4.0),
            input_channel: 0,
            output_channel: 0,
            duration: 30.0,
        };
        protocol
            .write(dir.path(), &dir.path().join("sinusoids.xml"), Some(&template))
            .unwrap();
        assert!(!dir.path().join("current.stim").exists());
        assert!(dir.path().join("gexc_template.stim").exists());
        let rows = read_stimulus(&dir.path().join("current_template.stim")).unwrap();
        // preamble, composed DC + sine, trailing second
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[6].params[param::P2], Field::Placeholder("F".into()));
    }

    #[test]
    fn frequency_clamp_rules_are_ordered() {
        let clamp = FrequencyClamp::new(20.0, 100.0, 10.0, 0.5, 0.1);
        let rules = clamp.rules();
        assert_eq!(rules[0], ("TEND", "10".to_string()));
        assert_eq!(rules[4], ("F0", "15".to_string()));
    }

    #[test]
    fn fi_stimuli_are_numbered() {
        let dir = tempdir().unwrap();
        let files = write_fi_stimuli(dir.path(), 100.0, 300.0, 100.0, false).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[2].ends_with("fi_03.stim"));
        let rows = read_stimulus(&files[1]).unwrap();
        assert_eq!(rows[5].params[param::P1], Field::Number(200.0));
    }
}
