//! Stimulus files: rows of twelve tab-separated columns, one waveform segment per row.
//!
//! Column layout:
//!
//! | column | meaning |
//! |--------|---------|
//! | 0      | duration (s) |
//! | 1      | waveform code, negative for the head of a composition |
//! | 2..=6  | waveform parameters `p1..p5` |
//! | 7      | fixed-seed flag |
//! | 8      | seed |
//! | 9      | waveform of a composed row |
//! | 10     | operator combining a composed row with the previous ones |
//! | 11     | exponent |
//!
//! The meaning of `p1..p5` depends on the waveform (for DC `p1` is the amplitude, for
//! Ornstein-Uhlenbeck noise `p1..p3` are mean, standard deviation and time constant).

pub mod protocols;

use crate::error::StimulusError;
use csv::{ReaderBuilder, Trim, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;

pub const COLUMNS: usize = 12;

/// Indices into [`Segment::params`] (column minus two).
pub mod param {
    pub const P1: usize = 0;
    pub const P2: usize = 1;
    pub const P3: usize = 2;
    pub const P4: usize = 3;
    pub const P5: usize = 4;
    pub const FIX_SEED: usize = 5;
    pub const SEED: usize = 6;
    pub const SUBCODE: usize = 7;
    pub const OPERATOR: usize = 8;
    pub const EXPONENT: usize = 9;
}

/// Seed used by the pulse protocols when a reproducible stimulus is wanted.
pub const DEFAULT_SEED: u64 = 5061983;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Waveform {
    Dc = 1,
    OrnsteinUhlenbeck = 2,
    Sine = 3,
    Square = 4,
    Saw = 5,
    Sweep = 6,
    Ramp = 7,
    Poisson = 8,
    PoissonBiphasic = 9,
    Bipolar = 10,
    UniformNoise = 11,
}

impl Waveform {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let waveform = match name.to_ascii_lowercase().as_str() {
            "dc" => Waveform::Dc,
            "ou" => Waveform::OrnsteinUhlenbeck,
            "sine" | "sin" => Waveform::Sine,
            "square" => Waveform::Square,
            "saw" => Waveform::Saw,
            "sweep" | "chirp" => Waveform::Sweep,
            "ramp" => Waveform::Ramp,
            "poisson" => Waveform::Poisson,
            "poisson2" => Waveform::PoissonBiphasic,
            "bipolar" => Waveform::Bipolar,
            "noise" | "uniform" => Waveform::UniformNoise,
            _ => return None,
        };
        Some(waveform)
    }
}

impl TryFrom<i32> for Waveform {
    type Error = StimulusError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        let waveform = match code {
            1 => Waveform::Dc,
            2 => Waveform::OrnsteinUhlenbeck,
            3 => Waveform::Sine,
            4 => Waveform::Square,
            5 => Waveform::Saw,
            6 => Waveform::Sweep,
            7 => Waveform::Ramp,
            8 => Waveform::Poisson,
            9 => Waveform::PoissonBiphasic,
            10 => Waveform::Bipolar,
            11 => Waveform::UniformNoise,
            other => return Err(StimulusError::UnknownWaveform(other)),
        };
        Ok(waveform)
    }
}

/// How a composed row is combined with the rows above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Composition {
    Sum = 1,
    Product = 2,
    Difference = 3,
    Ratio = 4,
}

/// A single column value. Template stimulus files carry textual placeholders
/// that are substituted before the file is handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field {
    Number(f64),
    Placeholder(String),
}

impl Field {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Field::Number(value) => Some(*value),
            Field::Placeholder(_) => None,
        }
    }
}

impl Default for Field {
    fn default() -> Self {
        Field::Number(0.0)
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Field::Number(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Placeholder(value.to_string())
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Number(value) => write!(f, "{}", value),
            Field::Placeholder(token) => f.write_str(token),
        }
    }
}

impl FromStr for Field {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<f64>() {
            Ok(value) => Field::Number(value),
            Err(_) => Field::Placeholder(s.to_string()),
        })
    }
}

/// One stimulus row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub duration: f64,
    pub code: i32,
    pub params: [Field; COLUMNS - 2],
}

impl Segment {
    /// A row with all parameters zeroed and unit exponent.
    pub fn new(duration: f64, waveform: Waveform) -> Self {
        let mut params: [Field; COLUMNS - 2] = Default::default();
        params[param::EXPONENT] = Field::Number(1.0);
        Self {
            duration,
            code: waveform.code(),
            params,
        }
    }

    pub fn dc(duration: f64, amplitude: impl Into<Field>) -> Self {
        Self::new(duration, Waveform::Dc).with_param(param::P1, amplitude)
    }

    /// Ornstein-Uhlenbeck noise; `tau` is in milliseconds, as the engine expects.
    pub fn ornstein_uhlenbeck(duration: f64, mean: f64, std: f64, tau: f64) -> Self {
        Self::new(duration, Waveform::OrnsteinUhlenbeck)
            .with_param(param::P1, mean)
            .with_param(param::P2, std)
            .with_param(param::P3, tau)
    }

    pub fn sine(
        duration: f64,
        amplitude: impl Into<Field>,
        frequency: impl Into<Field>,
        phase: f64,
        offset: f64,
    ) -> Self {
        Self::new(duration, Waveform::Sine)
            .with_param(param::P1, amplitude)
            .with_param(param::P2, frequency)
            .with_param(param::P3, phase)
            .with_param(param::P4, offset)
    }

    pub fn with_param(mut self, index: usize, value: impl Into<Field>) -> Self {
        self.params[index] = value.into();
        self
    }

    /// Fix the seed of a stochastic waveform.
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_param(param::FIX_SEED, 1.0)
            .with_param(param::SEED, seed as f64)
    }

    /// Store a seed without fixing it (the engine only reads it for stochastic rows).
    pub fn with_seed_column(self, seed: u64) -> Self {
        self.with_param(param::SEED, seed as f64)
    }

    pub fn with_exponent(self, exponent: f64) -> Self {
        self.with_param(param::EXPONENT, exponent)
    }

    pub fn is_composite(&self) -> bool {
        self.code < 0
    }

    /// The waveform generated by this row, looking through compositions.
    pub fn waveform(&self) -> Result<Waveform, StimulusError> {
        if self.code > 0 {
            return Waveform::try_from(self.code);
        }
        let subcode = self.params[param::SUBCODE]
            .as_number()
            .ok_or(StimulusError::UnknownWaveform(self.code))?;
        Waveform::try_from(subcode as i32)
    }

    /// Rows with zero duration and a positive code carry no signal and are not written.
    pub fn is_dropped_on_write(&self) -> bool {
        self.duration == 0.0 && self.code > 0
    }

    fn to_record(&self) -> Vec<String> {
        let mut record = Vec::with_capacity(COLUMNS);
        record.push(self.duration.to_string());
        record.push(self.code.to_string());
        record.extend(self.params.iter().map(|field| field.to_string()));
        record
    }

    /// Parse the `kind:duration[:p1,p2,...]` shorthand, e.g. `dc:0.5:-100` or
    /// `ou:10:0,50,5,seed=42`.
    pub fn from_spec(spec: &str) -> Result<Self, StimulusError> {
        let invalid = || StimulusError::InvalidSegment(spec.to_string());
        let mut parts = spec.splitn(3, ':');
        let kind = parts.next().ok_or_else(invalid)?;
        let waveform = Waveform::from_name(kind).ok_or_else(invalid)?;
        let duration: f64 = parts
            .next()
            .ok_or_else(invalid)?
            .trim()
            .parse()
            .map_err(|_| invalid())?;
        let mut segment = Segment::new(duration, waveform);
        if let Some(params) = parts.next() {
            let mut slot = param::P1;
            for token in params.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                if let Some(seed) = token.strip_prefix("seed=") {
                    let seed: u64 = seed.parse().map_err(|_| invalid())?;
                    segment = segment.with_seed(seed);
                    continue;
                }
                if slot > param::P5 {
                    return Err(invalid());
                }
                let field: Field = token.parse().unwrap_or_default();
                segment.params[slot] = field;
                slot += 1;
            }
        }
        Ok(segment)
    }
}

/// Combine several rows into a composite waveform: the first row provides the
/// duration, every following row is merged into it with its operator.
pub fn compose(head: Segment, tail: Vec<(Segment, Composition)>) -> Vec<Segment> {
    let count = -(1 + tail.len() as i32);
    let mut rows = Vec::with_capacity(tail.len() + 1);
    let head_code = head.code as f64;
    let mut head = head;
    head.code = count;
    head.params[param::SUBCODE] = Field::Number(head_code);
    head.params[param::OPERATOR] = Field::Number(0.0);
    rows.push(head);
    for (mut segment, op) in tail {
        let code = segment.code as f64;
        segment.duration = 0.0;
        segment.code = count;
        segment.params[param::SUBCODE] = Field::Number(code);
        segment.params[param::OPERATOR] = Field::Number(op as i32 as f64);
        rows.push(segment);
    }
    rows
}

/// Hyperpolarising preamble used to estimate the electrode kernel and the input
/// resistance at the start of a recording.
pub fn default_preamble() -> Vec<Segment> {
    vec![
        Segment::dc(0.5, 0.0),
        Segment::dc(0.01, -300.0),
        Segment::dc(0.5, 0.0),
        Segment::dc(0.6, -100.0),
        Segment::dc(1.0, 0.0),
    ]
}

/// Total duration of [`default_preamble`].
pub const PREAMBLE_DURATION: f64 = 2.61;

/// Outcome of [`write_stimulus`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StimulusSummary {
    /// Sum of the durations of the rows passed in, dropped rows included and
    /// preamble excluded.
    pub duration: f64,
    pub written: usize,
    pub dropped: usize,
}

/// Write `rows` to `path`, optionally preceded by the default preamble.
pub fn write_stimulus(
    path: &Path,
    rows: &[Segment],
    add_preamble: bool,
) -> Result<StimulusSummary, StimulusError> {
    let file = File::create(path).map_err(|e| StimulusError::io(path, e))?;
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);
    if add_preamble {
        for row in default_preamble() {
            writer.write_record(row.to_record())?;
        }
    }
    let mut summary = StimulusSummary {
        duration: 0.0,
        written: 0,
        dropped: 0,
    };
    for row in rows {
        summary.duration += row.duration;
        if row.is_dropped_on_write() {
            summary.dropped += 1;
            continue;
        }
        writer.write_record(row.to_record())?;
        summary.written += 1;
    }
    writer.flush().map_err(|e| StimulusError::io(path, e))?;
    log::debug!(
        "wrote {} rows ({} dropped) to {}",
        summary.written,
        summary.dropped,
        path.display()
    );
    Ok(summary)
}

/// Non-empty rows of stimulus text with their line numbers, split on tabs or
/// spaces. Blank lines and `#` comments are skipped.
fn tokenized_rows(text: &str) -> Result<Vec<(usize, Vec<String>)>, StimulusError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .comment(Some(b'#'))
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = record.position().map(|p| p.line() as usize).unwrap_or(0);
        let tokens: Vec<String> = record
            .iter()
            .flat_map(str::split_whitespace)
            .map(str::to_string)
            .collect();
        if !tokens.is_empty() {
            rows.push((row, tokens));
        }
    }
    Ok(rows)
}

fn numeric(row: usize, what: &str, token: &str) -> Result<f64, StimulusError> {
    token.parse().map_err(|_| StimulusError::MalformedRow {
        row,
        reason: format!("{} `{}` is not numeric", what, token),
    })
}

/// Parse stimulus text. Columns may be separated by tabs or spaces; blank lines and
/// `#` comments are ignored. Every row needs all 12 columns and an integral code.
pub fn parse_stimulus(text: &str) -> Result<Vec<Segment>, StimulusError> {
    let mut rows = Vec::new();
    for (row, tokens) in tokenized_rows(text)? {
        if tokens.len() != COLUMNS {
            return Err(StimulusError::MalformedRow {
                row,
                reason: format!("expected {} columns, found {}", COLUMNS, tokens.len()),
            });
        }
        let duration = numeric(row, "duration", &tokens[0])?;
        let code = numeric(row, "code", &tokens[1])?;
        if code.fract() != 0.0 || code < f64::from(i32::MIN) || code > f64::from(i32::MAX) {
            return Err(StimulusError::MalformedRow {
                row,
                reason: format!("code `{}` is not a waveform code", tokens[1]),
            });
        }
        let mut params: [Field; COLUMNS - 2] = Default::default();
        for (slot, token) in params.iter_mut().zip(&tokens[2..]) {
            *slot = token.parse().unwrap_or_default();
        }
        rows.push(Segment {
            duration,
            code: code as i32,
            params,
        });
    }
    Ok(rows)
}

pub fn read_stimulus(path: &Path) -> Result<Vec<Segment>, StimulusError> {
    let text = fs::read_to_string(path).map_err(|e| StimulusError::io(path, e))?;
    parse_stimulus(&text)
}

/// Duration of stimulus text: the sum of its first column. Rows may have any
/// number of columns.
pub fn stimulus_duration(text: &str) -> Result<f64, StimulusError> {
    tokenized_rows(text)?
        .iter()
        .map(|(row, tokens)| numeric(*row, "duration", &tokens[0]))
        .sum()
}

pub fn stimulus_file_duration(path: &Path) -> Result<f64, StimulusError> {
    let text = fs::read_to_string(path).map_err(|e| StimulusError::io(path, e))?;
    stimulus_duration(&text)
}
