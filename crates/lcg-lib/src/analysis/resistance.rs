//! Seal and access resistance from voltage-clamp test pulses.
//!
//! A test pulse of duration `d` (ms) is preceded by `d/4` ms at the holding
//! potential and followed by `d/2` ms. The pre-pulse baseline is averaged up to
//! 0.1 ms before the pulse starts, the steady state over the last millisecond of
//! the pulse (again stopping 0.1 ms before its end).

use crate::error::AnalysisError;
use crate::signal::average_traces;
use serde::{Deserialize, Serialize};

/// Traces averaged once enough of them have been collected.
pub const AVERAGED_TRACES: usize = 8;
/// Number of traces that must be exceeded before averaging starts.
pub const AVERAGING_THRESHOLD: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseWindows {
    /// Upper bound (ms) of the baseline window.
    pub pre_end: f64,
    pub post_start: f64,
    pub post_end: f64,
}

impl PulseWindows {
    pub fn for_pulse(duration_ms: f64) -> Self {
        Self {
            pre_end: duration_ms / 4.0 - 0.1,
            post_start: duration_ms * 5.0 / 4.0 - 1.0,
            post_end: duration_ms * 5.0 / 4.0 - 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResistanceEstimate {
    pub voltage_pre: f64,
    pub voltage_post: f64,
    pub current_pre: f64,
    pub current_post: f64,
    /// MOhm when voltages are in mV and currents in pA.
    pub resistance: f64,
}

/// The trace used for the estimate: the mean of the last [`AVERAGED_TRACES`]
/// once more than [`AVERAGING_THRESHOLD`] are held, otherwise the latest one.
pub fn representative_trace(traces: &[Vec<f64>]) -> Option<Vec<f64>> {
    if traces.len() > AVERAGING_THRESHOLD {
        Some(average_traces(&traces[traces.len() - AVERAGED_TRACES..]))
    } else {
        traces.last().cloned()
    }
}

fn window_mean(
    time: &[f64],
    trace: &[f64],
    window: &'static str,
    keep: impl Fn(f64) -> bool,
) -> Result<f64, AnalysisError> {
    let (sum, count) = time
        .iter()
        .zip(trace)
        .filter(|(t, _)| keep(**t))
        .fold((0.0, 0usize), |(sum, count), (_, v)| (sum + v, count + 1));
    if count == 0 {
        return Err(AnalysisError::EmptyWindow(window));
    }
    Ok(sum / count as f64)
}

/// Estimate the resistance from one voltage and one current trace sampled at `time` (ms).
pub fn resistance_from_traces(
    time: &[f64],
    voltage: &[f64],
    current: &[f64],
    duration_ms: f64,
) -> Result<ResistanceEstimate, AnalysisError> {
    if time.is_empty() {
        return Err(AnalysisError::Empty);
    }
    for trace in [voltage, current] {
        if trace.len() != time.len() {
            return Err(AnalysisError::LengthMismatch(time.len(), trace.len()));
        }
    }
    let windows = PulseWindows::for_pulse(duration_ms);
    let pre = |t: f64| t < windows.pre_end;
    let post = |t: f64| t > windows.post_start && t < windows.post_end;
    let voltage_pre = window_mean(time, voltage, "pre", pre)?;
    let voltage_post = window_mean(time, voltage, "post", post)?;
    let current_pre = window_mean(time, current, "pre", pre)?;
    let current_post = window_mean(time, current, "post", post)?;
    let delta_i = current_post - current_pre;
    if delta_i == 0.0 {
        return Err(AnalysisError::ZeroCurrentStep);
    }
    Ok(ResistanceEstimate {
        voltage_pre,
        voltage_post,
        current_pre,
        current_post,
        resistance: 1e3 * (voltage_post - voltage_pre) / delta_i,
    })
}

/// Estimate the resistance from the accumulated repetitions of the test pulse.
pub fn estimate_resistance(
    time: &[f64],
    voltages: &[Vec<f64>],
    currents: &[Vec<f64>],
    duration_ms: f64,
) -> Result<ResistanceEstimate, AnalysisError> {
    let voltage = representative_trace(voltages).ok_or(AnalysisError::Empty)?;
    let current = representative_trace(currents).ok_or(AnalysisError::Empty)?;
    resistance_from_traces(time, &voltage, &current, duration_ms)
}

/// Value shown to the user: the mean of the last ten estimates once more than
/// ten are available, otherwise the latest.
pub fn displayed_resistance(history: &[f64]) -> Option<f64> {
    if history.len() > 10 {
        let tail = &history[history.len() - 10..];
        Some(tail.iter().sum::<f64>() / tail.len() as f64)
    } else {
        history.last().copied()
    }
}
