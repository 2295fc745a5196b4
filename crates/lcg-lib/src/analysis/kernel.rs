//! Active electrode compensation: estimating the electrode kernel offline.
//!
//! A white-noise current `I` injected through the electrode produces a recorded
//! voltage `V = K * I + V0`. The full kernel `K` (mV/pA, i.e. GOhm) is the solution
//! of the Wiener-Hopf equations; its slow tail is the membrane response and what
//! precedes the tail is the electrode.

use crate::error::AnalysisError;
use nalgebra::{DMatrix, DVector};
use realfft::num_complex::Complex;
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullKernel {
    /// Kernel samples in mV/pA.
    pub kernel: Vec<f64>,
    /// Resting potential (mV).
    pub v0: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSplit {
    /// Electrode kernel (mV/pA), as long as the tail start index.
    pub electrode: Vec<f64>,
    /// Exponential fit of the membrane kernel over the full length (mV/pA).
    pub membrane: Vec<f64>,
    /// Membrane time constant in samples.
    pub tau: f64,
}

impl KernelSplit {
    /// Electrode resistance in MOhm.
    pub fn resistance(&self) -> f64 {
        self.electrode.iter().sum::<f64>() * 1e3
    }

    /// Last sample of the electrode kernel relative to its maximum, in percent.
    pub fn tail_ratio(&self) -> Option<f64> {
        let max = self.electrode.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let last = *self.electrode.last()?;
        (max != 0.0).then(|| last / max * 100.0)
    }

    /// Electrode kernel in MOhm.
    pub fn electrode_mohm(&self) -> Vec<f64> {
        self.electrode.iter().map(|k| k * 1e3).collect()
    }
}

/// `out[k] = sum_n x[n + k] * y[n] / (N - k)` for `k < lags`, via zero-padded FFTs.
fn cross_correlation(x: &[f64], y: &[f64], lags: usize) -> Result<Vec<f64>, AnalysisError> {
    let n = x.len();
    let len = (n + lags).next_power_of_two();
    let mut planner = RealFftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(len);
    let inverse = planner.plan_fft_inverse(len);
    let fft_error = |err: realfft::FftError| AnalysisError::Fft(err.to_string());

    let mut spectra: Vec<Vec<Complex<f64>>> = Vec::with_capacity(2);
    for signal in [x, y] {
        let mut input = forward.make_input_vec();
        input[..n].copy_from_slice(signal);
        let mut spectrum = forward.make_output_vec();
        forward.process(&mut input, &mut spectrum).map_err(fft_error)?;
        spectra.push(spectrum);
    }
    let mut product: Vec<Complex<f64>> = spectra[0]
        .iter()
        .zip(&spectra[1])
        .map(|(a, b)| a * b.conj())
        .collect();
    if let Some(first) = product.first_mut() {
        first.im = 0.0;
    }
    if let Some(last) = product.last_mut() {
        last.im = 0.0;
    }
    let mut output = inverse.make_output_vec();
    inverse.process(&mut product, &mut output).map_err(fft_error)?;
    Ok(output[..lags]
        .iter()
        .enumerate()
        .map(|(k, value)| value / len as f64 / (n - k) as f64)
        .collect())
}

/// Solve the Wiener-Hopf equations for a kernel of `ksize` samples.
pub fn full_kernel(voltage: &[f64], current: &[f64], ksize: usize) -> Result<FullKernel, AnalysisError> {
    let n = voltage.len();
    if n == 0 {
        return Err(AnalysisError::Empty);
    }
    if current.len() != n {
        return Err(AnalysisError::LengthMismatch(n, current.len()));
    }
    if ksize == 0 || ksize >= n {
        return Err(AnalysisError::BadKernelSize { ksize, samples: n });
    }
    let v_ref = voltage.iter().sum::<f64>() / n as f64;
    let i_ref = current.iter().sum::<f64>() / n as f64;
    let v: Vec<f64> = voltage.iter().map(|v| v - v_ref).collect();
    let i: Vec<f64> = current.iter().map(|i| i - i_ref).collect();

    let vi = cross_correlation(&v, &i, ksize)?;
    let ii = cross_correlation(&i, &i, ksize)?;
    let toeplitz = DMatrix::from_fn(ksize, ksize, |r, c| ii[r.abs_diff(c)]);
    let kernel = toeplitz
        .lu()
        .solve(&DVector::from_vec(vi))
        .ok_or(AnalysisError::Singular)?;
    let kernel: Vec<f64> = kernel.iter().copied().collect();
    let v0 = v_ref - kernel.iter().sum::<f64>() * i_ref;
    log::debug!("full kernel: {} samples, V0 = {} mV", ksize, v0);
    Ok(FullKernel { kernel, v0 })
}

/// Split the full kernel: fit `A exp(-n/tau)` to the tail starting at `tail_start`
/// and subtract it from the head.
pub fn electrode_kernel(kernel: &[f64], tail_start: usize) -> Result<KernelSplit, AnalysisError> {
    if tail_start == 0 || tail_start >= kernel.len() {
        return Err(AnalysisError::BadTailStart {
            start: tail_start,
            len: kernel.len(),
        });
    }
    let points: Vec<(f64, f64)> = kernel[tail_start..]
        .iter()
        .enumerate()
        .filter(|(_, k)| **k > 0.0)
        .map(|(j, k)| ((tail_start + j) as f64, k.ln()))
        .collect();
    if points.len() < 2 {
        return Err(AnalysisError::TailFit);
    }
    let count = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / count;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / count;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let sxy: f64 = points
        .iter()
        .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
        .sum();
    let slope = sxy / sxx;
    if !(slope < 0.0) {
        return Err(AnalysisError::TailFit);
    }
    let intercept = mean_y - slope * mean_x;
    let membrane: Vec<f64> = (0..kernel.len())
        .map(|n| (intercept + slope * n as f64).exp())
        .collect();
    let electrode = kernel[..tail_start]
        .iter()
        .zip(&membrane)
        .map(|(k, m)| k - m)
        .collect();
    Ok(KernelSplit {
        electrode,
        membrane,
        tau: -1.0 / slope,
    })
}

/// Offline compensation: `V - Ke * I` (causal convolution).
pub fn compensate(voltage: &[f64], current: &[f64], electrode: &[f64]) -> Vec<f64> {
    voltage
        .iter()
        .enumerate()
        .map(|(n, v)| {
            let drop: f64 = electrode
                .iter()
                .enumerate()
                .take(n + 1)
                .filter_map(|(j, k)| current.get(n - j).map(|i| k * i))
                .sum();
            v - drop
        })
        .collect()
}

/// Length (s) of the step recorded before the white noise.
pub const PULSE_DURATION: f64 = 0.01;

/// Samples from 20 ms before to 80 ms after the end of the first 10 ms segment,
/// where recorded and compensated voltages are compared.
pub fn pulse_window(durations: &[f64], dt: f64, samples: usize) -> Option<Range<usize>> {
    let mut end = 0.0;
    let pulse = durations.iter().find(|&&d| {
        end += d;
        (d - PULSE_DURATION).abs() < 1e-9
    });
    if pulse.is_none() || samples == 0 {
        return None;
    }
    let from = (end - 0.02).max(0.0);
    let to = (end + 0.08).min((samples - 1) as f64 * dt);
    let first = (0..samples).position(|n| n as f64 * dt > from)?;
    let last = (0..samples)
        .position(|n| n as f64 * dt >= to)
        .unwrap_or(samples);
    (last > first).then_some(first..last)
}
