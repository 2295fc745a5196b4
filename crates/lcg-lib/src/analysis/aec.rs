//! Online active electrode compensation, sample by sample.

use crate::io::text::read_kernel;
use anyhow::Result;
use std::path::Path;

/// Ring buffer of injected currents convolved with an electrode kernel in Ohm.
///
/// Currents are pushed in pA and voltages compensated in mV. Voltages pass
/// through a two-deep buffer: `compensate` returns the voltage given
/// [`Aec::DELAY`] calls earlier, minus the drop of the current history as it
/// stands now.
#[derive(Debug, Clone)]
pub struct Aec {
    kernel: Vec<f64>,
    current: Vec<f64>,
    pos: usize,
    buffer: [f64; 2],
    with_kernel: bool,
}

impl Default for Aec {
    fn default() -> Self {
        Self {
            kernel: vec![0.0],
            current: vec![0.0],
            pos: 0,
            buffer: [0.0; 2],
            with_kernel: false,
        }
    }
}

impl Aec {
    /// Samples between a voltage entering `compensate` and coming out of it.
    pub const DELAY: usize = 2;

    /// A compensator that passes voltages through unchanged.
    pub fn without_kernel() -> Self {
        Self::default()
    }

    pub fn new(kernel: Vec<f64>) -> Self {
        if kernel.is_empty() {
            return Self::default();
        }
        let len = kernel.len();
        Self {
            kernel,
            current: vec![0.0; len],
            pos: 0,
            buffer: [0.0; 2],
            with_kernel: true,
        }
    }

    /// Load a kernel saved one value per line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let kernel = read_kernel(path)?;
        log::debug!("the kernel has {} samples", kernel.len());
        Ok(Self::new(kernel))
    }

    pub fn kernel(&self) -> &[f64] {
        &self.kernel
    }

    pub fn has_kernel(&self) -> bool {
        self.with_kernel
    }

    /// Fill the current history with a constant value (pA).
    pub fn initialise(&mut self, current: f64, voltage: f64) {
        self.current.iter_mut().for_each(|c| *c = current * 1e-12);
        self.pos = 0;
        self.buffer = [voltage; 2];
        if current != 0.0 {
            log::info!("initialised kernel with {} pA", current);
        }
    }

    /// Fill the current history from a sequence of past values (pA).
    pub fn initialise_with_history(&mut self, currents: &[f64], voltage: f64) {
        self.initialise(currents.first().copied().unwrap_or(0.0), voltage);
        for (slot, value) in self.current.iter_mut().zip(currents) {
            *slot = value * 1e-12;
        }
    }

    pub fn push_back(&mut self, current: f64) {
        self.current[self.pos] = current * 1e-12;
        self.pos = (self.pos + 1) % self.current.len();
    }

    pub fn compensate(&mut self, voltage: f64) -> f64 {
        if !self.with_kernel {
            return voltage;
        }
        let to_compensate = self.buffer[0];
        self.buffer = [self.buffer[1], voltage];
        to_compensate - 1e3 * self.convolve()
    }

    /// Most recent current times the first kernel sample, and so on backwards.
    fn convolve(&self) -> f64 {
        let len = self.current.len();
        (0..len)
            .map(|j| {
                let i = (self.pos + len - 1 - j) % len;
                self.current[i] * self.kernel[j]
            })
            .sum()
    }
}
