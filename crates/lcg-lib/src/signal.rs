use crate::io::trace::TraceEntity;
use serde::{Deserialize, Serialize};

/// Basic typed time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Uniform sampling frequency in Hz
    pub fs: f64,
    /// Samples
    pub data: Vec<f64>,
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(fs: f64, data: Vec<f64>) -> Self {
        Self {
            fs,
            data,
            units: None,
        }
    }

    /// Series of a recorded entity sampled every `dt` seconds.
    pub fn from_entity(entity: &TraceEntity, dt: f64) -> Self {
        Self {
            fs: 1.0 / dt,
            data: entity.data.clone(),
            units: entity.units.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.fs
    }
    pub fn dt(&self) -> f64 {
        1.0 / self.fs
    }

    /// Samples whose time (s) falls in `[start, end]`.
    pub fn slice_time(&self, start: f64, end: f64) -> &[f64] {
        let first = ((start * self.fs).ceil().max(0.0) as usize).min(self.data.len());
        let last = ((end * self.fs).floor() as usize + 1).min(self.data.len());
        &self.data[first..last.max(first)]
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + i as f64 * step).collect()
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample-wise mean of equally long traces.
pub fn average_traces(traces: &[Vec<f64>]) -> Vec<f64> {
    let Some(first) = traces.first() else {
        return Vec::new();
    };
    let mut out = vec![0.0; first.len()];
    for trace in traces {
        for (acc, value) in out.iter_mut().zip(trace) {
            *acc += value;
        }
    }
    let n = traces.len() as f64;
    out.iter_mut().for_each(|v| *v /= n);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_endpoints() {
        let t = linspace(0.0, 1.0, 5);
        assert_eq!(t, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn averages_traces() {
        let avg = average_traces(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(avg, vec![2.0, 3.0]);
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn slices_by_time() {
        let ts = TimeSeries::new(10.0, (0..20).map(f64::from).collect());
        assert_eq!(ts.slice_time(0.5, 0.7), &[5.0, 6.0, 7.0]);
        assert!(ts.slice_time(5.0, 6.0).is_empty());
    }
}
