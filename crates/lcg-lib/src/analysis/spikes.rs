use serde::{Deserialize, Serialize};

/// Times at which `v` crosses `threshold` from below.
pub fn find_spikes(t: &[f64], v: &[f64], threshold: f64) -> Vec<f64> {
    t.iter()
        .zip(v.windows(2))
        .filter(|(_, w)| w[0] < threshold && w[1] >= threshold)
        .map(|(t, _)| *t)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiringSummary {
    pub count: usize,
    /// Mean rate over the whole trace (Hz).
    pub rate: f64,
    /// Mean inter-spike interval (s), when at least two spikes were found.
    pub mean_isi: Option<f64>,
}

pub fn firing_summary(spikes: &[f64], duration: f64) -> FiringSummary {
    let mean_isi = (spikes.len() > 1).then(|| {
        let first = spikes[0];
        let last = spikes[spikes.len() - 1];
        (last - first) / (spikes.len() - 1) as f64
    });
    FiringSummary {
        count: spikes.len(),
        rate: if duration > 0.0 {
            spikes.len() as f64 / duration
        } else {
            0.0
        },
        mean_isi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_upward_crossings_only() {
        let t = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let v = [-60.0, 10.0, 20.0, -50.0, 0.0, -70.0];
        assert_eq!(find_spikes(&t, &v, 0.0), vec![0.0, 3.0]);
        assert!(find_spikes(&t, &v, 50.0).is_empty());
    }

    #[test]
    fn summary() {
        let s = firing_summary(&[0.1, 0.3, 0.5], 1.0);
        assert_eq!(s.count, 3);
        assert_eq!(s.rate, 3.0);
        assert!((s.mean_isi.unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(firing_summary(&[], 0.0).mean_isi, None);
    }
}
