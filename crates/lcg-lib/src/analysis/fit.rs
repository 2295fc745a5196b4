//! Bi-exponential fit of capacitive transients.

use crate::error::AnalysisError;
use nalgebra::{Matrix5, Vector5};
use serde::{Deserialize, Serialize};

/// `a1 exp(-t/tau1) + a2 exp(-t/tau2) + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiExponential {
    pub a1: f64,
    pub tau1: f64,
    pub a2: f64,
    pub tau2: f64,
    pub offset: f64,
}

impl Default for BiExponential {
    fn default() -> Self {
        Self {
            a1: 10.0,
            tau1: 0.4,
            a2: 0.0,
            tau2: 0.02,
            offset: 0.0,
        }
    }
}

impl BiExponential {
    fn from_vector(p: &Vector5<f64>) -> Self {
        Self {
            a1: p[0],
            tau1: p[1],
            a2: p[2],
            tau2: p[3],
            offset: p[4],
        }
    }

    fn to_vector(self) -> Vector5<f64> {
        Vector5::new(self.a1, self.tau1, self.a2, self.tau2, self.offset)
    }

    pub fn eval(&self, t: f64) -> f64 {
        self.a1 * (-t / self.tau1).exp() + self.a2 * (-t / self.tau2).exp() + self.offset
    }

    fn gradient(&self, t: f64) -> Vector5<f64> {
        let e1 = (-t / self.tau1).exp();
        let e2 = (-t / self.tau2).exp();
        Vector5::new(
            e1,
            self.a1 * e1 * t / (self.tau1 * self.tau1),
            e2,
            self.a2 * e2 * t / (self.tau2 * self.tau2),
            1.0,
        )
    }

    fn cost(&self, t: &[f64], y: &[f64]) -> f64 {
        t.iter()
            .zip(y)
            .map(|(&t, &y)| (self.eval(t) - y).powi(2))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub params: BiExponential,
    pub rms: f64,
    pub iterations: usize,
}

const MAX_ITERATIONS: usize = 200;

/// Levenberg-Marquardt least squares fit starting from `initial`.
pub fn fit_biexponential(
    t: &[f64],
    y: &[f64],
    initial: BiExponential,
) -> Result<FitReport, AnalysisError> {
    if t.is_empty() {
        return Err(AnalysisError::Empty);
    }
    if t.len() != y.len() {
        return Err(AnalysisError::LengthMismatch(t.len(), y.len()));
    }
    let mut params = initial;
    let mut cost = params.cost(t, y);
    let mut lambda = 1e-3;
    let mut iterations = 0;
    while iterations < MAX_ITERATIONS {
        iterations += 1;
        let mut jtj = Matrix5::<f64>::zeros();
        let mut jtr = Vector5::<f64>::zeros();
        for (&t, &y) in t.iter().zip(y) {
            let g = params.gradient(t);
            let r = params.eval(t) - y;
            jtj += g * g.transpose();
            jtr += g * r;
        }
        let mut improved = false;
        while lambda < 1e12 {
            let mut damped = jtj;
            for i in 0..5 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(step) = damped.lu().solve(&(-jtr)) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = BiExponential::from_vector(&(params.to_vector() + step));
            let candidate_cost = candidate.cost(t, y);
            if candidate_cost.is_finite() && candidate_cost < cost {
                let converged = (cost - candidate_cost) <= 1e-12 * cost.max(1e-300)
                    || step.norm() < 1e-12;
                params = candidate;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                improved = !converged;
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }
    if !cost.is_finite() {
        return Err(AnalysisError::Singular);
    }
    Ok(FitReport {
        params,
        rms: (cost / t.len() as f64).sqrt(),
        iterations,
    })
}
