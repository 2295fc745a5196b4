//! Synaptic background activity modelled as excitatory and inhibitory OU conductances.

use serde::{Deserialize, Serialize};

/// Biophysical background parameters. Potentials in mV, resistances in MOhm,
/// rates in Hz and time constants in ms. A membrane resistance of zero selects
/// realistic unitary conductances (50 pS for AMPA, 190 pS for GABA).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynapticBackground {
    pub vm: f64,
    pub rm: f64,
    pub rate_exc: f64,
    pub tau_exc: f64,
    pub tau_inh: f64,
    pub e_exc: f64,
    pub e_inh: f64,
}

impl Default for SynapticBackground {
    fn default() -> Self {
        Self {
            vm: -57.6,
            rm: 0.0,
            rate_exc: 7000.0,
            tau_exc: 5.0,
            tau_inh: 10.0,
            e_exc: 0.0,
            e_inh: -80.0,
        }
    }
}

/// Means and standard deviations of the two conductances, in nS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundCoefficients {
    pub excitatory_mean: f64,
    pub inhibitory_mean: f64,
    pub excitatory_std: f64,
    pub inhibitory_std: f64,
}

/// Unitary excitatory and inhibitory conductances (S).
fn unitary_conductances(rm: f64) -> (f64, f64) {
    if rm == 0.0 {
        (50e-12, 190e-12)
    } else {
        let rm = rm * 1e6;
        (0.02 / rm, 0.06 / rm)
    }
}

impl SynapticBackground {
    /// Ratio between inhibitory and excitatory rates that balances the two
    /// currents at `vm`.
    pub fn rates_ratio(&self) -> f64 {
        let (g_exc, g_inh) = unitary_conductances(self.rm);
        let vm = self.vm * 1e-3;
        let e_exc = self.e_exc * 1e-3;
        let e_inh = self.e_inh * 1e-3;
        let tau_exc = self.tau_exc * 1e-3;
        let tau_inh = self.tau_inh * 1e-3;
        (g_inh * tau_inh * (e_inh - vm)) / (g_exc * tau_exc * (vm - e_exc))
    }

    pub fn coefficients(&self) -> BackgroundCoefficients {
        background_coefficients(
            self.rates_ratio(),
            self.rm,
            self.rate_exc,
            self.tau_exc,
            self.tau_inh,
        )
    }
}

/// Conductance statistics for an excitatory rate `rate_exc` and an
/// excitation/inhibition rate ratio `ratio`.
pub fn background_coefficients(
    ratio: f64,
    rm: f64,
    rate_exc: f64,
    tau_exc: f64,
    tau_inh: f64,
) -> BackgroundCoefficients {
    let (g_exc, g_inh) = unitary_conductances(rm);
    let tau_exc = tau_exc * 1e-3;
    let tau_inh = tau_inh * 1e-3;
    let rate_inh = rate_exc / ratio;
    let d_exc = 0.5 * g_exc.powi(2) * tau_exc.powi(2) * rate_exc;
    let d_inh = 0.5 * g_inh.powi(2) * tau_inh.powi(2) * rate_inh;
    BackgroundCoefficients {
        excitatory_mean: g_exc * tau_exc * rate_exc * 1e9,
        inhibitory_mean: g_inh * tau_inh * rate_inh * 1e9,
        excitatory_std: (d_exc / tau_exc).sqrt() * 1e9,
        inhibitory_std: (d_inh / tau_inh).sqrt() * 1e9,
    }
}
