pub mod aec;
pub mod fit;
pub mod kernel;
pub mod resistance;
pub mod spikes;
pub mod synaptic;

pub use fit::{fit_biexponential, BiExponential};
pub use kernel::{compensate, electrode_kernel, full_kernel};
pub use resistance::{estimate_resistance, ResistanceEstimate};
pub use spikes::find_spikes;
