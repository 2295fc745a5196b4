pub mod analysis;
pub mod env;
pub mod error;
pub mod io;
pub mod plot;
pub mod signal;
pub mod stimulus;

pub use error::{AnalysisError, ConfigError, StimulusError, TraceError};
pub use signal::*;
