//! Rig defaults shared by the command line tools.
//!
//! Every value comes from an environment variable (`SAMPLING_RATE`, `AI_CHANNEL`,
//! ...) set up once per rig, or from a TOML file with the same keys in snake case.

use crate::error::ConfigError;
use crate::io::config::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClampMode {
    Current,
    Voltage,
}

impl ClampMode {
    fn suffix(self) -> &'static str {
        match self {
            ClampMode::Current => "CC",
            ClampMode::Voltage => "VC",
        }
    }
}

/// Conversion factor and units of one direction in one clamp mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gain {
    pub factor: f64,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabDefaults {
    pub sampling_rate: f64,
    pub ai_channel: u32,
    pub ao_channel: u32,
    pub input_cc: Gain,
    pub input_vc: Gain,
    pub output_cc: Gain,
    pub output_vc: Gain,
    pub comedi_device: String,
    pub ai_subdevice: u32,
    pub ao_subdevice: u32,
    #[serde(default = "default_reference")]
    pub ground_reference: String,
    #[serde(default = "default_realtime")]
    pub realtime: bool,
}

fn default_reference() -> String {
    "GRSE".into()
}

fn default_realtime() -> bool {
    true
}

fn required<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<T, ConfigError> {
    let value = lookup(name).ok_or_else(|| ConfigError::MissingVariable(name.to_string()))?;
    value.trim().parse().map_err(|_| ConfigError::InvalidVariable {
        name: name.to_string(),
        value,
    })
}

fn parse_flag(name: &str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidVariable {
            name: name.to_string(),
            value,
        }),
    }
}

impl LabDefaults {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the defaults from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let gain = |direction: &str, mode: ClampMode| -> Result<Gain, ConfigError> {
            Ok(Gain {
                factor: required(
                    &lookup,
                    &format!("{}_CONVERSION_FACTOR_{}", direction, mode.suffix()),
                )?,
                units: required(&lookup, &format!("{}_UNITS_{}", direction, mode.suffix()))?,
            })
        };
        let realtime = match lookup("LCG_REALTIME") {
            Some(value) => parse_flag("LCG_REALTIME", value)?,
            None => default_realtime(),
        };
        Ok(Self {
            sampling_rate: required(&lookup, "SAMPLING_RATE")?,
            ai_channel: required(&lookup, "AI_CHANNEL")?,
            ao_channel: required(&lookup, "AO_CHANNEL")?,
            input_cc: gain("AI", ClampMode::Current)?,
            input_vc: gain("AI", ClampMode::Voltage)?,
            output_cc: gain("AO", ClampMode::Current)?,
            output_vc: gain("AO", ClampMode::Voltage)?,
            comedi_device: required(&lookup, "COMEDI_DEVICE")?,
            ai_subdevice: required(&lookup, "AI_SUBDEVICE")?,
            ao_subdevice: required(&lookup, "AO_SUBDEVICE")?,
            ground_reference: lookup("GROUND_REFERENCE").unwrap_or_else(default_reference),
            realtime,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// The TOML file when one is given, the environment otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => Self::from_env(),
        }
    }

    pub fn input_gain(&self, mode: ClampMode) -> &Gain {
        match mode {
            ClampMode::Current => &self.input_cc,
            ClampMode::Voltage => &self.input_vc,
        }
    }

    pub fn output_gain(&self, mode: ClampMode) -> &Gain {
        match mode {
            ClampMode::Current => &self.output_cc,
            ClampMode::Voltage => &self.output_vc,
        }
    }

    pub fn device(&self) -> Device {
        Device {
            file: self.comedi_device.clone(),
            input_subdevice: self.ai_subdevice,
            output_subdevice: self.ao_subdevice,
            reference: self.ground_reference.clone(),
        }
    }
}
