//! XML configuration files for the acquisition engine.

use crate::analysis::synaptic::SynapticBackground;
use crate::error::ConfigError;
use crate::stimulus::stimulus_file_duration;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// One physical channel of the acquisition card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub direction: Direction,
    pub channel: u32,
    pub factor: f64,
    pub units: String,
    pub stimulus: Option<PathBuf>,
    pub offset: f64,
}

impl Channel {
    pub fn input(channel: u32, factor: f64, units: impl Into<String>) -> Self {
        Self {
            direction: Direction::Input,
            channel,
            factor,
            units: units.into(),
            stimulus: None,
            offset: 0.0,
        }
    }

    pub fn output(
        channel: u32,
        factor: f64,
        units: impl Into<String>,
        stimulus: impl Into<PathBuf>,
    ) -> Self {
        Self {
            direction: Direction::Output,
            channel,
            factor,
            units: units.into(),
            stimulus: Some(stimulus.into()),
            offset: 0.0,
        }
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }
}

/// Acquisition card and its subdevices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub file: String,
    pub input_subdevice: u32,
    pub output_subdevice: u32,
    pub reference: String,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            file: "/dev/comedi0".into(),
            input_subdevice: 0,
            output_subdevice: 1,
            reference: "GRSE".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoConfiguration {
    pub sampling_rate: f64,
    /// Ignored when output channels reference stimulus files.
    pub duration: Option<f64>,
    pub channels: Vec<Channel>,
    pub realtime: bool,
    pub output_filename: Option<PathBuf>,
    pub device: Device,
}

impl IoConfiguration {
    pub fn new(sampling_rate: f64, channels: Vec<Channel>) -> Self {
        Self {
            sampling_rate,
            duration: None,
            channels,
            realtime: true,
            output_filename: None,
            device: Device::default(),
        }
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Channel> {
        self.channels
            .iter()
            .filter(|c| c.direction == Direction::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Channel> {
        self.channels
            .iter()
            .filter(|c| c.direction == Direction::Output)
    }

    /// Length of the recording: the longest referenced stimulus, or the explicit
    /// duration when there are no output channels.
    pub fn resolve_duration(&self) -> Result<f64, ConfigError> {
        let mut durations = Vec::new();
        for channel in self.outputs() {
            let stimulus = channel
                .stimulus
                .as_ref()
                .ok_or(ConfigError::MissingStimulus(channel.channel))?;
            durations.push(stimulus_file_duration(stimulus)?);
        }
        let Some(longest) = durations.iter().copied().reduce(f64::max) else {
            return self.duration.ok_or(ConfigError::UnknownDuration);
        };
        if durations.iter().any(|d| (d - longest).abs() > 1e-9) {
            log::warn!(
                "not all stimulus files have the same duration: using the longest ({} s)",
                longest
            );
        }
        if let Some(requested) = self.duration {
            if (requested - longest).abs() > 1e-9 {
                log::warn!(
                    "the duration of the recording is set by the stimuli: ignoring {} s",
                    requested
                );
            }
        }
        Ok(longest)
    }

    /// Render the configuration and return it with the duration it uses.
    pub fn to_xml(&self) -> Result<(String, f64), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        let duration = self.resolve_duration()?;
        let mut xml = XmlDocument::new();
        xml.declaration()?;
        xml.start("lcg")?;
        if self.realtime {
            self.write_entities(&mut xml)?;
        } else {
            self.write_streams(&mut xml)?;
        }
        xml.start("simulation")?;
        xml.text_element("rate", self.sampling_rate)?;
        xml.text_element("tend", duration)?;
        xml.end("simulation")?;
        xml.end("lcg")?;
        Ok((xml.finish(), duration))
    }

    /// Write the configuration to `path` and return the duration of the recording.
    pub fn write(&self, path: &Path) -> Result<f64, ConfigError> {
        let (xml, duration) = self.to_xml()?;
        std::fs::write(path, xml).map_err(|e| ConfigError::io(path, e))?;
        log::info!(
            "wrote {} ({} channels, {} s)",
            path.display(),
            self.channels.len(),
            duration
        );
        Ok(duration)
    }

    fn write_recorder(&self, xml: &mut XmlDocument, tag: &str) -> Result<(), ConfigError> {
        xml.start(tag)?;
        xml.text_element("name", "H5Recorder")?;
        xml.text_element("id", 0)?;
        xml.start("parameters")?;
        xml.text_element("compress", true)?;
        if let Some(filename) = &self.output_filename {
            xml.text_element("filename", filename.display())?;
        }
        xml.end("parameters")?;
        xml.end(tag)
    }

    fn write_entities(&self, xml: &mut XmlDocument) -> Result<(), ConfigError> {
        let device = &self.device;
        xml.start("entities")?;
        self.write_recorder(xml, "entity")?;
        let mut id = 1;
        for input in self.inputs() {
            xml.start("entity")?;
            xml.text_element("name", "AnalogInput")?;
            xml.text_element("id", id)?;
            xml.start("parameters")?;
            xml.text_element("deviceFile", &device.file)?;
            xml.text_element("inputSubdevice", device.input_subdevice)?;
            xml.text_element("readChannel", input.channel)?;
            xml.text_element("inputConversionFactor", input.factor)?;
            xml.text_element("range", "[-10,+10]")?;
            xml.text_element("reference", &device.reference)?;
            xml.text_element("units", &input.units)?;
            xml.end("parameters")?;
            xml.text_element("connections", 0)?;
            xml.end("entity")?;
            id += 1;
        }
        for output in self.outputs() {
            let stimulus = output
                .stimulus
                .as_ref()
                .ok_or(ConfigError::MissingStimulus(output.channel))?;
            xml.start("entity")?;
            xml.text_element("name", "Waveform")?;
            xml.text_element("id", id)?;
            xml.start("parameters")?;
            xml.text_element("filename", stimulus.display())?;
            xml.text_element("units", &output.units)?;
            xml.end("parameters")?;
            xml.text_element("connections", format!("0,{}", id + 1))?;
            xml.end("entity")?;

            xml.start("entity")?;
            xml.text_element("name", "AnalogOutput")?;
            xml.text_element("id", id + 1)?;
            xml.start("parameters")?;
            xml.text_element("deviceFile", &device.file)?;
            xml.text_element("outputSubdevice", device.output_subdevice)?;
            xml.text_element("writeChannel", output.channel)?;
            xml.text_element("outputConversionFactor", output.factor)?;
            xml.text_element("reference", &device.reference)?;
            xml.text_element("units", &output.units)?;
            xml.text_element("offset", output.offset)?;
            xml.end("parameters")?;
            xml.end("entity")?;
            id += 2;
        }
        xml.end("entities")
    }

    fn write_streams(&self, xml: &mut XmlDocument) -> Result<(), ConfigError> {
        let device = &self.device;
        xml.start("streams")?;
        self.write_recorder(xml, "stream")?;
        let mut id = 1;
        for input in self.inputs() {
            xml.start("stream")?;
            xml.text_element("name", "InputChannel")?;
            xml.text_element("id", id)?;
            xml.start("parameters")?;
            xml.text_element("device", &device.file)?;
            xml.text_element("subdevice", device.input_subdevice)?;
            xml.text_element("channel", input.channel)?;
            xml.text_element("conversionFactor", input.factor)?;
            xml.text_element("range", "PlusMinusTen")?;
            xml.text_element("reference", &device.reference)?;
            xml.text_element("units", &input.units)?;
            xml.text_element("samplingRate", self.sampling_rate)?;
            xml.end("parameters")?;
            xml.text_element("connections", 0)?;
            xml.end("stream")?;
            id += 1;
        }
        for output in self.outputs() {
            let stimulus = output
                .stimulus
                .as_ref()
                .ok_or(ConfigError::MissingStimulus(output.channel))?;
            xml.start("stream")?;
            xml.text_element("name", "OutputChannel")?;
            xml.text_element("id", id)?;
            xml.start("parameters")?;
            xml.text_element("device", &device.file)?;
            xml.text_element("subdevice", device.output_subdevice)?;
            xml.text_element("channel", output.channel)?;
            xml.text_element("conversionFactor", output.factor)?;
            xml.text_element("reference", &device.reference)?;
            xml.text_element("units", &output.units)?;
            xml.text_element("stimfile", stimulus.display())?;
            xml.text_element("offset", output.offset)?;
            xml.text_element("samplingRate", self.sampling_rate)?;
            xml.end("parameters")?;
            xml.text_element("connections", 0)?;
            xml.end("stream")?;
            id += 1;
        }
        xml.end("streams")
    }
}

/// Write the two-OU background conductance file read by the dynamic clamp
/// (`<dynamicclamp><entities><ou>...`). Conductances in nS, tau in s, E in mV.
pub fn write_noisy_background_config(
    path: &Path,
    background: &SynapticBackground,
) -> Result<(), ConfigError> {
    let coefficients = background.coefficients();
    let mut xml = XmlDocument::new();
    xml.start("dynamicclamp")?;
    xml.start("entities")?;
    let sources = [
        (
            coefficients.excitatory_mean,
            coefficients.excitatory_std,
            background.tau_exc,
            background.e_exc,
        ),
        (
            coefficients.inhibitory_mean,
            coefficients.inhibitory_std,
            background.tau_inh,
            background.e_inh,
        ),
    ];
    for (mean, std, tau, reversal) in sources {
        xml.start("ou")?;
        xml.text_element("G0", mean)?;
        xml.text_element("sigma", std)?;
        xml.text_element("tau", tau / 1e3)?;
        xml.text_element("E", reversal)?;
        xml.end("ou")?;
    }
    xml.end("entities")?;
    xml.end("dynamicclamp")?;
    std::fs::write(path, xml.finish()).map_err(|e| ConfigError::io(path, e))
}

struct XmlDocument {
    writer: Writer<Vec<u8>>,
}

impl XmlDocument {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn declaration(&mut self) -> Result<(), ConfigError> {
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(())
    }

    fn start(&mut self, tag: &str) -> Result<(), ConfigError> {
        self.writer.write_event(Event::Start(BytesStart::new(tag)))?;
        Ok(())
    }

    fn end(&mut self, tag: &str) -> Result<(), ConfigError> {
        self.writer.write_event(Event::End(BytesEnd::new(tag)))?;
        Ok(())
    }

    fn text_element(&mut self, tag: &str, value: impl Display) -> Result<(), ConfigError> {
        self.start(tag)?;
        let text = value.to_string();
        self.writer.write_event(Event::Text(BytesText::new(&text)))?;
        self.end(tag)
    }

    fn finish(self) -> String {
        let mut text = String::from_utf8_lossy(&self.writer.into_inner()).into_owned();
        text.push('\n');
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::{write_stimulus, Segment};
    use std::fs;
    use tempfile::tempdir;

    fn stimulus(dir: &Path, name: &str, duration: f64) -> PathBuf {
        let path = dir.join(name);
        write_stimulus(&path, &[Segment::dc(duration, 0.0)], false).unwrap();
        path
    }

    #[test]
    fn realtime_config_has_one_entry_per_channel() {
        let dir = tempdir().unwrap();
        let stim = stimulus(dir.path(), "a.stim", 2.0);
        let channels = vec![
            Channel::input(0, 100.0, "mV"),
            Channel::input(1, 0.001, "pA"),
            Channel::output(0, 0.0025, "pA", &stim),
        ];
        let config = IoConfiguration::new(20000.0, channels);
        let (xml, duration) = config.to_xml().unwrap();
        assert_eq!(duration, 2.0);
        assert_eq!(xml.matches("<name>AnalogInput</name>").count(), 2);
        assert_eq!(xml.matches("<name>AnalogOutput</name>").count(), 1);
        assert_eq!(xml.matches("<name>Waveform</name>").count(), 1);
        assert!(xml.contains("<name>H5Recorder</name>"));
        assert!(xml.contains("<readChannel>1</readChannel>"));
        assert!(xml.contains("<rate>20000</rate>"));
        assert!(xml.contains("<tend>2</tend>"));
    }

    #[test]
    fn streams_config_has_one_entry_per_channel() {
        let dir = tempdir().unwrap();
        let a = stimulus(dir.path(), "a.stim", 1.0);
        let b = stimulus(dir.path(), "b.stim", 1.0);
        let mut config = IoConfiguration::new(
            10000.0,
            vec![
                Channel::input(2, 100.0, "mV"),
                Channel::output(0, 0.0025, "pA", &a),
                Channel::output(1, 0.0025, "pA", &b).with_offset(-5.0),
            ],
        );
        config.realtime = false;
        let (xml, _) = config.to_xml().unwrap();
        assert_eq!(xml.matches("<name>InputChannel</name>").count(), 1);
        assert_eq!(xml.matches("<name>OutputChannel</name>").count(), 2);
        assert!(xml.contains("<offset>-5</offset>"));
        assert!(!xml.contains("<entities>"));
    }

    #[test]
    fn duration_is_the_longest_stimulus() {
        let dir = tempdir().unwrap();
        let short = stimulus(dir.path(), "short.stim", 1.0);
        let long = stimulus(dir.path(), "long.stim", 3.5);
        let mut config = IoConfiguration::new(
            20000.0,
            vec![
                Channel::output(0, 1.0, "pA", &short),
                Channel::output(1, 1.0, "pA", &long),
            ],
        );
        config.duration = Some(10.0);
        assert_eq!(config.resolve_duration().unwrap(), 3.5);
    }

    #[test]
    fn duration_from_short_stimulus_rows() {
        let dir = tempdir().unwrap();
        let one = dir.path().join("one.stim");
        let two = dir.path().join("two.stim");
        fs::write(&one, "1\t1\t0\n").unwrap();
        fs::write(&two, "1\t1\t0\n2\t1\t100\n").unwrap();
        let config = IoConfiguration::new(
            20000.0,
            vec![
                Channel::input(0, 100.0, "mV"),
                Channel::output(0, 1.0, "pA", &one),
                Channel::output(1, 1.0, "pA", &two),
            ],
        );
        assert_eq!(config.resolve_duration().unwrap(), 3.0);
        assert!(config.to_xml().unwrap().0.contains("<tend>3</tend>"));
    }

    #[test]
    fn duration_without_outputs() {
        let mut config = IoConfiguration::new(20000.0, vec![Channel::input(0, 1.0, "mV")]);
        assert!(matches!(
            config.resolve_duration(),
            Err(ConfigError::UnknownDuration)
        ));
        config.duration = Some(4.0);
        assert_eq!(config.resolve_duration().unwrap(), 4.0);
        let empty = IoConfiguration::new(20000.0, Vec::new());
        assert!(matches!(empty.to_xml(), Err(ConfigError::NoChannels)));
    }

    #[test]
    fn noisy_background_has_two_sources() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ou.xml");
        write_noisy_background_config(&path, &SynapticBackground::default()).unwrap();
        let xml = std::fs::read_to_string(&path).unwrap();
        assert_eq!(xml.matches("<ou>").count(), 2);
        assert!(xml.contains("<tau>0.005</tau>"));
        assert!(xml.contains("<E>-80</E>"));
    }
}
