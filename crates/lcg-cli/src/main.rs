mod render;

use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use lcg_lib::{
    analysis::{
        aec::Aec,
        kernel::{compensate, electrode_kernel, full_kernel, pulse_window, KernelSplit},
        spikes::{find_spikes, firing_summary},
        synaptic::SynapticBackground,
    },
    env::{ClampMode, LabDefaults},
    io::{
        config::{write_noisy_background_config, Channel, Device, IoConfiguration},
        template::{find_configuration_file, make_output_filename, substitute_strings},
        text as text_io,
        trace::{load_trace, Recording, TraceEntity},
    },
    plot::{
        figure_from_compensation, figure_from_kernel, figures_from_recording, Figure, LineSeries,
        PlotBackend, Series, PALETTE,
    },
    stimulus::{protocols::PulseTrain, write_stimulus, Segment},
    ConfigError,
};
use lcg_run::{
    plan::{input_channels, output_channels},
    progress_line, run_trials, stimuli_in_dir, ChannelSelection, ExternalEngine, RunError,
    RunPlan, SessionFiles,
};
use render::PngBackend;
use serde_json::json;
use std::{
    fs,
    io::{self, BufRead, IsTerminal, Read, Write},
    path::{Path, PathBuf},
};

#[derive(Parser)]
#[command(
    name = "lcg",
    version,
    about = "LCG: stimulus, configuration and trace tools for dynamic clamp experiments"
)]
struct Cli {
    /// TOML file with the rig defaults, read instead of the environment
    #[arg(long, global = true)]
    defaults: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a stimulus file from `kind:duration[:p1,p2,...]` segments
    Stimgen {
        /// Output file; the stimulus is printed when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Prepend the hyperpolarising preamble
        #[arg(long)]
        preamble: bool,
        #[arg(required = true, allow_hyphen_values = true)]
        segments: Vec<String>,
    },
    /// Apply stimulus files to the output channels while recording the inputs
    Stimulus(StimulusArgs),
    /// Inject brief hyperpolarising pulses to measure the membrane time constant
    Tau(TauArgs),
    /// Write a train of square pulses
    Pulses {
        #[arg(short, long)]
        frequency: f64,
        /// Pulse duration (ms)
        #[arg(short, long, default_value_t = 1.0)]
        duration: f64,
        #[arg(short, long, allow_negative_numbers = true)]
        amplitude: f64,
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        /// Silence before and after the train (s)
        #[arg(long, default_value_t = 1.0)]
        delay: f64,
        #[arg(long)]
        no_recovery: bool,
        #[arg(short, long, default_value = "pulses.stim")]
        output: PathBuf,
    },
    /// Write an acquisition configuration file
    WriteConfig(WriteConfigArgs),
    /// Copy a template replacing placeholders, rules applied in the given order
    Substitute {
        template: PathBuf,
        output: PathBuf,
        /// `PLACEHOLDER=value` pairs
        #[arg(value_parser = parse_rule)]
        rules: Vec<(String, String)>,
    },
    /// Write the excitatory/inhibitory background conductance file
    NoisyBg {
        #[arg(short, long, default_value = "ou.xml")]
        output: PathBuf,
        /// Membrane resistance (MOhm), 0 for realistic unitary conductances
        #[arg(long, default_value_t = 0.0)]
        rm: f64,
        #[arg(long, default_value_t = -57.6, allow_negative_numbers = true)]
        vm: f64,
        #[arg(long, default_value_t = 7000.0)]
        rate_exc: f64,
        #[arg(long, default_value_t = 5.0)]
        tau_exc: f64,
        #[arg(long, default_value_t = 10.0)]
        tau_inh: f64,
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        e_exc: f64,
        #[arg(long, default_value_t = -80.0, allow_negative_numbers = true)]
        e_inh: f64,
    },
    /// Print the run information and the entities of a recorded trace as JSON
    TraceInfo {
        input: PathBuf,
        /// Include the samples
        #[arg(long)]
        data: bool,
        /// Report upward crossings of this value for every trace in mV
        #[arg(long, allow_negative_numbers = true)]
        spike_threshold: Option<f64>,
    },
    /// Render a recorded trace to PNG, one figure per unit
    TracePlot {
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 2000)]
        max_points: usize,
        /// Electrode kernel (Ohm) used to add a compensated voltage trace
        #[arg(long)]
        kernel: Option<PathBuf>,
    },
    /// Estimate the electrode kernel from a recording with a white noise current
    Kernel(KernelArgs),
    /// Print a time stamped file name that does not exist yet
    OutputName {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(default_value = "h5")]
        extension: String,
    },
}

#[derive(Args)]
struct ChannelArgs {
    /// Input channels: `none`, a single value, `0,1,2` or `0-3`
    #[arg(short = 'I', long = "input-channels", value_parser = parse_channels)]
    input_channels: Option<ChannelSelection>,
    #[arg(short = 'g', long = "input-gains", value_delimiter = ',')]
    input_gains: Vec<f64>,
    #[arg(short = 'u', long = "input-units", value_delimiter = ',')]
    input_units: Vec<String>,
    /// Output channels, same syntax as the inputs
    #[arg(short = 'O', long = "output-channels", value_parser = parse_channels)]
    output_channels: Option<ChannelSelection>,
    #[arg(short = 'G', long = "output-gains", value_delimiter = ',')]
    output_gains: Vec<f64>,
    #[arg(short = 'U', long = "output-units", value_delimiter = ',')]
    output_units: Vec<String>,
    /// Offsets summed to the stimulation (pA or mV), one per output channel
    #[arg(
        short = 'o',
        long = "offset",
        value_delimiter = ',',
        allow_negative_numbers = true
    )]
    offsets: Vec<f64>,
    /// Use the voltage clamp conversion factors and units
    #[arg(short = 'V', long)]
    vclamp: bool,
    #[arg(short = 'F', long)]
    sampling_rate: Option<f64>,
    #[arg(short = 'D', long)]
    device: Option<String>,
    #[arg(short = 'S', long)]
    subdevice: Option<u32>,
}

#[derive(Args)]
struct StimulusArgs {
    /// Stimulus files, comma separated
    #[arg(short = 's', long = "stimulus", value_delimiter = ',')]
    stimulus: Vec<PathBuf>,
    /// Directory holding the stimulus files
    #[arg(short = 'd', long)]
    directory: Option<PathBuf>,
    /// Duration of the recording (s) when no stimulus is played
    #[arg(short = 'l', long)]
    duration: Option<f64>,
    #[arg(short = 'n', long, default_value_t = 1)]
    repetitions: usize,
    /// Interval between repetitions (s)
    #[arg(short = 'i', long, default_value_t = 0.0)]
    interval: f64,
    #[arg(short = 'c', long, default_value = "stimulus.xml")]
    config: PathBuf,
    #[command(flatten)]
    channels: ChannelArgs,
}

#[derive(Args)]
struct TauArgs {
    /// Pulse amplitude (pA)
    #[arg(short, long, default_value_t = -300.0, allow_negative_numbers = true)]
    amplitude: f64,
    /// Pulse duration (ms)
    #[arg(short, long, default_value_t = 10.0)]
    duration: f64,
    #[arg(short = 'n', long, default_value_t = 30)]
    repetitions: usize,
    /// Interval between repetitions (s)
    #[arg(short, long, default_value_t = 0.5)]
    interval: f64,
    #[arg(short = 'F', long)]
    sampling_rate: Option<f64>,
    #[arg(short = 'I', long)]
    input_channel: Option<u32>,
    #[arg(short = 'O', long)]
    output_channel: Option<u32>,
    /// Use the real-time engine (yes or no)
    #[arg(long = "rt", value_parser = BoolishValueParser::new())]
    realtime: Option<bool>,
}

#[derive(Args)]
struct WriteConfigArgs {
    /// Stimulus files, one per output channel or one shared by all
    #[arg(short = 's', long = "stimulus", value_delimiter = ',')]
    stimulus: Vec<PathBuf>,
    /// Duration (s), used when there are no output channels
    #[arg(short = 'l', long)]
    duration: Option<f64>,
    #[arg(long = "rt", value_parser = BoolishValueParser::new())]
    realtime: Option<bool>,
    /// File the recording is saved to
    #[arg(long)]
    output_file: Option<PathBuf>,
    #[arg(short = 'c', long, default_value = "lcg.xml")]
    config: PathBuf,
    #[command(flatten)]
    channels: ChannelArgs,
}

#[derive(Args)]
struct KernelArgs {
    input: PathBuf,
    /// Kernel length (ms)
    #[arg(long, default_value_t = 5.0)]
    kernel_ms: f64,
    /// Index of the first sample of the membrane tail; asked on stdin when omitted
    #[arg(long)]
    tail_start: Option<usize>,
    /// Start and end (s) of the white noise, found from the stimulus when omitted
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    interval: Vec<f64>,
    /// Where to save the electrode kernel (Ohm), `<input>_kernel.dat` by default
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// PNG with the full, membrane and electrode kernels; the compensated pulse
    /// response goes next to it as `<stem>_compensation.png`
    #[arg(long)]
    plot: Option<PathBuf>,
}

fn parse_channels(s: &str) -> Result<ChannelSelection, String> {
    s.parse().map_err(|err: RunError| err.to_string())
}

fn parse_rule(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("`{}` is not PLACEHOLDER=value", s))?;
    Ok((key.to_string(), value.to_string()))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let defaults = cli.defaults.as_deref();
    let result = match cli.command {
        Commands::Stimgen {
            output,
            preamble,
            segments,
        } => cmd_stimgen(output.as_deref(), preamble, &segments),
        Commands::Stimulus(args) => cmd_stimulus(&args, defaults),
        Commands::Tau(args) => cmd_tau(&args, defaults),
        Commands::Pulses {
            frequency,
            duration,
            amplitude,
            count,
            delay,
            no_recovery,
            output,
        } => cmd_pulses(
            PulseTrain {
                frequency,
                pulse_ms: duration,
                amplitude,
                count,
                delay,
                with_recovery: !no_recovery,
            },
            &output,
        ),
        Commands::WriteConfig(args) => cmd_write_config(&args, defaults),
        Commands::Substitute {
            template,
            output,
            rules,
        } => cmd_substitute(&template, &output, &rules),
        Commands::NoisyBg {
            output,
            rm,
            vm,
            rate_exc,
            tau_exc,
            tau_inh,
            e_exc,
            e_inh,
        } => cmd_noisy_bg(
            &output,
            SynapticBackground {
                vm,
                rm,
                rate_exc,
                tau_exc,
                tau_inh,
                e_exc,
                e_inh,
            },
        ),
        Commands::TraceInfo {
            input,
            data,
            spike_threshold,
        } => cmd_trace_info(&input, data, spike_threshold),
        Commands::TracePlot {
            input,
            out,
            max_points,
            kernel,
        } => cmd_trace_plot(&input, &out, max_points, kernel.as_deref()),
        Commands::Kernel(args) => cmd_kernel(&args),
        Commands::OutputName { prefix, extension } => {
            println!("{}", make_output_filename(&prefix, &extension).display());
            Ok(())
        }
    };
    match result {
        Err(err) if err.downcast_ref::<RunError>().is_some_and(RunError::is_no_op) => {
            println!("{}", err);
            Ok(())
        }
        other => other,
    }
}

fn cmd_stimgen(output: Option<&Path>, preamble: bool, specs: &[String]) -> Result<()> {
    let rows = specs
        .iter()
        .map(|spec| Segment::from_spec(spec))
        .collect::<Result<Vec<_>, _>>()?;
    match output {
        Some(path) => {
            let summary = write_stimulus(path, &rows, preamble)?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        None => {
            let session = SessionFiles::new("lcg_stimgen")?;
            let path = session.path("stdout.stim");
            write_stimulus(&path, &rows, preamble)?;
            print!("{}", fs::read_to_string(&path)?);
        }
    }
    Ok(())
}

impl ChannelArgs {
    fn mode(&self) -> ClampMode {
        if self.vclamp {
            ClampMode::Voltage
        } else {
            ClampMode::Current
        }
    }

    fn selected(selection: &Option<ChannelSelection>, default: u32) -> Vec<u32> {
        match selection {
            None => vec![default],
            Some(selection) => selection.channels().to_vec(),
        }
    }

    /// Input and output descriptors, defaults filled in from the rig.
    fn resolve(&self, defaults: &LabDefaults) -> Result<(Vec<Channel>, Vec<Channel>)> {
        let inputs = Self::selected(&self.input_channels, defaults.ai_channel);
        let outputs = Self::selected(&self.output_channels, defaults.ao_channel);
        if inputs.is_empty() && outputs.is_empty() {
            return Err(RunError::NoChannels.into());
        }
        if outputs.is_empty() && !self.offsets.is_empty() {
            return Err(RunError::OffsetWithoutOutputs.into());
        }
        let mode = self.mode();
        let inputs = input_channels(
            &inputs,
            &self.input_gains,
            &self.input_units,
            defaults.input_gain(mode),
        )?;
        let outputs = output_channels(
            &outputs,
            &self.output_gains,
            &self.output_units,
            &self.offsets,
            defaults.output_gain(mode),
        )?;
        Ok((inputs, outputs))
    }

    fn device(&self, defaults: &LabDefaults) -> Result<Device> {
        let mut device = defaults.device();
        if let Some(file) = &self.device {
            if !Path::new(file).exists() {
                bail!("device '{}' does not exist", file);
            }
            device.file = file.clone();
        }
        if let Some(subdevice) = self.subdevice {
            device.input_subdevice = subdevice;
        }
        Ok(device)
    }

    fn sampling_rate(&self, defaults: &LabDefaults) -> f64 {
        self.sampling_rate.unwrap_or(defaults.sampling_rate)
    }
}

fn load_defaults(path: Option<&Path>) -> Result<LabDefaults> {
    LabDefaults::load(path).context("reading the rig defaults")
}

/// Stimulus files for the runner: listed, found in a directory, generated from
/// an offset and a duration, or piped in.
fn collect_stimuli(args: &StimulusArgs, session: &SessionFiles) -> Result<Vec<PathBuf>> {
    if !args.stimulus.is_empty() && args.directory.is_some() {
        bail!("use either --stimulus or --directory, not both");
    }
    if let Some(dir) = &args.directory {
        return Ok(stimuli_in_dir(dir)?);
    }
    if !args.stimulus.is_empty() {
        return Ok(args.stimulus.clone());
    }
    if let Some(duration) = args.duration.filter(|_| !args.channels.offsets.is_empty()) {
        let path = session.path("offset.stim");
        write_stimulus(&path, &[Segment::dc(duration, 0.0)], false)?;
        return Ok(vec![path]);
    }
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Err(RunError::NoStimulus.into());
    }
    let mut piped = String::new();
    stdin.lock().read_to_string(&mut piped)?;
    if piped.trim().is_empty() {
        return Err(RunError::NoStimulus.into());
    }
    let path = session.path("stdin.stim");
    fs::write(&path, piped).with_context(|| format!("writing {}", path.display()))?;
    Ok(vec![path])
}

fn run_plan(plan: &RunPlan, config: &Path) -> Result<()> {
    let trials = plan.trials()?;
    let engine = ExternalEngine::from_env();
    let summary = run_trials(&engine, config, &trials, plan.interval, |k, total| {
        eprint!("\r{}", progress_line(k, total, 50));
        let _ = io::stderr().flush();
    })?;
    eprintln!();
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn cmd_stimulus(args: &StimulusArgs, defaults: Option<&Path>) -> Result<()> {
    RunPlan::check_schedule(args.repetitions, args.interval)?;
    let defaults = load_defaults(defaults)?;
    let (inputs, outputs) = args.channels.resolve(&defaults)?;
    let session = SessionFiles::new("lcg_stimulus")?;
    let stimuli = if outputs.is_empty() {
        Vec::new()
    } else {
        collect_stimuli(args, &session)?
    };
    let mut plan = RunPlan::new(args.channels.sampling_rate(&defaults), inputs, outputs)
        .with_stimuli(stimuli);
    plan.duration = args.duration;
    plan.device = args.channels.device(&defaults)?;
    plan.realtime = defaults.realtime;
    plan.repetitions = args.repetitions;
    plan.interval = args.interval;
    run_plan(&plan, &args.config)
}

fn cmd_tau(args: &TauArgs, defaults: Option<&Path>) -> Result<()> {
    let defaults = load_defaults(defaults)?;
    let session = SessionFiles::new("lcg_tau")?;
    let stimulus = session.path("tau.stim");
    PulseTrain {
        frequency: 1.0,
        pulse_ms: args.duration,
        amplitude: args.amplitude,
        count: 1,
        delay: 0.25,
        with_recovery: false,
    }
    .write(&stimulus)?;
    let mode = ClampMode::Current;
    let inputs = input_channels(
        &[args.input_channel.unwrap_or(defaults.ai_channel)],
        &[],
        &[],
        defaults.input_gain(mode),
    )?;
    let outputs = output_channels(
        &[args.output_channel.unwrap_or(defaults.ao_channel)],
        &[],
        &[],
        &[],
        defaults.output_gain(mode),
    )?;
    let mut plan = RunPlan::new(
        args.sampling_rate.unwrap_or(defaults.sampling_rate),
        inputs,
        outputs,
    )
    .with_stimuli(vec![stimulus]);
    plan.device = defaults.device();
    plan.realtime = args.realtime.unwrap_or(defaults.realtime);
    plan.repetitions = args.repetitions;
    plan.interval = args.interval;
    run_plan(&plan, &session.path("tau.xml"))
}

fn cmd_pulses(train: PulseTrain, output: &Path) -> Result<()> {
    let duration = train.write(output)?;
    println!(
        "{}",
        json!({ "file": output.display().to_string(), "duration": duration })
    );
    Ok(())
}

fn cmd_write_config(args: &WriteConfigArgs, defaults: Option<&Path>) -> Result<()> {
    let defaults = load_defaults(defaults)?;
    let (inputs, outputs) = args.channels.resolve(&defaults)?;
    let stimuli = match args.stimulus.len() {
        _ if outputs.is_empty() => Vec::new(),
        0 => return Err(RunError::NoStimulus.into()),
        1 => vec![args.stimulus[0].clone(); outputs.len()],
        n if n == outputs.len() => args.stimulus.clone(),
        n => {
            return Err(RunError::StimulusCount {
                channels: outputs.len(),
                files: n,
            }
            .into())
        }
    };
    let mut channels = inputs;
    channels.extend(outputs.into_iter().zip(stimuli).map(|(channel, stimulus)| Channel {
        stimulus: Some(stimulus),
        ..channel
    }));
    let mut config = IoConfiguration::new(args.channels.sampling_rate(&defaults), channels);
    config.duration = args.duration;
    config.realtime = args.realtime.unwrap_or(defaults.realtime);
    config.output_filename = args.output_file.clone();
    config.device = args.channels.device(&defaults)?;
    let duration = config.write(&args.config)?;
    println!(
        "{}",
        json!({
            "config": args.config.display().to_string(),
            "duration": duration,
            "inputs": config.inputs().count(),
            "outputs": config.outputs().count(),
        })
    );
    Ok(())
}

fn cmd_substitute(template: &Path, output: &Path, rules: &[(String, String)]) -> Result<()> {
    let template = if template.exists() {
        template.to_path_buf()
    } else {
        let name = template
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        find_configuration_file(name)
            .ok_or_else(|| ConfigError::TemplateNotFound(name.to_string()))?
    };
    substitute_strings(&template, output, rules)?;
    Ok(())
}

fn cmd_noisy_bg(output: &Path, background: SynapticBackground) -> Result<()> {
    write_noisy_background_config(output, &background)?;
    println!(
        "{}",
        json!({
            "ratio": background.rates_ratio(),
            "coefficients": background.coefficients(),
        })
    );
    Ok(())
}

fn load_recording(path: &Path) -> Result<Recording> {
    load_trace(path).with_context(|| format!("loading {}", path.display()))
}

fn cmd_trace_info(input: &Path, data: bool, spike_threshold: Option<f64>) -> Result<()> {
    let recording = load_recording(input)?;
    if data {
        println!("{}", serde_json::to_string(&recording)?);
        return Ok(());
    }
    let time = recording.time_axis(
        recording
            .entities
            .iter()
            .map(|e| e.data.len())
            .max()
            .unwrap_or(0),
    );
    let entities: Vec<_> = recording
        .entities
        .iter()
        .map(|entity| {
            let firing = spike_threshold
                .filter(|_| entity.units.as_deref() == Some("mV"))
                .map(|threshold| {
                    let spikes = find_spikes(&time, &entity.data, threshold);
                    firing_summary(&spikes, recording.info.tend)
                });
            json!({
                "id": entity.id,
                "name": entity.name,
                "units": entity.units,
                "samples": entity.data.len(),
                "metadata": entity.metadata.as_ref().map(|m| [m.nrows(), m.ncols()]),
                "parameters": entity.parameters,
                "attributes": entity.attributes,
                "firing": firing,
            })
        })
        .collect();
    println!(
        "{}",
        json!({ "info": recording.info, "entities": entities })
    );
    Ok(())
}

/// Replay the online compensation over a recorded current and voltage.
fn compensated_voltage(aec: &mut Aec, current: &[f64], voltage: &[f64]) -> Vec<f64> {
    let (Some(&i0), Some(&v0)) = (current.first(), voltage.first()) else {
        return Vec::new();
    };
    aec.initialise(i0, v0);
    current
        .iter()
        .zip(voltage)
        .map(|(&i, &v)| {
            aec.push_back(i);
            aec.compensate(v)
        })
        .collect()
}

/// Compensated samples placed at the time their voltage was recorded.
fn aligned_points(compensated: &[f64], dt: f64) -> Vec<[f64; 2]> {
    compensated
        .iter()
        .skip(Aec::DELAY)
        .enumerate()
        .map(|(k, v)| [k as f64 * dt, *v])
        .collect()
}

fn cmd_trace_plot(input: &Path, out: &Path, max_points: usize, kernel: Option<&Path>) -> Result<()> {
    let recording = load_recording(input)?;
    let mut figures = figures_from_recording(&recording, max_points);
    if let Some(kernel) = kernel {
        let mut aec = Aec::from_file(kernel)?;
        let current = recording
            .first_named("Waveform")
            .or_else(|| recording.first_with_units("pA"))
            .context("the recording has no current to compensate with")?;
        let voltage = recording
            .first_with_units("mV")
            .context("the recording has no voltage trace")?;
        let compensated = compensated_voltage(&mut aec, &current.data, &voltage.data);
        let points = aligned_points(&compensated, recording.info.dt);
        if let Some(figure) = figures
            .iter_mut()
            .find(|f| f.y.label.as_deref() == Some("mV"))
        {
            let color = PALETTE[figure.series.len() % PALETTE.len()];
            figure.add_series(Series::Line(LineSeries::new(
                "compensated",
                lcg_lib::plot::decimate_points(&points, max_points),
                color,
            )));
        }
    }
    let mut written = Vec::new();
    for (k, figure) in figures.iter().enumerate() {
        let path = if figures.len() == 1 {
            out.to_path_buf()
        } else {
            let stem = out
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("trace");
            out.with_file_name(format!("{}_{}.png", stem, k + 1))
        };
        PngBackend::new(&path).draw(figure)?;
        log::info!("wrote {}", path.display());
        written.push(path.display().to_string());
    }
    println!("{}", serde_json::to_string(&written)?);
    Ok(())
}

/// Start and end (s) of the first segment longer than five seconds: the white
/// noise used for the kernel.
fn noise_interval(recording: &Recording) -> Result<(f64, f64)> {
    let waveform = recording
        .first_named("Waveform")
        .context("the recording has no Waveform entity")?;
    let metadata = waveform
        .metadata
        .as_ref()
        .context("the Waveform entity has no metadata")?;
    let ends: Vec<f64> = metadata
        .column(0)
        .iter()
        .scan(0.0, |t, d| {
            *t += d;
            Some(*t)
        })
        .collect();
    let index = metadata
        .column(0)
        .iter()
        .position(|&d| d > 5.0)
        .context("no stimulus segment is longer than 5 s")?;
    let start = if index == 0 { 0.0 } else { ends[index - 1] };
    Ok((start, ends[index]))
}

/// Ask for the tail start until the user accepts the electrode kernel.
fn ask_tail_start(
    kernel: &[f64],
    samples_per_ms: usize,
    input: &mut impl BufRead,
    prompt: &mut impl Write,
) -> Result<KernelSplit> {
    let mut line = String::new();
    loop {
        write!(
            prompt,
            "Enter index of tail start (1 ms = {} samples): ",
            samples_per_ms
        )?;
        prompt.flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            bail!("no tail start given");
        }
        let Ok(start) = line.trim().parse::<usize>() else {
            continue;
        };
        let split = match electrode_kernel(kernel, start) {
            Ok(split) => split,
            Err(err) => {
                writeln!(prompt, "{}", err)?;
                continue;
            }
        };
        writeln!(prompt, "R = {:.3} MOhm.", split.resistance())?;
        write!(
            prompt,
            "Ke[-1] / max(Ke) = {:.2} %. Ok? [Y/n] ",
            split.tail_ratio().unwrap_or(f64::NAN)
        )?;
        prompt.flush()?;
        line.clear();
        input.read_line(&mut line)?;
        let answer = line.trim().to_ascii_lowercase();
        if answer.is_empty() || answer == "y" || answer == "yes" {
            return Ok(split);
        }
    }
}

/// Recorded against offline-compensated voltage around the pulse that precedes
/// the noise.
fn compensation_figure(
    current: &TraceEntity,
    voltage: &TraceEntity,
    electrode: &[f64],
    dt: f64,
) -> Option<Figure> {
    let durations = current.metadata.as_ref()?.column(0).to_vec();
    let samples = voltage.data.len().min(current.data.len());
    let window = pulse_window(&durations, dt, samples)?;
    let recorded = &voltage.data[window.clone()];
    let compensated = compensate(recorded, &current.data[window], electrode);
    Some(figure_from_compensation(dt, recorded, &compensated))
}

fn cmd_kernel(args: &KernelArgs) -> Result<()> {
    let recording = load_recording(&args.input)?;
    let dt = recording.info.dt;
    let current = recording
        .first_named("Waveform")
        .context("the recording has no Waveform entity")?;
    let voltage = recording
        .first_with_units("mV")
        .context("the recording has no voltage trace")?;
    let (start, end) = match args.interval.as_slice() {
        [start, end] => (*start, *end),
        [] => {
            let interval = noise_interval(&recording)?;
            log::info!("white noise between {} and {} s", interval.0, interval.1);
            interval
        }
        other => bail!("--interval takes a start and an end, got {} values", other.len()),
    };
    let time = recording.time_axis(voltage.data.len());
    let first = time.iter().position(|&t| t >= start).unwrap_or(0);
    let last = time.iter().rposition(|&t| t <= end).map_or(0, |k| k + 1);
    if last <= first || current.data.len() < last {
        bail!("no samples between {} and {} s", start, end);
    }
    let ksize = (args.kernel_ms * 1e-3 / dt).round() as usize;
    log::debug!("kernel of {} samples from {} samples", ksize, last - first);
    let full = full_kernel(
        &voltage.data[first..last],
        &current.data[first..last],
        ksize,
    )?;
    let split = match args.tail_start {
        Some(tail) => electrode_kernel(&full.kernel, tail)?,
        None => ask_tail_start(
            &full.kernel,
            (1e-3 / dt).round() as usize,
            &mut io::stdin().lock(),
            &mut io::stderr(),
        )?,
    };
    let output = args.output.clone().unwrap_or_else(|| {
        let stem = args
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("recording");
        args.input.with_file_name(format!("{}_kernel.dat", stem))
    });
    text_io::write_kernel(&output, &split.electrode_mohm())?;
    if let Some(plot) = &args.plot {
        PngBackend::new(plot).draw(&figure_from_kernel(&full.kernel, &split, dt))?;
        match compensation_figure(current, voltage, &split.electrode, dt) {
            Some(figure) => {
                let stem = plot.file_stem().and_then(|s| s.to_str()).unwrap_or("kernel");
                PngBackend::new(plot.with_file_name(format!("{}_compensation.png", stem)))
                    .draw(&figure)?;
            }
            None => log::warn!("no 10 ms pulse in the stimulus, compensation not plotted"),
        }
    }
    println!(
        "{}",
        json!({
            "resistance": split.resistance(),
            "v0": full.v0,
            "tau_ms": split.tau * dt * 1e3,
            "tail_ratio": split.tail_ratio(),
            "kernel": output.display().to_string(),
        })
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn two_part_kernel() -> Vec<f64> {
        let mut kernel: Vec<f64> = (0..100).map(|n| 0.1 * (-(n as f64) / 50.0).exp()).collect();
        for (n, value) in [0.5, 0.3, 0.1, 0.05, 0.01].iter().enumerate() {
            kernel[n] += value;
        }
        kernel
    }

    #[test]
    fn asks_until_the_kernel_is_accepted() {
        let mut input = Cursor::new("x\n20\nn\n20\n\n");
        let mut prompt = Vec::new();
        let split = ask_tail_start(&two_part_kernel(), 10, &mut input, &mut prompt).unwrap();
        assert_eq!(split.electrode.len(), 20);
        let prompt = String::from_utf8(prompt).unwrap();
        assert_eq!(prompt.matches("Enter index").count(), 3);
        assert!(prompt.contains("R = 960.000 MOhm."));
    }

    #[test]
    fn gives_up_at_end_of_input() {
        let mut input = Cursor::new("");
        let mut prompt = Vec::new();
        assert!(ask_tail_start(&two_part_kernel(), 10, &mut input, &mut prompt).is_err());
    }

    #[test]
    fn parses_rules_in_order() {
        assert_eq!(
            parse_rule("F=10").unwrap(),
            ("F".to_string(), "10".to_string())
        );
        assert_eq!(
            parse_rule("<tend>=a=b").unwrap(),
            ("<tend>".to_string(), "a=b".to_string())
        );
        assert!(parse_rule("nothing").is_err());
    }

    #[test]
    fn replays_the_compensation() {
        let mut aec = Aec::new(vec![1e6]);
        let compensated = compensated_voltage(&mut aec, &[0.0, 100.0, 0.0], &[-65.0, -60.0, -60.0]);
        assert_eq!(compensated.len(), 3);
        assert!((compensated[1] + 65.1).abs() < 1e-9);
        assert!((compensated[2] + 65.0).abs() < 1e-9);
        let points = aligned_points(&compensated, 0.5);
        assert_eq!(points, vec![[0.0, compensated[2]]]);
    }

    #[test]
    fn compensation_figure_flattens_the_pulse() {
        let dt = 1e-3;
        let current: Vec<f64> = (0..300)
            .map(|n| if (100..110).contains(&n) { -300.0 } else { 0.0 })
            .collect();
        let electrode = [1e-3, 5e-4];
        let voltage: Vec<f64> = (0..300)
            .map(|n| {
                let drop: f64 = electrode
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j <= n)
                    .map(|(j, k)| k * current[n - j])
                    .sum();
                -65.0 + drop
            })
            .collect();
        let mut waveform = TraceEntity::new(2, current);
        let rows = vec![0.1, 1.0, 0.01, 1.0, 0.19, 1.0];
        waveform.metadata = Some(ndarray::Array2::from_shape_vec((3, 2), rows).unwrap());
        let membrane = TraceEntity::new(1, voltage);
        let figure = compensation_figure(&waveform, &membrane, &electrode, dt).unwrap();
        assert_eq!(figure.series.len(), 2);
        let compensated = figure.series[1].points();
        assert!(compensated.iter().all(|p| (p[1] + 65.0).abs() < 1e-9));
        let recorded = figure.series[0].points();
        assert!(recorded.iter().any(|p| (p[1] + 65.0).abs() > 0.1));

        waveform.metadata = None;
        assert!(compensation_figure(&waveform, &membrane, &electrode, dt).is_none());
    }
}
