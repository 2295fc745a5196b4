use std::{
    io::{self, Stdout},
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use lcg_lib::{analysis::fit::FitReport, env::LabDefaults};
use lcg_run::{seal::MAX_TRACES, AcquisitionEngine, ExternalEngine, SealTest, SealTestSettings};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    prelude::CrosstermBackend,
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame, Terminal,
};

const PULSE_PERIOD: Duration = Duration::from_millis(20);
const REDRAW_PERIOD: Duration = Duration::from_millis(150);

#[derive(Parser)]
#[command(
    name = "lcg-seal-test",
    version,
    about = "Live seal test: repeated voltage pulses and the resulting resistance"
)]
struct Cli {
    #[arg(short = 'I', long)]
    input_channel: Option<u32>,
    #[arg(short = 'O', long)]
    output_channel: Option<u32>,
    /// Pulse duration (ms)
    #[arg(short, long, default_value_t = 15.0)]
    duration: f64,
    /// Pulse amplitude (mV)
    #[arg(short, long, default_value_t = 10.0, allow_negative_numbers = true)]
    amplitude: f64,
    #[arg(short = 'F', long)]
    sampling_rate: Option<f64>,
    /// TOML file with the rig defaults, read instead of the environment
    #[arg(long)]
    defaults: Option<PathBuf>,
}

impl Cli {
    fn settings(&self) -> Result<SealTestSettings> {
        let defaults =
            LabDefaults::load(self.defaults.as_deref()).context("reading the rig defaults")?;
        let mut settings = SealTestSettings::from_defaults(&defaults);
        settings.duration_ms = self.duration;
        settings.amplitude = self.amplitude;
        if let Some(channel) = self.input_channel {
            settings.input_channel = channel;
        }
        if let Some(channel) = self.output_channel {
            settings.output_channel = channel;
        }
        if let Some(rate) = self.sampling_rate {
            settings.sampling_rate = rate;
        }
        Ok(settings)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let engine = ExternalEngine::from_env().with_verbosity(4);
    let seal = SealTest::new(engine, cli.settings()?).context("preparing the session files")?;
    let mut app = App::new(seal);

    let mut terminal = setup_terminal()?;
    let outcome = run(&mut terminal, &mut app);
    restore_terminal()?;
    log::info!("{} pulses, {} failed", app.seal.count(), app.failed);
    app.seal.close().context("removing the session files")?;
    outcome
}

/// Pulse and redraw on their own periods until the user quits.
fn run<E: AcquisitionEngine>(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App<E>,
) -> Result<()> {
    let mut last_pulse = Instant::now();
    let mut last_draw: Option<Instant> = None;
    while !app.should_quit {
        if last_draw.map_or(true, |t| t.elapsed() >= REDRAW_PERIOD) {
            terminal.draw(|f| draw(f, app))?;
            last_draw = Some(Instant::now());
        }
        let timeout = PULSE_PERIOD.saturating_sub(last_pulse.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.on_key(key);
                }
            }
        }
        if last_pulse.elapsed() >= PULSE_PERIOD {
            app.pulse();
            last_pulse = Instant::now();
        }
    }
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).context("initializing terminal")
}

fn restore_terminal() -> Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen)?;
    Ok(())
}

struct App<E> {
    seal: SealTest<E>,
    /// Fixed current range; follows the data when unset.
    zoom: Option<(f64, f64)>,
    fit: Option<(Vec<(f64, f64)>, FitReport)>,
    failed: usize,
    status: String,
    should_quit: bool,
}

impl<E: AcquisitionEngine> App<E> {
    fn new(seal: SealTest<E>) -> Self {
        Self {
            seal,
            zoom: None,
            fit: None,
            failed: 0,
            status: "r: reset   z: zoom to the traces   f: fit the transient   q: quit".into(),
            should_quit: false,
        }
    }

    fn pulse(&mut self) {
        if !self.seal.pulse() {
            self.failed += 1;
        }
    }

    fn on_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true
            }
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('r') => {
                self.seal.reset();
                self.zoom = None;
                self.fit = None;
                self.failed = 0;
                self.status = "Reset.".into();
            }
            KeyCode::Char('z') => {
                self.zoom = self.seal.current_bounds().map(|(lo, hi)| padded(lo, hi));
                self.status = match self.zoom {
                    Some((lo, hi)) => format!("Current axis set to [{:.1}, {:.1}] pA.", lo, hi),
                    None => "Nothing to zoom on yet.".into(),
                };
            }
            KeyCode::Char('f') => {
                if self.fit.take().is_some() {
                    self.status = "Fit hidden.".into();
                    return;
                }
                match self.seal.fit_transient() {
                    Ok((curve, report)) => {
                        let p = &report.params;
                        self.status = format!(
                            "tau1 = {:.3} ms, tau2 = {:.3} ms, rms = {:.2} pA",
                            p.tau1, p.tau2, report.rms
                        );
                        self.fit = Some((curve.iter().map(|p| (p[0], p[1])).collect(), report));
                    }
                    Err(err) => self.status = format!("Fit failed: {}", err),
                }
            }
            _ => {}
        }
    }

    /// Current range on the plot: the zoom if set, all traces otherwise.
    fn current_range(&self) -> (f64, f64) {
        self.zoom
            .or_else(|| self.seal.current_bounds().map(|(lo, hi)| padded(lo, hi)))
            .unwrap_or((-1.0, 1.0))
    }
}

fn padded(lo: f64, hi: f64) -> (f64, f64) {
    if hi > lo {
        let pad = (hi - lo) * 0.05;
        (lo - pad, hi + pad)
    } else {
        (lo - 1.0, hi + 1.0)
    }
}

/// `values` against `time`, as chart points.
fn points(time: &[f64], values: &[f64]) -> Vec<(f64, f64)> {
    time.iter().copied().zip(values.iter().copied()).collect()
}

fn axis_labels(lo: f64, hi: f64) -> Vec<Span<'static>> {
    vec![
        Span::raw(format!("{:.1}", lo)),
        Span::raw(format!("{:.1}", (lo + hi) / 2.0)),
        Span::raw(format!("{:.1}", hi)),
    ]
}

fn draw<E: AcquisitionEngine>(f: &mut Frame, app: &App<E>) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Percentage(55),
            Constraint::Min(8),
            Constraint::Length(3),
        ])
        .split(f.size());
    draw_header(f, layout[0], app);
    draw_currents(f, layout[1], app);
    draw_resistance(f, layout[2], app);
    let status = Paragraph::new(app.status.as_str())
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(status, layout[3]);
}

fn draw_header<E: AcquisitionEngine>(f: &mut Frame, area: Rect, app: &App<E>) {
    let settings = app.seal.settings();
    let resistance = match app.seal.displayed_resistance() {
        Some(r) => format!("R = {:.2} MOhm", r),
        None => "R = --".into(),
    };
    let line = Line::from(vec![
        Span::styled(
            resistance,
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            "   {} pulses ({} failed)   {:.0} mV for {:.0} ms   AI {} / AO {}",
            app.seal.count(),
            app.failed,
            settings.amplitude,
            settings.duration_ms,
            settings.input_channel,
            settings.output_channel
        )),
    ]);
    let header = Paragraph::new(line)
        .block(Block::default().borders(Borders::ALL).title("Seal test"));
    f.render_widget(header, area);
}

fn draw_currents<E: AcquisitionEngine>(f: &mut Frame, area: Rect, app: &App<E>) {
    let time = app.seal.time();
    let traces: Vec<Vec<(f64, f64)>> = app
        .seal
        .currents()
        .iter()
        .map(|trace| points(time, trace))
        .collect();
    let newest = traces.len().saturating_sub(1);
    let mut datasets: Vec<Dataset> = traces
        .iter()
        .enumerate()
        .map(|(k, data)| {
            let color = if k == newest {
                Color::Red
            } else {
                Color::DarkGray
            };
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(color))
                .data(data)
        })
        .collect();
    if let Some((curve, _)) = &app.fit {
        datasets.push(
            Dataset::default()
                .name("fit")
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(Color::Cyan))
                .data(curve),
        );
    }
    let t_end = time.last().copied().unwrap_or(1.0);
    let (lo, hi) = app.current_range();
    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(format!(
            "Current (last {} of {} pulses)",
            traces.len().min(MAX_TRACES),
            app.seal.count()
        )))
        .x_axis(
            Axis::default()
                .title("Time (ms)")
                .bounds([0.0, t_end])
                .labels(axis_labels(0.0, t_end)),
        )
        .y_axis(
            Axis::default()
                .title("I (pA)")
                .bounds([lo, hi])
                .labels(axis_labels(lo, hi)),
        );
    f.render_widget(chart, area);
}

fn draw_resistance<E: AcquisitionEngine>(f: &mut Frame, area: Rect, app: &App<E>) {
    let history: Vec<(f64, f64)> = app
        .seal
        .resistance_history()
        .into_iter()
        .map(|(t, r)| (t / 60.0, r))
        .collect();
    let t_end = history.last().map_or(1.0, |(t, _)| t.max(1.0 / 60.0));
    let (lo, hi) = history
        .iter()
        .map(|(_, r)| *r)
        .filter(|r| r.is_finite())
        .fold(None, |bounds: Option<(f64, f64)>, r| match bounds {
            None => Some((r, r)),
            Some((lo, hi)) => Some((lo.min(r), hi.max(r))),
        })
        .map(|(lo, hi)| padded(lo, hi))
        .unwrap_or((0.0, 1.0));
    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Yellow))
        .data(&history);
    let chart = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title("Resistance"))
        .x_axis(
            Axis::default()
                .title("Time (min)")
                .bounds([0.0, t_end])
                .labels(axis_labels(0.0, t_end)),
        )
        .y_axis(
            Axis::default()
                .title("R (MOhm)")
                .bounds([lo, hi])
                .labels(axis_labels(lo, hi)),
        );
    f.render_widget(chart, area);
}
