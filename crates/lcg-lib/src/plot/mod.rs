use crate::analysis::kernel::KernelSplit;
use crate::io::trace::Recording;
use crate::signal::TimeSeries;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Axis {
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub width: f32,
    pub dash: Option<[f32; 2]>,
    pub color: Color,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct Color(pub u32);

impl Color {
    pub fn rgb(self) -> (u8, u8, u8) {
        (
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        )
    }
}

/// Colours cycled through when a figure holds several traces.
pub const PALETTE: [u32; 6] = [0x000000, 0xD62728, 0x1F77B4, 0x2CA02C, 0xFF7F0E, 0x9467BD];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSeries {
    pub name: String,
    pub points: Vec<[f64; 2]>,
    pub style: Style,
}

impl LineSeries {
    pub fn new(name: impl Into<String>, points: Vec<[f64; 2]>, color: u32) -> Self {
        Self {
            name: name.into(),
            points,
            style: Style {
                width: 1.4,
                dash: None,
                color: Color(color),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Series {
    Line(LineSeries),
}

impl Series {
    pub fn points(&self) -> &[[f64; 2]] {
        match self {
            Series::Line(line) => &line.points,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Figure {
    pub title: Option<String>,
    pub x: Axis,
    pub y: Axis,
    pub series: Vec<Series>,
}

impl Figure {
    pub fn new(title: impl Into<Option<String>>) -> Self {
        Self {
            title: title.into(),
            x: Axis { label: None },
            y: Axis { label: None },
            series: Vec::new(),
        }
    }

    pub fn with_labels(mut self, x: &str, y: &str) -> Self {
        self.x.label = Some(x.into());
        self.y.label = Some(y.into());
        self
    }

    pub fn add_series(&mut self, series: Series) {
        self.series.push(series);
    }

    /// Smallest box holding every point: `(x_min, x_max, y_min, y_max)`.
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let mut points = self.series.iter().flat_map(|s| s.points().iter());
        let first = points.next()?;
        let init = (first[0], first[0], first[1], first[1]);
        Some(points.fold(init, |(x0, x1, y0, y1), p| {
            (x0.min(p[0]), x1.max(p[0]), y0.min(p[1]), y1.max(p[1]))
        }))
    }
}

pub trait PlotBackend {
    fn draw(&mut self, fig: &Figure) -> anyhow::Result<()>;
}

pub fn decimate_points(points: &[[f64; 2]], max_points: usize) -> Vec<[f64; 2]> {
    if points.len() <= max_points {
        return points.to_vec();
    }
    let bucket_size = points.len() as f64 / max_points as f64;
    let mut result = Vec::with_capacity(max_points);
    for i in 0..max_points {
        let start = (i as f64 * bucket_size).floor() as usize;
        if start >= points.len() {
            break;
        }
        let sample = points[start];
        result.push(sample);
    }
    result
}

fn series_points(x: impl Iterator<Item = f64>, y: &[f64], max_points: usize) -> Vec<[f64; 2]> {
    let points: Vec<[f64; 2]> = x.zip(y).map(|(x, y)| [x, *y]).collect();
    decimate_points(&points, max_points)
}

pub fn figure_from_timeseries(
    title: &str,
    series: &TimeSeries,
    max_points: usize,
    color: u32,
) -> Figure {
    let dt = 1.0 / series.fs.max(1.0);
    let points = series_points(
        (0..series.len()).map(|i| i as f64 * dt),
        &series.data,
        max_points,
    );
    let y = series.units.as_deref().unwrap_or("");
    let mut fig = Figure::new(Some(title.into())).with_labels("Time (s)", y);
    fig.add_series(Series::Line(LineSeries::new(title, points, color)));
    fig
}

/// One figure per distinct unit in the recording, each holding every entity
/// recorded in that unit.
pub fn figures_from_recording(recording: &Recording, max_points: usize) -> Vec<Figure> {
    let mut figures: Vec<(String, Figure)> = Vec::new();
    for entity in &recording.entities {
        let units = entity.units.clone().unwrap_or_default();
        let index = match figures.iter().position(|(u, _)| *u == units) {
            Some(index) => index,
            None => {
                let title = if units.is_empty() {
                    "Entities".to_string()
                } else {
                    format!("Entities ({})", units)
                };
                figures.push((
                    units.clone(),
                    Figure::new(Some(title)).with_labels("Time (s)", &units),
                ));
                figures.len() - 1
            }
        };
        let figure = &mut figures[index].1;
        let color = PALETTE[figure.series.len() % PALETTE.len()];
        let name = match &entity.name {
            Some(name) => format!("{} #{}", name, entity.id),
            None => format!("#{}", entity.id),
        };
        let points = series_points(
            (0..entity.data.len()).map(|i| i as f64 * recording.info.dt),
            &entity.data,
            max_points,
        );
        figure.add_series(Series::Line(LineSeries::new(name, points, color)));
    }
    figures.into_iter().map(|(_, figure)| figure).collect()
}

/// Overlay of the recorded current traces, time in ms.
pub fn figure_from_traces(title: &str, time_ms: &[f64], traces: &[Vec<f64>], units: &str) -> Figure {
    let mut fig = Figure::new(Some(title.into())).with_labels("Time (ms)", units);
    for (k, trace) in traces.iter().enumerate() {
        let points = series_points(time_ms.iter().copied(), trace, usize::MAX);
        let color = if k + 1 == traces.len() { 0xD62728 } else { 0x999999 };
        fig.add_series(Series::Line(LineSeries::new(format!("#{}", k + 1), points, color)));
    }
    fig
}

/// Resistance estimates (MOhm) against elapsed time (s).
pub fn figure_from_resistance(history: &[(f64, f64)]) -> Figure {
    let mut fig = Figure::new(Some("Resistance".into())).with_labels("Time (s)", "R (MOhm)");
    let points = history.iter().map(|(t, r)| [*t, *r]).collect();
    fig.add_series(Series::Line(LineSeries::new("R", points, 0x000000)));
    fig
}

/// Full, membrane and electrode kernels in MOhm, time in ms.
pub fn figure_from_kernel(full: &[f64], split: &KernelSplit, dt: f64) -> Figure {
    let time = |n: usize| (0..n).map(move |i| i as f64 * dt * 1e3);
    let mohm = |values: &[f64]| values.iter().map(|v| v * 1e3).collect::<Vec<_>>();
    let mut fig = Figure::new(Some("Kernels".into())).with_labels("Time (ms)", "R (MOhm)");
    fig.add_series(Series::Line(LineSeries::new(
        "Full",
        series_points(time(full.len()), &mohm(full), usize::MAX),
        0x000000,
    )));
    fig.add_series(Series::Line(LineSeries::new(
        "Membrane",
        series_points(time(split.membrane.len()), &mohm(&split.membrane), usize::MAX),
        0x1F77B4,
    )));
    fig.add_series(Series::Line(LineSeries::new(
        "Electrode",
        series_points(time(split.electrode.len()), &mohm(&split.electrode), usize::MAX),
        0xD62728,
    )));
    fig
}

/// Recorded and offline-compensated voltage around the pulse, time in ms from
/// the start of the window.
pub fn figure_from_compensation(dt: f64, recorded: &[f64], compensated: &[f64]) -> Figure {
    let time = || (0..recorded.len()).map(|n| n as f64 * dt * 1e3);
    let mut fig = Figure::new(Some("Compensation".into())).with_labels("Time (ms)", "V (mV)");
    fig.add_series(Series::Line(LineSeries::new(
        "Recorded",
        series_points(time(), recorded, usize::MAX),
        0x000000,
    )));
    fig.add_series(Series::Line(LineSeries::new(
        "Compensated",
        series_points(time(), compensated, usize::MAX),
        0xD62728,
    )));
    fig
}
