use anyhow::Result;
use lcg_lib::plot::{Figure, PlotBackend, Series};
use plotters::prelude::*;
use std::path::{Path, PathBuf};

/// Renders figures to PNG files with plotters.
pub struct PngBackend {
    path: PathBuf,
    size: (u32, u32),
}

impl PngBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: (800, 480),
        }
    }
}

impl PlotBackend for PngBackend {
    fn draw(&mut self, fig: &Figure) -> Result<()> {
        draw_plotters_figure(&self.path, self.size, fig)
    }
}

fn padded(lo: f64, hi: f64) -> (f64, f64) {
    if hi > lo {
        let pad = (hi - lo) * 0.02;
        (lo - pad, hi + pad)
    } else {
        (lo - 1.0, hi + 1.0)
    }
}

fn draw_plotters_figure(path: &Path, size: (u32, u32), fig: &Figure) -> Result<()> {
    let backend = BitMapBackend::new(path, size);
    let root = backend.into_drawing_area();
    root.fill(&WHITE)?;
    let (x_min, x_max, y_min, y_max) = fig.bounds().unwrap_or((0.0, 1.0, 0.0, 1.0));
    let (x_min, x_max) = padded(x_min, x_max);
    let (y_min, y_max) = padded(y_min, y_max);
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(
            fig.title.clone().unwrap_or_else(|| "Plot".into()),
            ("sans-serif", 24),
        )
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;
    chart
        .configure_mesh()
        .x_desc(fig.x.label.clone().unwrap_or_default())
        .y_desc(fig.y.label.clone().unwrap_or_default())
        .draw()?;
    for series in &fig.series {
        match series {
            Series::Line(line) => {
                let (r, g, b) = line.style.color.rgb();
                let color = RGBColor(r, g, b);
                chart
                    .draw_series(LineSeries::new(
                        line.points.iter().map(|p| (p[0], p[1])),
                        color.stroke_width(line.style.width.round().max(1.0) as u32),
                    ))?
                    .label(line.name.clone())
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
            }
        }
    }
    if fig.series.len() > 1 {
        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()?;
    }
    root.present()?;
    Ok(())
}
