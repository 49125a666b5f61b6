use crate::config::OutputConfig;
use crate::types::{GridPoint, PartyPrediction, PredictionCell};
use anyhow::{anyhow, Context, Result};
use geo::{MultiPolygon, Rect};
use plotters::coord::Shift;
use plotters::prelude::*;
use std::path::Path;

// RdBu endpoints and midpoint
const LOW: (u8, u8, u8) = (33, 102, 172);
const MID: (u8, u8, u8) = (247, 247, 247);
const HIGH: (u8, u8, u8) = (178, 24, 43);

const TITLE: &str = "Regional popularity relative to national share";
const LEGEND_HEIGHT: i32 = 60;

fn plot_err<E: std::fmt::Debug>(e: E) -> anyhow::Error {
    anyhow!("Drawing failed: {:?}", e)
}

/// Symmetric clamp of a log2 ratio.
pub fn clamp_log2(value: f64, range: f64) -> f64 {
    value.clamp(-range, range)
}

/// `log2(predicted / national)` clamped to `[-range, range]`. Non-positive predictions
/// saturate at `-range`; NaN predictions or an unusable national share give `None`.
pub fn display_ratio(predicted: f64, national: f64, range: f64) -> Option<f64> {
    if predicted.is_nan() || !(national > 0.0) || !national.is_finite() {
        return None;
    }
    let ratio = if predicted > 0.0 {
        (predicted / national).log2()
    } else {
        f64::NEG_INFINITY
    };
    Some(clamp_log2(ratio, range))
}

pub fn prediction_cells(grid: &[GridPoint], predicted: &[f64], national: f64, range: f64) -> Vec<PredictionCell> {
    grid.iter()
        .zip(predicted)
        .filter_map(|(g, &p)| {
            display_ratio(p, national, range).map(|display_ratio| PredictionCell {
                point: g.point,
                predicted_share: p,
                display_ratio,
            })
        })
        .collect()
}

/// Diverging colour: blue below zero, near-white at zero, red above.
pub fn diverging_color(value: f64, range: f64) -> RGBColor {
    let t = (value / range).clamp(-1.0, 1.0);
    let (from, to, f) = if t < 0.0 { (MID, LOW, -t) } else { (MID, HIGH, t) };
    let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * f).round() as u8;
    RGBColor(mix(from.0, to.0), mix(from.1, to.1), mix(from.2, to.2))
}

/// Panels in descending national share.
pub fn panel_order(predictions: &[PartyPrediction]) -> Vec<&PartyPrediction> {
    let mut ordered: Vec<&PartyPrediction> = predictions.iter().collect();
    ordered.sort_by(|a, b| {
        b.national_share
            .total_cmp(&a.national_share)
            .then_with(|| a.party.cmp(&b.party))
    });
    ordered
}

fn format_ratio(log2: f64) -> String {
    let s = format!("{:.2}", 2f64.powf(log2));
    let s = s.trim_end_matches('0').trim_end_matches('.');
    format!("{}×", s)
}

/// Everything that stays the same across panels.
pub struct MapFrame<'a> {
    pub bbox: Rect<f64>,
    /// Width and height of one grid cell
    pub cell: (f64, f64),
    pub counties: &'a [MultiPolygon<f64>],
}

pub fn render_map(config: &OutputConfig, frame: &MapFrame, predictions: &[PartyPrediction]) -> Result<()> {
    let path = config.path.as_path();
    let (w, h) = (config.width, config.height);
    let is_svg = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("svg"));

    if is_svg {
        let root = SVGBackend::new(path, (w, h)).into_drawing_area();
        draw_facets(&root, config, frame, predictions)?;
        root.present().map_err(plot_err)?;
    } else {
        let mut buffer = vec![0u8; w as usize * h as usize * 3];
        {
            let root = BitMapBackend::with_buffer(&mut buffer, (w, h)).into_drawing_area();
            draw_facets(&root, config, frame, predictions)?;
            root.present().map_err(plot_err)?;
        }
        save_png(path, w, h, buffer)?;
    }
    tracing::info!("Wrote {} panels to {:?}", predictions.len(), path);
    Ok(())
}

fn save_png(path: &Path, w: u32, h: u32, buffer: Vec<u8>) -> Result<()> {
    let img = image::RgbImage::from_raw(w, h, buffer)
        .ok_or_else(|| anyhow!("Image buffer does not match {}x{}", w, h))?;
    img.save(path)
        .with_context(|| format!("Failed to save map to {:?}", path))
}

fn draw_facets<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    config: &OutputConfig,
    frame: &MapFrame,
    predictions: &[PartyPrediction],
) -> Result<()> {
    root.fill(&WHITE).map_err(plot_err)?;
    let root = if config.labels {
        root.titled(TITLE, ("sans-serif", 28)).map_err(plot_err)?
    } else {
        root.clone()
    };

    let (_, height) = root.dim_in_pixel();
    let (body, legend) = root.split_vertically((height as i32 - LEGEND_HEIGHT).max(0));
    draw_legend(&legend, config)?;

    let ordered = panel_order(predictions);
    if ordered.is_empty() {
        return Ok(());
    }
    let cols = config.columns.min(ordered.len());
    let rows = ordered.len().div_ceil(cols);
    let panels = body.split_evenly((rows, cols));
    for (area, prediction) in panels.iter().zip(ordered) {
        draw_panel(area, config, frame, prediction)?;
    }
    Ok(())
}

/// Data ranges padded so that one metre is the same number of pixels on both axes.
fn equal_aspect(bbox: Rect<f64>, pixels: (u32, u32)) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
    let (pw, ph) = (pixels.0.max(1) as f64, pixels.1.max(1) as f64);
    let scale = (bbox.width() / pw).max(bbox.height() / ph);
    let (hw, hh) = (scale * pw / 2.0, scale * ph / 2.0);
    let c = bbox.center();
    ((c.x - hw)..(c.x + hw), (c.y - hh)..(c.y + hh))
}

fn draw_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    config: &OutputConfig,
    frame: &MapFrame,
    prediction: &PartyPrediction,
) -> Result<()> {
    let mut builder = ChartBuilder::on(area);
    builder.margin(4);
    let caption_px = if config.labels {
        let caption = format!("{} ({:.1}%)", prediction.party, prediction.national_share * 100.0);
        builder.caption(caption, ("sans-serif", 18));
        26
    } else {
        0
    };
    let (pw, ph) = area.dim_in_pixel();
    let (xr, yr) = equal_aspect(frame.bbox, (pw.saturating_sub(8), ph.saturating_sub(8 + caption_px)));
    let mut chart = builder.build_cartesian_2d(xr, yr).map_err(plot_err)?;

    let range = config.clamp_log2_range;
    let (hx, hy) = (frame.cell.0 / 2.0, frame.cell.1 / 2.0);
    chart
        .draw_series(prediction.cells.iter().map(|c| {
            let (x, y) = (c.point.x(), c.point.y());
            Rectangle::new(
                [(x - hx, y - hy), (x + hx, y + hy)],
                diverging_color(c.display_ratio, range).filled(),
            )
        }))
        .map_err(plot_err)?;

    let outline = BLACK.mix(0.5).stroke_width(1);
    for county in frame.counties {
        for polygon in &county.0 {
            let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors());
            for ring in rings {
                chart
                    .draw_series(std::iter::once(PathElement::new(
                        ring.coords().map(|c| (c.x, c.y)).collect::<Vec<_>>(),
                        outline,
                    )))
                    .map_err(plot_err)?;
            }
        }
    }
    Ok(())
}

fn draw_legend<DB: DrawingBackend>(area: &DrawingArea<DB, Shift>, config: &OutputConfig) -> Result<()> {
    let (w, _) = area.dim_in_pixel();
    let range = config.clamp_log2_range;
    let (x0, x1) = (w as i32 / 4, 3 * w as i32 / 4);
    let steps = 100;
    let step_px = (x1 - x0) as f64 / steps as f64;
    for i in 0..steps {
        let v = -range + 2.0 * range * (i as f64 + 0.5) / steps as f64;
        let left = x0 + (i as f64 * step_px) as i32;
        let right = x0 + ((i + 1) as f64 * step_px).ceil() as i32;
        area.draw(&Rectangle::new(
            [(left, 10), (right, 30)],
            diverging_color(v, range).filled(),
        ))
        .map_err(plot_err)?;
    }
    if config.labels {
        let style = ("sans-serif", 14).into_font().color(&BLACK);
        for v in [-range, 0.0, range] {
            let x = x0 + ((v + range) / (2.0 * range) * (x1 - x0) as f64) as i32;
            area.draw(&Text::new(format_ratio(v), (x - 12, 36), style.clone()))
                .map_err(plot_err)?;
        }
    }
    Ok(())
}
