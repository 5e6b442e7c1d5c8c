//! SVG charts for a training run: metric curves, confusion matrix and a
//! grid of test images annotated with their predictions.

use std::{fmt::Write as _, io::Cursor, path::Path};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, ImageFormat};

use crate::{
    data::{OdirSample, NUM_CLASSES},
    metrics::History,
};

const COLOR_TRAIN: &str = "#3498db";
const COLOR_VAL: &str = "#e67e22";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";
const COLOR_HIT: &str = "#27ae60";
const COLOR_MISS: &str = "#c0392b";

const PANEL_WIDTH: f64 = 420.0;
const PANEL_HEIGHT: f64 = 280.0;
const MARGIN_TOP: f64 = 40.0;
const MARGIN_RIGHT: f64 = 20.0;
const MARGIN_BOTTOM: f64 = 50.0;
const MARGIN_LEFT: f64 = 60.0;

/// Where the legend of a line panel goes.
#[derive(Debug, Clone, Copy)]
pub enum LegendPosition {
    UpperRight,
    LowerRight,
}

struct Series<'a> {
    name: &'a str,
    values: &'a [f64],
    color: &'a str,
    dashed: bool,
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn svg_open(width: f64, height: f64) -> String {
    format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {h}" width="{w}" height="{h}"><rect width="{w}" height="{h}" fill="white"/>"#,
        w = width,
        h = height
    )
}

fn text(svg: &mut String, x: f64, y: f64, size: u32, anchor: &str, content: &str) {
    let _ = write!(
        svg,
        r#"<text x="{:.1}" y="{:.1}" text-anchor="{}" font-family="Arial, sans-serif" font-size="{}" fill="{}">{}</text>"#,
        x,
        y,
        anchor,
        size,
        COLOR_TEXT,
        escape_xml(content)
    );
}

/// One line chart with its own axes, drawn at `(x0, y0)`.
#[allow(clippy::too_many_arguments)]
fn line_panel(
    svg: &mut String,
    x0: f64,
    y0: f64,
    title: &str,
    x_label: &str,
    y_label: &str,
    series: &[Series],
    legend: LegendPosition,
) {
    let plot_w = PANEL_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_h = PANEL_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
    let left = x0 + MARGIN_LEFT;
    let top = y0 + MARGIN_TOP;
    let bottom = top + plot_h;

    let epochs = series.iter().map(|s| s.values.len()).max().unwrap_or(0).max(1);
    let all = series.iter().flat_map(|s| s.values.iter().copied()).filter(|v| v.is_finite());
    let (mut y_min, mut y_max) = all.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !y_min.is_finite() {
        y_min = 0.0;
        y_max = 1.0;
    }
    if (y_max - y_min).abs() < 1e-9 {
        y_min -= 0.5;
        y_max += 0.5;
    }

    let sx = |i: usize| {
        if epochs == 1 {
            left + plot_w / 2.0
        } else {
            left + i as f64 / (epochs - 1) as f64 * plot_w
        }
    };
    let sy = |v: f64| bottom - (v - y_min) / (y_max - y_min) * plot_h;

    text(svg, x0 + PANEL_WIDTH / 2.0, y0 + 24.0, 15, "middle", title);

    for i in 0..=4 {
        let v = y_min + i as f64 / 4.0 * (y_max - y_min);
        let y = sy(v);
        let _ = write!(
            svg,
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="1"/>"#,
            left, y, left + plot_w, y, COLOR_GRID
        );
        text(svg, left - 6.0, y + 4.0, 11, "end", &format!("{:.3}", v));
    }

    let _ = write!(
        svg,
        r#"<polyline points="{:.1},{:.1} {:.1},{:.1} {:.1},{:.1}" fill="none" stroke="{}" stroke-width="1.5"/>"#,
        left, top, left, bottom, left + plot_w, bottom, COLOR_AXIS
    );

    let step = (epochs / 10).max(1);
    for i in (0..epochs).step_by(step) {
        text(svg, sx(i), bottom + 16.0, 11, "middle", &(i + 1).to_string());
    }
    text(svg, left + plot_w / 2.0, y0 + PANEL_HEIGHT - 10.0, 12, "middle", x_label);
    let _ = write!(
        svg,
        r#"<text x="{x:.1}" y="{y:.1}" text-anchor="middle" font-family="Arial, sans-serif" font-size="12" fill="{c}" transform="rotate(-90 {x:.1} {y:.1})">{t}</text>"#,
        x = x0 + 16.0,
        y = top + plot_h / 2.0,
        c = COLOR_TEXT,
        t = escape_xml(y_label)
    );

    for s in series {
        let points: Vec<String> = s
            .values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, &v)| format!("{:.1},{:.1}", sx(i), sy(v)))
            .collect();
        let dash = if s.dashed { r#" stroke-dasharray="6,4""# } else { "" };
        let _ = write!(
            svg,
            r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2"{}/>"#,
            points.join(" "),
            s.color,
            dash
        );
    }

    let legend_x = left + plot_w - 110.0;
    let legend_y = match legend {
        LegendPosition::UpperRight => top + 8.0,
        LegendPosition::LowerRight => bottom - 10.0 - 18.0 * series.len() as f64,
    };
    for (i, s) in series.iter().enumerate() {
        let y = legend_y + 18.0 * i as f64;
        let _ = write!(
            svg,
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="2"/>"#,
            legend_x,
            y + 6.0,
            legend_x + 20.0,
            y + 6.0,
            s.color
        );
        text(svg, legend_x + 26.0, y + 10.0, 11, "start", s.name);
    }
}

/// Train and validation curves for every tracked metric, `columns` panels per row.
pub fn plot_metrics(history: &History, output_path: &Path, columns: usize) -> Result<()> {
    let columns = columns.max(1);
    let names = History::METRIC_NAMES;
    let rows = names.len().div_ceil(columns);

    let mut svg = svg_open(PANEL_WIDTH * columns as f64, PANEL_HEIGHT * rows as f64);
    for (i, name) in names.iter().enumerate() {
        let train = history.series(name).unwrap_or_default();
        let val = history.series(&format!("val_{}", name)).unwrap_or_default();
        let x0 = (i % columns) as f64 * PANEL_WIDTH;
        let y0 = (i / columns) as f64 * PANEL_HEIGHT;
        let legend = if *name == "loss" {
            LegendPosition::UpperRight
        } else {
            LegendPosition::LowerRight
        };

        line_panel(
            &mut svg,
            x0,
            y0,
            name,
            "Epoch",
            name,
            &[
                Series { name: "Train", values: &train, color: COLOR_TRAIN, dashed: false },
                Series { name: "Val", values: &val, color: COLOR_VAL, dashed: true },
            ],
            legend,
        );
    }
    svg.push_str("</svg>");

    std::fs::write(output_path, svg)?;
    Ok(())
}

/// `accuracy` against `val_accuracy` per epoch.
pub fn plot_accuracy(history: &History, output_path: &Path) -> Result<()> {
    let train = history.series("accuracy").unwrap_or_default();
    let val = history.series("val_accuracy").unwrap_or_default();

    let mut svg = svg_open(PANEL_WIDTH, PANEL_HEIGHT);
    line_panel(
        &mut svg,
        0.0,
        0.0,
        "Accuracy",
        "Epoch",
        "Accuracy",
        &[
            Series { name: "accuracy", values: &train, color: COLOR_TRAIN, dashed: false },
            Series { name: "val_accuracy", values: &val, color: COLOR_VAL, dashed: false },
        ],
        LegendPosition::LowerRight,
    );
    svg.push_str("</svg>");

    std::fs::write(output_path, svg)?;
    Ok(())
}

/// Heat map of a class-by-class confusion matrix (rows: truth, columns: prediction).
pub fn plot_confusion_matrix(
    matrix: &[[usize; NUM_CLASSES]; NUM_CLASSES],
    class_names: &[&str],
    output_path: &Path,
) -> Result<()> {
    let cell = 56.0;
    let left = 120.0;
    let top = 90.0;
    let size = cell * NUM_CLASSES as f64;
    let max = matrix.iter().flatten().copied().max().unwrap_or(0).max(1) as f64;

    let mut svg = svg_open(left + size + 30.0, top + size + 40.0);
    text(&mut svg, left + size / 2.0, 28.0, 16, "middle", "Confusion matrix");
    text(&mut svg, left + size / 2.0, 52.0, 12, "middle", "Predicted label");
    text(&mut svg, 14.0, top - 10.0, 12, "start", "True label");

    for (i, row) in matrix.iter().enumerate() {
        let y = top + i as f64 * cell;
        let name = class_names.get(i).copied().unwrap_or("?");
        text(&mut svg, left - 8.0, y + cell / 2.0 + 4.0, 11, "end", name);
        text(&mut svg, left + i as f64 * cell + cell / 2.0, top - 10.0, 10, "middle", name);

        for (j, &count) in row.iter().enumerate() {
            let x = left + j as f64 * cell;
            let intensity = count as f64 / max;
            let shade = (255.0 - intensity * 200.0) as u8;
            let _ = write!(
                svg,
                r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="rgb({},{},255)" stroke="white"/>"#,
                x, y, cell, cell, shade, shade
            );
            let _ = write!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
                x + cell / 2.0,
                y + cell / 2.0 + 4.0,
                if intensity > 0.6 { "white" } else { COLOR_TEXT },
                count
            );
        }
    }
    svg.push_str("</svg>");

    std::fs::write(output_path, svg)?;
    Ok(())
}

fn thumbnail_data_uri(sample: &OdirSample, size: u32) -> Option<String> {
    let img = sample.to_image()?;
    let thumb = image::imageops::resize(&img, size, size, FilterType::Triangle);
    let mut bytes = Cursor::new(Vec::new());
    thumb.write_to(&mut bytes, ImageFormat::Png).ok()?;
    Some(format!("data:image/png;base64,{}", STANDARD.encode(bytes.into_inner())))
}

fn top_class(row: &[f32]) -> (usize, f32) {
    row.iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best })
}

/// Grid of un-preprocessed test images with true labels and top prediction.
/// The caption is green when the top prediction is one of the true labels.
pub fn plot_output(
    predictions: &[[f32; NUM_CLASSES]],
    samples: &[OdirSample],
    class_names: &[&str],
    output_path: &Path,
    max_images: usize,
) -> Result<()> {
    let count = predictions.len().min(samples.len()).min(max_images);
    let columns = 4usize;
    let rows = count.div_ceil(columns).max(1);
    let thumb = 128.0;
    let cell_w = 190.0;
    let cell_h = thumb + 60.0;

    let mut svg = svg_open(cell_w * columns as f64, cell_h * rows as f64);
    for (i, (pred, sample)) in predictions.iter().zip(samples.iter()).take(count).enumerate() {
        let x = (i % columns) as f64 * cell_w;
        let y = (i / columns) as f64 * cell_h;

        if let Some(uri) = thumbnail_data_uri(sample, thumb as u32) {
            let _ = write!(
                svg,
                r#"<image x="{:.1}" y="{:.1}" width="{t}" height="{t}" href="{}"/>"#,
                x + (cell_w - thumb) / 2.0,
                y + 6.0,
                uri,
                t = thumb
            );
        }

        let truth: Vec<&str> = sample
            .labels
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v == 1)
            .map(|(c, _)| class_names.get(c).copied().unwrap_or("?"))
            .collect();
        let (best, prob) = top_class(pred);
        let hit = sample.labels.get(best).copied() == Some(1);
        let name = class_names.get(best).copied().unwrap_or("?");

        text(&mut svg, x + cell_w / 2.0, y + thumb + 24.0, 11, "middle", &format!("{} ({})", sample.id, truth.join(", ")));
        let _ = write!(
            svg,
            r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-family="Arial, sans-serif" font-size="12" fill="{}">{} {:.0}%</text>"#,
            x + cell_w / 2.0,
            y + thumb + 42.0,
            if hit { COLOR_HIT } else { COLOR_MISS },
            escape_xml(name),
            prob * 100.0
        );
    }
    svg.push_str("</svg>");

    std::fs::write(output_path, svg)?;
    Ok(())
}
