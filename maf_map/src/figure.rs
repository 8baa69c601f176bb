//! Backend-neutral description of the paired heatmaps and the renderer seam.

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateGrids;
use crate::MapError;

pub const FIGURE_TITLE: &str = "MAF and Sample Count Heatmaps by MAP and RPM";
pub const X_TITLE: &str = "RPM (bin)";
pub const Y_TITLE: &str = "MAP (mbar, bin)";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }

    /// Relative luminance in 0..=1 (sRGB weights, no gamma).
    pub fn luminance(self) -> f64 {
        (0.2126 * self.0 as f64 + 0.7152 * self.1 as f64 + 0.0722 * self.2 as f64) / 255.0
    }

    /// Black or white, whichever reads better on top of this color.
    pub fn contrasting_text(self) -> Rgb {
        if self.luminance() > 0.5 {
            Rgb(0, 0, 0)
        } else {
            Rgb(255, 255, 255)
        }
    }
}

const VIRIDIS: [Rgb; 9] = [
    Rgb(0x44, 0x01, 0x54),
    Rgb(0x47, 0x2c, 0x7a),
    Rgb(0x3b, 0x51, 0x8b),
    Rgb(0x2c, 0x71, 0x8e),
    Rgb(0x21, 0x90, 0x8d),
    Rgb(0x27, 0xad, 0x81),
    Rgb(0x5c, 0xc8, 0x63),
    Rgb(0xaa, 0xdc, 0x32),
    Rgb(0xfd, 0xe7, 0x25),
];

const BLUES: [Rgb; 9] = [
    Rgb(0xf7, 0xfb, 0xff),
    Rgb(0xde, 0xeb, 0xf7),
    Rgb(0xc6, 0xdb, 0xef),
    Rgb(0x9e, 0xca, 0xe1),
    Rgb(0x6b, 0xae, 0xd6),
    Rgb(0x42, 0x92, 0xc6),
    Rgb(0x21, 0x71, 0xb5),
    Rgb(0x08, 0x51, 0x9c),
    Rgb(0x08, 0x30, 0x6b),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorScale {
    Viridis,
    #[default]
    Blues,
}

impl ColorScale {
    fn stops(self) -> &'static [Rgb] {
        match self {
            ColorScale::Viridis => &VIRIDIS,
            ColorScale::Blues => &BLUES,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColorScale::Viridis => "viridis",
            ColorScale::Blues => "blues",
        }
    }

    /// Color at `t` in 0..=1, linearly interpolated between stops.
    pub fn sample(self, t: f64) -> Rgb {
        let stops = self.stops();
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let pos = t * (stops.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(stops.len() - 1);
        let frac = pos - lo as f64;
        let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * frac).round() as u8;
        let (a, b) = (stops[lo], stops[hi]);
        Rgb(lerp(a.0, b.0), lerp(a.1, b.1), lerp(a.2, b.2))
    }

    /// Stop list in Plotly's `[[position, color], ...]` shape.
    pub fn plotly_scale(self) -> Vec<(f64, String)> {
        let stops = self.stops();
        let last = (stops.len() - 1) as f64;
        stops
            .iter()
            .enumerate()
            .map(|(idx, rgb)| (idx as f64 / last, rgb.to_hex()))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelFormat {
    OneDecimal,
    Integer,
}

impl LabelFormat {
    pub fn format(self, value: f64) -> String {
        match self {
            LabelFormat::OneDecimal => format!("{:.1}", value),
            LabelFormat::Integer => format!("{:.0}", value),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Scale of the sample-count panel. The mean panel is always viridis.
    pub count_scale: ColorScale,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeatmapPanel {
    pub title: String,
    pub colorbar_label: String,
    pub scale: ColorScale,
    pub format: LabelFormat,
    /// Row-major, top row first.
    pub cells: Vec<Vec<Option<f64>>>,
    pub labels: Vec<Vec<Option<String>>>,
    /// Smallest and largest present value.
    pub value_range: Option<(f64, f64)>,
}

impl HeatmapPanel {
    fn new(
        title: &str,
        colorbar_label: &str,
        scale: ColorScale,
        format: LabelFormat,
        cells: Vec<Vec<Option<f64>>>,
    ) -> Self {
        let labels = cells
            .iter()
            .map(|row| row.iter().map(|cell| cell.map(|v| format.format(v))).collect())
            .collect();
        let value_range = cells.iter().flatten().flatten().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
        });
        Self {
            title: title.to_string(),
            colorbar_label: colorbar_label.to_string(),
            scale,
            format,
            cells,
            labels,
            value_range,
        }
    }

    /// Position of `value` within the panel's value range, 0..=1.
    pub fn normalized(&self, value: f64) -> f64 {
        match self.value_range {
            Some((lo, hi)) if hi > lo => ((value - lo) / (hi - lo)).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }

    pub fn color_for(&self, value: f64) -> Rgb {
        self.scale.sample(self.normalized(value))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeatmapFigure {
    pub title: String,
    pub x_title: String,
    pub y_title: String,
    /// MAP bins, highest first (drawn at the top).
    pub row_labels: Vec<String>,
    /// RPM bins, lowest first.
    pub col_labels: Vec<String>,
    pub panels: Vec<HeatmapPanel>,
}

impl HeatmapFigure {
    pub fn from_grids(grids: &AggregateGrids, options: &RenderOptions) -> Self {
        let mean = HeatmapPanel::new(
            "Average MAF (g/s) by MAP and RPM",
            "Avg MAF (g/s)",
            ColorScale::Viridis,
            LabelFormat::OneDecimal,
            grids.values.cells().to_vec(),
        );
        let count = HeatmapPanel::new(
            "Sample Count by MAP and RPM",
            "Sample Count",
            options.count_scale,
            LabelFormat::Integer,
            grids.counts.map(|n| n as f64).cells().to_vec(),
        );
        Self {
            title: FIGURE_TITLE.to_string(),
            x_title: X_TITLE.to_string(),
            y_title: Y_TITLE.to_string(),
            row_labels: grids.values.row_keys().iter().map(i64::to_string).collect(),
            col_labels: grids.values.col_keys().iter().map(i64::to_string).collect(),
            panels: vec![mean, count],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.row_labels.is_empty() || self.col_labels.is_empty()
    }
}

/// A backend that turns the annotated grid figure into its output
/// (image file, chart JSON, ...).
pub trait GridRenderer {
    type Output;

    fn render(&self, figure: &HeatmapFigure) -> Result<Self::Output, MapError>;
}
