//! Static PNG/SVG rendering of the paired heatmaps with plotters.

use std::panic;
use std::path::{Path, PathBuf};

use maf_map::{GridRenderer, HeatmapFigure, HeatmapPanel, MapError, Rgb};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use plotters_backend::{
    text_anchor::{HPos, Pos, VPos},
    BackendColor, BackendCoord, BackendStyle, BackendTextStyle, DrawingBackend, DrawingErrorKind,
};

const COLORBAR_WIDTH: u32 = 110;
const COLORBAR_STEPS: usize = 96;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChartKind {
    Png,
    Svg,
}

/// Writes the figure to `path` as a bitmap or SVG image.
#[derive(Clone, Debug)]
pub struct StaticRenderer {
    path: PathBuf,
    kind: ChartKind,
    size: (u32, u32),
}

impl StaticRenderer {
    pub fn new(path: impl Into<PathBuf>, kind: ChartKind, size: (u32, u32)) -> Self {
        Self {
            path: path.into(),
            kind,
            size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GridRenderer for StaticRenderer {
    type Output = PathBuf;

    fn render(&self, figure: &HeatmapFigure) -> Result<PathBuf, MapError> {
        if figure.is_empty() {
            return Err(MapError::Render("figure has no cells".into()));
        }
        let draw = || -> anyhow::Result<()> {
            match self.kind {
                ChartKind::Png => {
                    let backend = BitMapBackend::new(&self.path, self.size);
                    draw_figure(FontSafeBackend::new(backend).into_drawing_area(), figure)
                }
                ChartKind::Svg => {
                    let backend = SVGBackend::new(&self.path, self.size);
                    draw_figure(FontSafeBackend::new(backend).into_drawing_area(), figure)
                }
            }
        };
        panic::catch_unwind(panic::AssertUnwindSafe(draw))
            .map_err(|_| MapError::Render("plotting backend panicked".into()))?
            .map_err(|e| MapError::Render(format!("plotting error: {e}")))?;
        Ok(self.path.clone())
    }
}

fn draw_figure<DB>(root: DrawingArea<DB, Shift>, figure: &HeatmapFigure) -> anyhow::Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;
    let body = root.titled(&figure.title, ("sans-serif", 26))?;
    let (width, _) = body.dim_in_pixel();
    let (left, right) = body.split_horizontally((width / 2) as i32);
    for (area, panel) in [left, right].iter().zip(&figure.panels) {
        draw_panel(area, figure, panel)?;
    }
    root.present()?;
    Ok(())
}

fn draw_panel<DB>(
    area: &DrawingArea<DB, Shift>,
    figure: &HeatmapFigure,
    panel: &HeatmapPanel,
) -> anyhow::Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let (width, _) = area.dim_in_pixel();
    let (heat_area, bar_area) =
        area.split_horizontally(width.saturating_sub(COLORBAR_WIDTH) as i32);
    let ncols = figure.col_labels.len();
    let nrows = figure.row_labels.len();

    let mut chart = ChartBuilder::on(&heat_area)
        .caption(&panel.title, ("sans-serif", 18))
        .margin(12)
        .x_label_area_size(52)
        .y_label_area_size(72)
        .build_cartesian_2d(axis_range(ncols), axis_range(nrows))?;

    let axis_font = FontDesc::new(FontFamily::SansSerif, 14.0, FontStyle::Normal);
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc(figure.x_title.as_str())
        .y_desc(figure.y_title.as_str())
        .x_labels(ncols + 1)
        .y_labels(nrows + 1)
        .x_label_formatter(&|v| column_label(*v, &figure.col_labels))
        .y_label_formatter(&|v| row_label(*v, &figure.row_labels))
        .label_style(axis_font.color(&BLACK.mix(0.85)))
        .draw()?;

    let (plot_w, plot_h) = chart.plotting_area().dim_in_pixel();
    let font_size = annotation_font_size(
        plot_w as f64 / ncols.max(1) as f64,
        plot_h as f64 / nrows.max(1) as f64,
    );

    for (r, row) in panel.cells.iter().enumerate() {
        let y = row_slot(r, nrows) as f64;
        for (c, cell) in row.iter().enumerate() {
            let Some(value) = *cell else { continue };
            let x = c as f64;
            let fill = panel.color_for(value);
            chart.draw_series(std::iter::once(Rectangle::new(
                [(x - 0.5, y - 0.5), (x + 0.5, y + 0.5)],
                to_rgb(fill).filled(),
            )))?;

            let Some(label) = panel.labels.get(r).and_then(|l| l.get(c)).cloned().flatten() else {
                continue;
            };
            let ink = to_rgb(fill.contrasting_text());
            let style = FontDesc::new(FontFamily::SansSerif, font_size, FontStyle::Normal)
                .color(&ink)
                .pos(Pos::new(HPos::Center, VPos::Center));
            chart.draw_series(std::iter::once(Text::new(label, (x, y), style)))?;
        }
    }

    draw_colorbar(&bar_area, panel)
}

fn draw_colorbar<DB>(area: &DrawingArea<DB, Shift>, panel: &HeatmapPanel) -> anyhow::Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let (lo, hi) = colorbar_range(panel.value_range);
    let mut bar = ChartBuilder::on(area)
        .margin_top(48)
        .margin_bottom(64)
        .margin_left(6)
        .margin_right(6)
        .x_label_area_size(0)
        .y_label_area_size(64)
        .build_cartesian_2d(0.0..1.0, lo..hi)?;

    let axis_font = FontDesc::new(FontFamily::SansSerif, 13.0, FontStyle::Normal);
    bar.configure_mesh()
        .disable_mesh()
        .x_labels(0)
        .y_labels(6)
        .y_desc(panel.colorbar_label.as_str())
        .y_label_formatter(&|v| panel.format.format(*v))
        .label_style(axis_font.color(&BLACK.mix(0.85)))
        .draw()?;

    let step = (hi - lo) / COLORBAR_STEPS as f64;
    bar.draw_series((0..COLORBAR_STEPS).map(|i| {
        let v0 = lo + step * i as f64;
        let t = (i as f64 + 0.5) / COLORBAR_STEPS as f64;
        Rectangle::new([(0.0, v0), (1.0, v0 + step)], to_rgb(panel.scale.sample(t)).filled())
    }))?;
    Ok(())
}

fn to_rgb(color: Rgb) -> RGBColor {
    RGBColor(color.0, color.1, color.2)
}

/// Cell centers sit on integers 0..count.
fn axis_range(count: usize) -> std::ops::Range<f64> {
    -0.5..(count as f64 - 0.5)
}

/// Vertical slot of a row; row 0 (highest MAP) is drawn at the top.
fn row_slot(row: usize, nrows: usize) -> usize {
    nrows.saturating_sub(1).saturating_sub(row)
}

fn slot_index(value: f64, len: usize) -> Option<usize> {
    let rounded = value.round();
    if (value - rounded).abs() > 1e-6 || rounded < 0.0 || rounded as usize >= len {
        return None;
    }
    Some(rounded as usize)
}

fn column_label(value: f64, labels: &[String]) -> String {
    slot_index(value, labels.len())
        .map(|idx| labels[idx].clone())
        .unwrap_or_default()
}

fn row_label(value: f64, labels: &[String]) -> String {
    slot_index(value, labels.len())
        .map(|slot| labels[row_slot(slot, labels.len())].clone())
        .unwrap_or_default()
}

/// Colorbar span; a single-valued panel is widened so the bar has height.
fn colorbar_range(range: Option<(f64, f64)>) -> (f64, f64) {
    match range {
        Some((lo, hi)) if hi > lo => (lo, hi),
        Some((v, _)) => (v - 0.5, v + 0.5),
        None => (0.0, 1.0),
    }
}

fn annotation_font_size(cell_w: f64, cell_h: f64) -> f64 {
    (cell_h * 0.45).min(cell_w * 0.3).clamp(8.0, 16.0).floor()
}

/// Wraps a backend so text still renders (as a small built-in pixel font)
/// when the font stack is unavailable and the inner backend panics or errors.
struct FontSafeBackend<DB> {
    inner: DB,
}

impl<DB> FontSafeBackend<DB> {
    fn new(inner: DB) -> Self {
        Self { inner }
    }
}

impl<DB: DrawingBackend> DrawingBackend for FontSafeBackend<DB> {
    type ErrorType = DB::ErrorType;

    fn get_size(&self) -> (u32, u32) {
        self.inner.get_size()
    }

    fn ensure_prepared(&mut self) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.ensure_prepared()
    }

    fn present(&mut self) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.present()
    }

    fn draw_pixel(
        &mut self,
        point: BackendCoord,
        color: BackendColor,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_pixel(point, color)
    }

    fn draw_line<S: BackendStyle>(
        &mut self,
        from: BackendCoord,
        to: BackendCoord,
        style: &S,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_line(from, to, style)
    }

    fn draw_rect<S: BackendStyle>(
        &mut self,
        upper_left: BackendCoord,
        bottom_right: BackendCoord,
        style: &S,
        fill: bool,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_rect(upper_left, bottom_right, style, fill)
    }

    fn draw_path<S: BackendStyle, I: IntoIterator<Item = BackendCoord>>(
        &mut self,
        path: I,
        style: &S,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_path(path, style)
    }

    fn draw_circle<S: BackendStyle>(
        &mut self,
        center: BackendCoord,
        radius: u32,
        style: &S,
        fill: bool,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_circle(center, radius, style, fill)
    }

    fn blit_bitmap(
        &mut self,
        pos: BackendCoord,
        (iw, ih): (u32, u32),
        src: &[u8],
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.blit_bitmap(pos, (iw, ih), src)
    }

    fn draw_text<TStyle: BackendTextStyle>(
        &mut self,
        text: &str,
        style: &TStyle,
        pos: BackendCoord,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.inner.draw_text(text, style, pos)
        })) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(DrawingErrorKind::FontError(_))) | Err(_) => {
                self.draw_text_fallback(text, style, pos)
            }
            Ok(Err(other)) => Err(other),
        }
    }

    fn estimate_text_size<TStyle: BackendTextStyle>(
        &self,
        text: &str,
        style: &TStyle,
    ) -> Result<(u32, u32), DrawingErrorKind<Self::ErrorType>> {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.inner.estimate_text_size(text, style)
        })) {
            Ok(Ok(size)) => Ok(size),
            _ => Ok(fallback_text_size(text, style.size())),
        }
    }
}

impl<DB: DrawingBackend> FontSafeBackend<DB> {
    fn draw_text_fallback<TStyle: BackendTextStyle>(
        &mut self,
        text: &str,
        style: &TStyle,
        pos: BackendCoord,
    ) -> Result<(), DrawingErrorKind<DB::ErrorType>> {
        let color = style.color();
        if color.alpha == 0.0 || text.trim().is_empty() {
            return Ok(());
        }

        let scale = fallback_scale(style.size());
        let (width, height) = fallback_text_size(text, style.size());
        let (width, height) = (width as i32, height as i32);
        let anchor = style.anchor();
        let dx = match anchor.h_pos {
            HPos::Left => 0,
            HPos::Center => -width / 2,
            HPos::Right => -width,
        };
        let dy = match anchor.v_pos {
            VPos::Top => 0,
            VPos::Center => -height / 2,
            VPos::Bottom => -height,
        };

        let mut cursor_x = pos.0 + dx;
        let top = pos.1 + dy;
        for ch in text.chars() {
            let glyph = fallback_glyph(ch);
            if let Some(glyph) = &glyph {
                for (row, bits) in glyph.rows.iter().enumerate() {
                    for col in 0..glyph.width {
                        if bits & (1 << (glyph.width - 1 - col)) == 0 {
                            continue;
                        }
                        let x0 = cursor_x + col as i32 * scale;
                        let y0 = top + row as i32 * scale;
                        for py in y0..y0 + scale {
                            for px in x0..x0 + scale {
                                self.inner.draw_pixel((px, py), color.clone())?;
                            }
                        }
                    }
                }
            }
            cursor_x += glyph_advance(glyph.as_ref()) as i32 * scale;
        }
        Ok(())
    }
}

const GLYPH_WIDTH: usize = 3;
const GLYPH_HEIGHT: usize = 5;

struct Glyph {
    width: usize,
    rows: [u8; GLYPH_HEIGHT],
}

const fn narrow(rows: [u8; GLYPH_HEIGHT]) -> Glyph {
    Glyph {
        width: GLYPH_WIDTH,
        rows,
    }
}

const fn wide(width: usize, rows: [u8; GLYPH_HEIGHT]) -> Glyph {
    Glyph { width, rows }
}

/// Glyph width plus one column of spacing; unknown characters keep the
/// narrow advance.
fn glyph_advance(glyph: Option<&Glyph>) -> usize {
    glyph.map_or(GLYPH_WIDTH, |g| g.width) + 1
}

fn fallback_scale(font_size: f64) -> i32 {
    (font_size / 8.0).round().max(1.0) as i32
}

fn fallback_text_size(text: &str, font_size: f64) -> (u32, u32) {
    let scale = fallback_scale(font_size) as u32;
    let columns: usize = text
        .chars()
        .map(|ch| glyph_advance(fallback_glyph(ch).as_ref()))
        .sum();
    let width = (columns as u32).saturating_sub(1) * scale;
    (width, GLYPH_HEIGHT as u32 * scale)
}

/// 5-row pixel glyphs for titles, bin labels and cell annotations. Letters
/// are drawn in upper case; other characters advance without drawing.
fn fallback_glyph(ch: char) -> Option<Glyph> {
    Some(match ch.to_ascii_uppercase() {
        '0' => narrow([0b111, 0b101, 0b101, 0b101, 0b111]),
        '1' => narrow([0b010, 0b110, 0b010, 0b010, 0b111]),
        '2' => narrow([0b111, 0b001, 0b111, 0b100, 0b111]),
        '3' => narrow([0b111, 0b001, 0b111, 0b001, 0b111]),
        '4' => narrow([0b101, 0b101, 0b111, 0b001, 0b001]),
        '5' => narrow([0b111, 0b100, 0b111, 0b001, 0b111]),
        '6' => narrow([0b111, 0b100, 0b111, 0b101, 0b111]),
        '7' => narrow([0b111, 0b001, 0b010, 0b010, 0b010]),
        '8' => narrow([0b111, 0b101, 0b111, 0b101, 0b111]),
        '9' => narrow([0b111, 0b101, 0b111, 0b001, 0b111]),
        'A' => narrow([0b010, 0b101, 0b111, 0b101, 0b101]),
        'B' => narrow([0b110, 0b101, 0b110, 0b101, 0b110]),
        'C' => narrow([0b011, 0b100, 0b100, 0b100, 0b011]),
        'D' => narrow([0b110, 0b101, 0b101, 0b101, 0b110]),
        'E' => narrow([0b111, 0b100, 0b110, 0b100, 0b111]),
        'F' => narrow([0b111, 0b100, 0b110, 0b100, 0b100]),
        'G' => narrow([0b011, 0b100, 0b101, 0b101, 0b011]),
        'H' => narrow([0b101, 0b101, 0b111, 0b101, 0b101]),
        'I' => narrow([0b111, 0b010, 0b010, 0b010, 0b111]),
        'J' => narrow([0b001, 0b001, 0b001, 0b101, 0b010]),
        'K' => narrow([0b101, 0b101, 0b110, 0b101, 0b101]),
        'L' => narrow([0b100, 0b100, 0b100, 0b100, 0b111]),
        'M' => wide(5, [0b10001, 0b11011, 0b10101, 0b10001, 0b10001]),
        'N' => wide(4, [0b1001, 0b1101, 0b1011, 0b1001, 0b1001]),
        'O' => narrow([0b010, 0b101, 0b101, 0b101, 0b010]),
        'P' => narrow([0b110, 0b101, 0b110, 0b100, 0b100]),
        'Q' => narrow([0b010, 0b101, 0b101, 0b110, 0b011]),
        'R' => narrow([0b110, 0b101, 0b110, 0b101, 0b101]),
        'S' => narrow([0b011, 0b100, 0b010, 0b001, 0b110]),
        'T' => narrow([0b111, 0b010, 0b010, 0b010, 0b010]),
        'U' => narrow([0b101, 0b101, 0b101, 0b101, 0b111]),
        'V' => narrow([0b101, 0b101, 0b101, 0b101, 0b010]),
        'W' => wide(5, [0b10001, 0b10001, 0b10101, 0b11011, 0b10001]),
        'X' => narrow([0b101, 0b101, 0b010, 0b101, 0b101]),
        'Y' => narrow([0b101, 0b101, 0b010, 0b010, 0b010]),
        'Z' => narrow([0b111, 0b001, 0b010, 0b100, 0b111]),
        '.' => narrow([0b000, 0b000, 0b000, 0b000, 0b010]),
        ',' => wide(2, [0b00, 0b00, 0b00, 0b01, 0b10]),
        '-' => narrow([0b000, 0b000, 0b111, 0b000, 0b000]),
        '(' => narrow([0b010, 0b100, 0b100, 0b100, 0b010]),
        ')' => narrow([0b010, 0b001, 0b001, 0b001, 0b010]),
        '/' => narrow([0b001, 0b001, 0b010, 0b100, 0b100]),
        ' ' => wide(2, [0; GLYPH_HEIGHT]),
        _ => return None,
    })
}
