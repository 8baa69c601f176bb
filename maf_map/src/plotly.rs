//! Plotly chart description of the heatmap figure, plus a standalone HTML page.

use serde::Serialize;
use serde_json::{json, Value};

use crate::figure::{GridRenderer, HeatmapFigure, HeatmapPanel};
use crate::MapError;

const PLOTLY_CDN: &str = "https://cdn.plot.ly/plotly-2.35.2.min.js";

// Horizontal placement of the two panels and their colorbars.
const DOMAINS: [[f64; 2]; 2] = [[0.0, 0.4], [0.55, 0.95]];
const COLORBAR_X: [f64; 2] = [0.42, 0.97];

/// Traces and layout, ready for `Plotly.react(div, data, layout)`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlotlyFigure {
    pub data: Value,
    pub layout: Value,
}

impl PlotlyFigure {
    /// Self-contained page that loads Plotly from its CDN.
    pub fn to_html(&self, title: &str) -> Result<String, MapError> {
        let data = script_json(&self.data)?;
        let layout = script_json(&self.layout)?;
        Ok(format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
             <script src=\"{PLOTLY_CDN}\"></script>\n</head>\n<body>\n\
             <div id=\"heatmaps\" style=\"width:100%;height:90vh;\"></div>\n\
             <script>\nPlotly.newPlot(\"heatmaps\", {data}, {layout}, {{\"responsive\": true}});\n\
             </script>\n</body>\n</html>\n",
            title = escape_html(title),
        ))
    }
}

/// Renders the figure as Plotly heatmap traces.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlotlyRenderer;

impl GridRenderer for PlotlyRenderer {
    type Output = PlotlyFigure;

    fn render(&self, figure: &HeatmapFigure) -> Result<PlotlyFigure, MapError> {
        if figure.is_empty() {
            return Err(MapError::Render("figure has no cells".into()));
        }
        let data: Vec<Value> = figure
            .panels
            .iter()
            .enumerate()
            .map(|(idx, panel)| heatmap_trace(figure, panel, idx))
            .collect();
        Ok(PlotlyFigure {
            data: Value::Array(data),
            layout: layout(figure),
        })
    }
}

fn axis_suffix(idx: usize) -> String {
    if idx == 0 {
        String::new()
    } else {
        (idx + 1).to_string()
    }
}

fn heatmap_trace(figure: &HeatmapFigure, panel: &HeatmapPanel, idx: usize) -> Value {
    let suffix = axis_suffix(idx);
    let text: Vec<Vec<String>> = panel
        .labels
        .iter()
        .map(|row| row.iter().map(|l| l.clone().unwrap_or_default()).collect())
        .collect();
    let scale: Vec<Value> = panel
        .scale
        .plotly_scale()
        .into_iter()
        .map(|(pos, color)| json!([pos, color]))
        .collect();
    json!({
        "type": "heatmap",
        "name": panel.title,
        "x": figure.col_labels,
        "y": figure.row_labels,
        "z": panel.cells,
        "text": text,
        "texttemplate": "%{text}",
        "hoverongaps": false,
        "hovertemplate": format!(
            "RPM %{{x}}<br>MAP %{{y}}<br>{} %{{text}}<extra></extra>",
            panel.colorbar_label
        ),
        "colorscale": scale,
        "colorbar": {
            "title": { "text": panel.colorbar_label },
            "x": COLORBAR_X[idx.min(1)],
        },
        "xaxis": format!("x{suffix}"),
        "yaxis": format!("y{suffix}"),
    })
}

fn layout(figure: &HeatmapFigure) -> Value {
    let mut layout = json!({
        "title": { "text": figure.title },
        "margin": { "t": 90 },
    });
    let mut annotations = Vec::new();
    for (idx, panel) in figure.panels.iter().enumerate() {
        let suffix = axis_suffix(idx);
        let domain = DOMAINS[idx.min(1)];
        layout[format!("xaxis{suffix}")] = json!({
            "title": { "text": figure.x_title },
            "type": "category",
            "domain": domain,
            "anchor": format!("y{suffix}"),
        });
        layout[format!("yaxis{suffix}")] = json!({
            "title": { "text": figure.y_title },
            "type": "category",
            "autorange": "reversed",
            "anchor": format!("x{suffix}"),
        });
        annotations.push(json!({
            "text": panel.title,
            "x": (domain[0] + domain[1]) / 2.0,
            "y": 1.0,
            "xref": "paper",
            "yref": "paper",
            "xanchor": "center",
            "yanchor": "bottom",
            "showarrow": false,
        }));
    }
    layout["annotations"] = Value::Array(annotations);
    layout
}

fn script_json(value: &Value) -> Result<String, MapError> {
    let text = serde_json::to_string(value).map_err(|e| MapError::Render(e.to_string()))?;
    Ok(text.replace("</", "<\\/"))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
