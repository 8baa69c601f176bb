use leptos::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{HtmlInputElement, HtmlSelectElement};

use maf_map::figure::FIGURE_TITLE;
use maf_map::{
    run_pipeline, ColorScale, ColumnProfile, InputKind, LoadOptions, MappingSource, PipelineOutcome,
    PipelineRequest, PlotlyFigure, PlotlyRenderer, RenderOptions,
};

#[cfg(feature = "chart_plotly")]
use serde::Serialize;
#[cfg(feature = "chart_plotly")]
use wasm_bindgen::JsValue;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const PLOT_DIV: &str = "heatmap_plot";

const AWAIT_LOG: &str = "Please upload a CSV file to see the heatmaps.";
const AWAIT_MAPPING: &str = "Please upload a column mapping CSV to see the heatmaps.";

#[derive(Clone)]
struct FileBytes {
    name: String,
    bytes: Vec<u8>,
}

async fn read_file(file: web_sys::File) -> Option<FileBytes> {
    let buf = JsFuture::from(file.array_buffer()).await.ok()?;
    let bytes = js_sys::Uint8Array::new(&buf).to_vec();
    Some(FileBytes {
        name: file.name(),
        bytes,
    })
}

async fn read_first_file(input: &HtmlInputElement) -> Option<FileBytes> {
    let file = input.files()?.item(0)?;
    read_file(file).await
}

fn input_from(ev: &ev::Event) -> Option<HtmlInputElement> {
    ev.target()?.dyn_into::<HtmlInputElement>().ok()
}

fn scale_from_name(name: &str) -> ColorScale {
    [ColorScale::Blues, ColorScale::Viridis]
        .into_iter()
        .find(|scale| scale.name() == name)
        .unwrap_or_default()
}

fn awaiting_message(missing: &[InputKind]) -> &'static str {
    if missing.contains(&InputKind::Log) {
        AWAIT_LOG
    } else {
        AWAIT_MAPPING
    }
}

/// One request-scoped pipeline run over the current uploads. `Err` carries
/// the status line to show instead of a chart.
fn evaluate(
    log: Option<&[u8]>,
    mapping: Option<&[u8]>,
    use_builtin: bool,
    strict: bool,
    count_scale: ColorScale,
) -> Result<(PlotlyFigure, String), String> {
    let request = PipelineRequest {
        log_csv: log,
        mapping: if use_builtin {
            MappingSource::BuiltIn
        } else {
            MappingSource::Upload(mapping)
        },
        profile: if strict {
            ColumnProfile::Strict
        } else {
            ColumnProfile::Standard
        },
        load: LoadOptions::default(),
    };
    let report = match run_pipeline(&request).map_err(|e| e.to_string())? {
        PipelineOutcome::Ready(report) => report,
        PipelineOutcome::AwaitingFiles(missing) => {
            return Err(awaiting_message(&missing).to_string())
        }
    };
    let figure = report
        .render(&PlotlyRenderer, &RenderOptions { count_scale })
        .map_err(|e| e.to_string())?;
    let status = format!(
        "{} of {} rows plotted across {} MAP x {} RPM bins.",
        report.stats.kept,
        report.stats.total_rows,
        report.grids.values.row_keys().len(),
        report.grids.values.col_keys().len()
    );
    Ok((figure, status))
}

#[cfg(feature = "chart_plotly")]
fn call_plotly(method: &str, div_id: &str, args: &[JsValue]) {
    let Some(div) = web_sys::window()
        .and_then(|w| w.document())
        .and_then(|d| d.get_element_by_id(div_id))
    else {
        return;
    };
    let plotly = js_sys::Reflect::get(&js_sys::global(), &JsValue::from_str("Plotly"))
        .unwrap_or(JsValue::UNDEFINED);
    if let Ok(func) = js_sys::Reflect::get(&plotly, &JsValue::from_str(method))
        .and_then(|v| v.dyn_into::<js_sys::Function>())
    {
        let call_args = js_sys::Array::new();
        call_args.push(&JsValue::from(div));
        for arg in args {
            call_args.push(arg);
        }
        let _ = func.apply(&plotly, &call_args);
    }
}

#[cfg(feature = "chart_plotly")]
fn draw_plot(div_id: &str, figure: &PlotlyFigure) {
    // Plain JS objects, not ES Maps, so Plotly can read the layout.
    let serializer = serde_wasm_bindgen::Serializer::json_compatible();
    if let (Ok(data), Ok(layout)) = (
        figure.data.serialize(&serializer),
        figure.layout.serialize(&serializer),
    ) {
        call_plotly("react", div_id, &[data, layout]);
    }
}

#[cfg(feature = "chart_plotly")]
fn clear_plot(div_id: &str) {
    call_plotly("purge", div_id, &[]);
}

#[cfg(not(feature = "chart_plotly"))]
fn draw_plot(_div_id: &str, _figure: &PlotlyFigure) {}

#[cfg(not(feature = "chart_plotly"))]
fn clear_plot(_div_id: &str) {}

#[component]
pub fn App() -> impl IntoView {
    let (log_file, set_log_file) = create_signal(Option::<FileBytes>::None);
    let (mapping_file, set_mapping_file) = create_signal(Option::<FileBytes>::None);
    let (use_builtin, set_use_builtin) = create_signal(false);
    let (strict, set_strict) = create_signal(false);
    let (count_scale, set_count_scale) = create_signal(ColorScale::default());
    let (status, set_status) = create_signal(String::from(AWAIT_LOG));

    // Every input change re-runs the whole pipeline on the current bytes.
    create_effect(move |_| {
        let builtin = use_builtin.get();
        let strict_now = strict.get();
        let scale = count_scale.get();
        let result = log_file.with(|log| {
            mapping_file.with(|mapping| {
                evaluate(
                    log.as_ref().map(|f| f.bytes.as_slice()),
                    mapping.as_ref().map(|f| f.bytes.as_slice()),
                    builtin,
                    strict_now,
                    scale,
                )
            })
        });
        match result {
            Ok((figure, message)) => {
                draw_plot(PLOT_DIV, &figure);
                set_status.set(message);
            }
            Err(message) => {
                clear_plot(PLOT_DIV);
                set_status.set(message);
            }
        }
    });

    let on_log = move |ev: ev::Event| {
        if let Some(input) = input_from(&ev) {
            set_status.set("Reading log…".to_string());
            spawn_local(async move {
                let file = read_first_file(&input).await;
                set_log_file.set(file);
            });
        }
    };

    let on_mapping = move |ev: ev::Event| {
        if let Some(input) = input_from(&ev) {
            set_status.set("Reading mapping…".to_string());
            spawn_local(async move {
                let file = read_first_file(&input).await;
                set_mapping_file.set(file);
            });
        }
    };

    let file_names = move || {
        let log = log_file.with(|f| f.as_ref().map(|f| f.name.clone()));
        let mapping = mapping_file.with(|f| f.as_ref().map(|f| f.name.clone()));
        format!(
            "Log: {} • Mapping: {}",
            log.unwrap_or_else(|| "none".into()),
            if use_builtin.get() {
                "built-in".to_string()
            } else {
                mapping.unwrap_or_else(|| "none".into())
            }
        )
    };

    view! {
        <main class="tufte" on:dragover=move |e| { e.prevent_default(); } on:drop=move |e| {
            e.prevent_default();
            if let Ok(de) = e.dyn_into::<web_sys::DragEvent>() {
                if let Some(file) = de.data_transfer().and_then(|dt| dt.files()).and_then(|l| l.item(0)) {
                    spawn_local(async move {
                        let file = read_file(file).await;
                        set_log_file.set(file);
                    });
                }
            }
        }>
            <header>
                <h1>{FIGURE_TITLE}</h1>
                <p class="subtitle">"Upload an engine log CSV to plot average mass air flow and sample counts by manifold pressure and engine speed."</p>
                <p class="note">{"Web version "}{APP_VERSION}</p>
            </header>
            <section class="controls">
                <label class="dropzone">
                    <span>"Engine log CSV (drag & drop or click)"</span>
                    <input id="log_input" type="file" accept=".csv,text/csv" on:change=on_log />
                </label>
                <label class="dropzone">
                    <span>"Column mapping CSV (original,new)"</span>
                    <input id="mapping_input" type="file" accept=".csv,text/csv" on:change=on_mapping disabled=move || use_builtin.get() />
                </label>
                <div class="control-row">
                    <label><input type="checkbox" prop:checked=move || use_builtin.get() on:change=move |ev| {
                        if let Some(inp) = input_from(&ev) { set_use_builtin.set(inp.checked()); }
                    }/>" Use built-in VCDS mapping"</label>
                    <label><input type="checkbox" prop:checked=move || strict.get() on:change=move |ev| {
                        if let Some(inp) = input_from(&ev) { set_strict.set(inp.checked()); }
                    }/>" Require intake temperature, lambda and injection channels"</label>
                </div>
                <div class="control-row">
                    <label class="note">"Sample count colors:"</label>
                    <select on:change=move |ev| {
                        if let Some(t) = ev.target() { if let Ok(sel) = t.dyn_into::<HtmlSelectElement>() { set_count_scale.set(scale_from_name(&sel.value())); }}
                    } prop:value=move || count_scale.get().name().to_string()>
                        <option value="blues">"Blues"</option>
                        <option value="viridis">"Viridis"</option>
                    </select>
                </div>
                <p class="note">{file_names}</p>
                <span class="note">{move || status.get()}</span>
            </section>
            <section class="plots">
                <div id=PLOT_DIV class="plot"></div>
            </section>
            <section class="files">
                <p class="note">"Nothing leaves your device. All processing happens locally in your browser."</p>
            </section>
        </main>
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen::prelude::wasm_bindgen(start)]
pub fn start() {
    console_error_panic_hook::set_once();
    leptos::mount_to_body(|| view! { <App/> });
}
