mod chart;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use maf_map::{
    canonical_rows, filter_rows, normalize, parse_column_mapping, parse_log_table, run_pipeline,
    ColorScale, ColumnMapping, ColumnProfile, GridRenderer, HeatmapReport, LoadOptions, LogTable,
    MappingSource, PipelineOutcome, PipelineRequest, PlotlyRenderer, RenderOptions,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::chart::{ChartKind, StaticRenderer};

#[derive(Parser, Debug)]
#[command(author, version, about = "MAF heatmaps by manifold pressure and engine speed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render average MAF and sample-count heatmaps for an engine log CSV
    Heatmap(HeatmapArgs),
    /// Report the columns of a log CSV as seen after column mapping
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct HeatmapArgs {
    /// Engine log CSV
    #[arg(value_hint = ValueHint::FilePath)]
    log: PathBuf,

    /// Column mapping CSV (`original,new`); the built-in VCDS table is used otherwise
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    mapping: Option<PathBuf>,

    /// Required column set
    #[arg(long, value_enum, default_value_t = ProfileOpt::Standard)]
    profile: ProfileOpt,

    /// Output PNG path (defaults to `<log stem>_heatmap.png` when no output is given)
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Output SVG path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Output interactive HTML (Plotly) path
    #[arg(long, value_hint = ValueHint::FilePath)]
    html: Option<PathBuf>,

    /// Color scale of the sample-count panel
    #[arg(long, value_enum, default_value_t = ScaleOpt::Blues)]
    count_scale: ScaleOpt,

    /// Field delimiter of both CSV files
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Image width in pixels
    #[arg(long, default_value_t = 1600)]
    width: u32,

    /// Image height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Engine log CSV
    #[arg(value_hint = ValueHint::FilePath)]
    log: PathBuf,

    /// Column mapping CSV (`original,new`); the built-in VCDS table is used otherwise
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    mapping: Option<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Field delimiter of both CSV files
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ProfileOpt {
    Standard,
    Strict,
}

impl From<ProfileOpt> for ColumnProfile {
    fn from(value: ProfileOpt) -> Self {
        match value {
            ProfileOpt::Standard => ColumnProfile::Standard,
            ProfileOpt::Strict => ColumnProfile::Strict,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ScaleOpt {
    Blues,
    Viridis,
}

impl From<ScaleOpt> for ColorScale {
    fn from(value: ScaleOpt) -> Self {
        match value {
            ScaleOpt::Blues => ColorScale::Blues,
            ScaleOpt::Viridis => ColorScale::Viridis,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Heatmap(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Heatmap(args) => handle_heatmap(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum OutputTarget {
    Image(PathBuf, ChartKind),
    Html(PathBuf),
}

fn output_targets(args: &HeatmapArgs) -> Vec<OutputTarget> {
    let mut targets = Vec::new();
    if let Some(path) = &args.png {
        targets.push(OutputTarget::Image(path.clone(), ChartKind::Png));
    }
    if let Some(path) = &args.svg {
        targets.push(OutputTarget::Image(path.clone(), ChartKind::Svg));
    }
    if let Some(path) = &args.html {
        targets.push(OutputTarget::Html(path.clone()));
    }
    if targets.is_empty() {
        targets.push(OutputTarget::Image(default_png_path(&args.log), ChartKind::Png));
    }
    targets
}

fn default_png_path(log: &Path) -> PathBuf {
    let stem = log
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string());
    log.with_file_name(format!("{stem}_heatmap.png"))
}

fn delimiter_byte(delimiter: char) -> Result<u8> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        Err(anyhow!("delimiter must be a single ASCII character, got {delimiter:?}"))
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn handle_heatmap(args: HeatmapArgs) -> Result<()> {
    let load = LoadOptions {
        delimiter: delimiter_byte(args.delimiter)?,
    };
    let log = read_input(&args.log)?;
    let mapping = args.mapping.as_deref().map(read_input).transpose()?;

    let request = PipelineRequest {
        log_csv: Some(log.as_slice()),
        mapping: match &mapping {
            Some(bytes) => MappingSource::Upload(Some(bytes.as_slice())),
            None => MappingSource::BuiltIn,
        },
        profile: args.profile.into(),
        load,
    };
    let report = match run_pipeline(&request)? {
        PipelineOutcome::Ready(report) => report,
        PipelineOutcome::AwaitingFiles(missing) => {
            bail!("missing input: {missing:?}")
        }
    };
    log_report(&report);

    let options = RenderOptions {
        count_scale: args.count_scale.into(),
    };
    for target in output_targets(&args) {
        match target {
            OutputTarget::Image(path, kind) => {
                let renderer = StaticRenderer::new(&path, kind, (args.width, args.height));
                report
                    .render(&renderer, &options)
                    .with_context(|| format!("failed to render {}", path.display()))?;
                info!("Heatmap written: {}", renderer.path().display());
            }
            OutputTarget::Html(path) => {
                let figure = report.figure(&options);
                let html = PlotlyRenderer.render(&figure)?.to_html(&figure.title)?;
                fs::write(&path, html)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!("Interactive heatmap written: {}", path.display());
            }
        }
    }
    Ok(())
}

fn log_report(report: &HeatmapReport) {
    let stats = &report.stats;
    info!(
        "Rows: {} read, {} kept ({} with missing values, {} non-positive, {} out of range dropped)",
        stats.total_rows,
        stats.kept,
        stats.dropped_missing,
        stats.dropped_nonpositive,
        stats.dropped_out_of_range
    );
    let share = stats.kept as f64 / stats.total_rows.max(1) as f64;
    if share < 0.5 {
        warn!("Only {:.0}% of rows are usable", share * 100.0);
    }
    debug!(
        map_bins = ?report.grids.values.row_keys(),
        rpm_bins = ?report.grids.values.col_keys(),
        "grid axes"
    );
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let load = LoadOptions {
        delimiter: delimiter_byte(args.delimiter)?,
    };
    let log = read_input(&args.log)?;
    let table = parse_log_table(&log, &load)
        .with_context(|| format!("failed to load {}", args.log.display()))?;
    let mapping = match &args.mapping {
        Some(path) => parse_column_mapping(&read_input(path)?, &load)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ColumnMapping::builtin(),
    };

    let mut report = format!(
        "# generated {}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    report.push_str(&inspect_report(&args.log, table, &mapping));

    if args.output.as_os_str() == "-" {
        let mut stdout = io::stdout().lock();
        stdout.write_all(report.as_bytes())?;
        stdout.flush()?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Column report written: {}", args.output.display());
    }
    Ok(())
}

#[derive(Default, Clone)]
struct ColumnStats {
    present: usize,
    numeric: usize,
    min: Option<f64>,
    max: Option<f64>,
}

fn column_stats(table: &LogTable, index: usize) -> ColumnStats {
    let mut stats = ColumnStats::default();
    for cell in table.column(index) {
        if cell.is_missing() {
            continue;
        }
        stats.present += 1;
        if let Some(val) = cell.as_f64() {
            stats.numeric += 1;
            stats.min = Some(stats.min.map_or(val, |m| m.min(val)));
            stats.max = Some(stats.max.map_or(val, |m| m.max(val)));
        }
    }
    stats
}

fn inspect_report(path: &Path, table: LogTable, mapping: &ColumnMapping) -> String {
    let fmt_opt = |v: Option<f64>| v.map_or("n/a".into(), |v| format!("{:.3}", v));
    let mut report = String::new();
    report.push_str(&format!("FILE: {}\n", path.display()));
    report.push_str(&format!("  rows: {}\n", table.len()));

    let mut canonical_names: BTreeMap<String, usize> = BTreeMap::new();
    report.push_str("  columns:\n");
    for (index, original) in table.headers().iter().enumerate() {
        let canonical = mapping.apply(original);
        *canonical_names.entry(canonical.to_string()).or_insert(0) += 1;
        let stats = column_stats(&table, index);
        let name = if canonical == original.as_str() {
            original.clone()
        } else {
            format!("{original} -> {canonical}")
        };
        report.push_str(&format!(
            "    - {}: present={}, numeric={}, min={}, max={}\n",
            name,
            stats.present,
            stats.numeric,
            fmt_opt(stats.min),
            fmt_opt(stats.max)
        ));
    }

    for profile in [ColumnProfile::Standard, ColumnProfile::Strict] {
        let missing: Vec<&str> = profile
            .required_columns()
            .iter()
            .copied()
            .filter(|name| !canonical_names.contains_key(*name))
            .collect();
        let label = match profile {
            ColumnProfile::Standard => "missing_standard",
            ColumnProfile::Strict => "missing_strict",
        };
        let listed = if missing.is_empty() {
            "none".to_string()
        } else {
            missing.join(", ")
        };
        report.push_str(&format!("  {label}: {listed}\n"));
    }

    let duplicates: Vec<&str> = canonical_names
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(name, _)| name.as_str())
        .collect();
    if !duplicates.is_empty() {
        report.push_str(&format!("  duplicate_columns: {}\n", duplicates.join(", ")));
    }

    if let Ok(canonical) = normalize(table, mapping, ColumnProfile::Standard) {
        let (_, stats) = filter_rows(&canonical_rows(&canonical));
        report.push_str(&format!(
            "  usable_rows: {} of {} (missing={}, non_positive={}, out_of_range={})\n",
            stats.kept,
            stats.total_rows,
            stats.dropped_missing,
            stats.dropped_nonpositive,
            stats.dropped_out_of_range
        ));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heatmap_args(extra: &[&str]) -> HeatmapArgs {
        let mut argv = vec!["maf-map", "heatmap", "logs/drive.csv"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Heatmap(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_default_output_is_png_next_to_log() {
        let args = heatmap_args(&[]);
        assert_eq!(
            output_targets(&args),
            vec![OutputTarget::Image(
                PathBuf::from("logs/drive_heatmap.png"),
                ChartKind::Png
            )]
        );
        assert!(matches!(args.profile, ProfileOpt::Standard));
        assert!(matches!(args.count_scale, ScaleOpt::Blues));
    }

    #[test]
    fn test_explicit_outputs_replace_default() {
        let args = heatmap_args(&["--svg", "a.svg", "--html", "a.html", "--count-scale", "viridis"]);
        assert_eq!(
            output_targets(&args),
            vec![
                OutputTarget::Image(PathBuf::from("a.svg"), ChartKind::Svg),
                OutputTarget::Html(PathBuf::from("a.html")),
            ]
        );
        assert_eq!(ColorScale::from(args.count_scale), ColorScale::Viridis);
    }

    #[test]
    fn test_profile_flag_maps_to_core() {
        let args = heatmap_args(&["--profile", "strict"]);
        assert_eq!(ColumnProfile::from(args.profile), ColumnProfile::Strict);
    }

    #[test]
    fn test_delimiter_must_be_ascii() {
        assert_eq!(delimiter_byte(';').unwrap(), b';');
        assert_eq!(delimiter_byte('\t').unwrap(), b'\t');
        assert!(delimiter_byte('§').is_err());
    }

    #[test]
    fn test_inspect_report_lists_mapping_and_gaps() {
        let log = b"General: Engine speed (G28),MAP_mbar,MAF_gps,Note\n\
                    1200,1000,5.0,ok\n\
                    2600,1100,NA,\n\
                    800,0,2.5,x\n";
        let table = parse_log_table(log, &LoadOptions::default()).unwrap();
        let report = inspect_report(Path::new("drive.csv"), table, &ColumnMapping::builtin());

        assert!(report.contains("FILE: drive.csv\n"));
        assert!(report.contains("  rows: 3\n"));
        assert!(report.contains(
            "    - General: Engine speed (G28) -> RPM: present=3, numeric=3, min=800.000, max=2600.000\n"
        ));
        assert!(report.contains("    - MAF_gps: present=2, numeric=2, min=2.500, max=5.000\n"));
        assert!(report.contains("    - Note: present=2, numeric=0, min=n/a, max=n/a\n"));
        assert!(report.contains("  missing_standard: none\n"));
        assert!(report.contains("  missing_strict: IAT_C, AFR_specified, Injector_PW_ms\n"));
        assert!(report.contains("  usable_rows: 1 of 3 (missing=1, non_positive=1, out_of_range=0)\n"));
        assert!(!report.contains("duplicate_columns"));
    }

    #[test]
    fn test_inspect_report_without_required_columns() {
        let table = parse_log_table(b"a,a\n1,2\n", &LoadOptions::default()).unwrap();
        let report = inspect_report(Path::new("x.csv"), table, &ColumnMapping::default());
        assert!(report.contains("  missing_standard: MAP_mbar, RPM, MAF_gps\n"));
        assert!(report.contains("  duplicate_columns: a\n"));
        assert!(!report.contains("usable_rows"));
    }
}
