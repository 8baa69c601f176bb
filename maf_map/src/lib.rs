//! Engine-log MAF heatmaps: load a log CSV, map its columns onto the
//! canonical channel names, bin manifold pressure and engine speed, and
//! aggregate mass air flow into paired mean/count grids ready for rendering.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod aggregate;
pub mod figure;
pub mod mapping;
pub mod plotly;
pub mod table;

pub use aggregate::{
    aggregate, bin_floor, canonical_rows, filter_rows, AggregateGrids, BucketedRow, CanonicalRow,
    FilterStats, Grid, MAP_BIN_WIDTH, RPM_BIN_WIDTH,
};
pub use figure::{
    ColorScale, GridRenderer, HeatmapFigure, HeatmapPanel, LabelFormat, RenderOptions, Rgb,
};
pub use mapping::{
    normalize, CanonicalTable, ColumnMapping, ColumnProfile, MappingSource, AFR_SPECIFIED, IAT_C,
    INJECTOR_PW_MS, MAF_GPS, MANDATORY_COLUMNS, MAP_MBAR, RPM, STFT_PERCENT,
};
pub use plotly::{PlotlyFigure, PlotlyRenderer};
pub use table::{parse_column_mapping, parse_log_table, Cell, LoadOptions, LogTable};

#[derive(Error, Debug)]
pub enum MapError {
    #[error("failed to parse {input}: {message}")]
    Parse { input: InputKind, message: String },
    #[error("mapping file must have 'original' and 'new' columns (found: {})", .found.join(", "))]
    MappingHeader { found: Vec<String> },
    #[error("missing required columns after mapping: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("no usable rows after filtering ({total_rows} rows read)")]
    NoData { total_rows: usize },
    #[error("render failed: {0}")]
    Render(String),
}

/// The uploaded files the pipeline consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    Log,
    Mapping,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Log => f.write_str("log file"),
            InputKind::Mapping => f.write_str("mapping file"),
        }
    }
}

/// Linear stages of one pipeline invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    AwaitingFiles,
    Loaded,
    Validated,
    Aggregated,
    Rendered,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::AwaitingFiles => "awaiting-files",
            PipelineStage::Loaded => "loaded",
            PipelineStage::Validated => "validated",
            PipelineStage::Aggregated => "aggregated",
            PipelineStage::Rendered => "rendered",
        };
        f.write_str(name)
    }
}

/// Everything one invocation needs. Nothing is retained between calls.
#[derive(Clone, Debug)]
pub struct PipelineRequest<'a> {
    pub log_csv: Option<&'a [u8]>,
    pub mapping: MappingSource<'a>,
    pub profile: ColumnProfile,
    pub load: LoadOptions,
}

impl<'a> PipelineRequest<'a> {
    /// Request using the built-in mapping and the standard column profile.
    pub fn new(log_csv: &'a [u8]) -> Self {
        Self {
            log_csv: Some(log_csv),
            mapping: MappingSource::BuiltIn,
            profile: ColumnProfile::Standard,
            load: LoadOptions::default(),
        }
    }

    pub fn with_mapping(mut self, mapping: MappingSource<'a>) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_profile(mut self, profile: ColumnProfile) -> Self {
        self.profile = profile;
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HeatmapReport {
    pub grids: AggregateGrids,
    pub stats: FilterStats,
    /// Log headers after renaming, in file order.
    pub columns: Vec<String>,
}

impl HeatmapReport {
    pub fn figure(&self, options: &RenderOptions) -> HeatmapFigure {
        HeatmapFigure::from_grids(&self.grids, options)
    }

    /// Build the figure and hand it to a rendering backend.
    pub fn render<R: GridRenderer>(
        &self,
        renderer: &R,
        options: &RenderOptions,
    ) -> Result<R::Output, MapError> {
        let output = renderer.render(&self.figure(options))?;
        debug!(stage = %PipelineStage::Rendered, "figure rendered");
        Ok(output)
    }
}

#[derive(Clone, Debug)]
pub enum PipelineOutcome {
    /// Required uploads are not there yet. Not a failure.
    AwaitingFiles(Vec<InputKind>),
    Ready(HeatmapReport),
}

/// Run load → normalize → filter → aggregate on the request's bytes.
pub fn run_pipeline(request: &PipelineRequest<'_>) -> Result<PipelineOutcome, MapError> {
    debug!(stage = %PipelineStage::Idle, "pipeline invoked");
    let mut missing = Vec::new();
    if request.log_csv.is_none() {
        missing.push(InputKind::Log);
    }
    if request.mapping.is_awaiting_upload() {
        missing.push(InputKind::Mapping);
    }
    // Nothing is parsed until every input is present.
    let log_csv = match request.log_csv {
        Some(log_csv) if missing.is_empty() => log_csv,
        _ => {
            debug!(stage = %PipelineStage::AwaitingFiles, ?missing, "waiting for uploads");
            return Ok(PipelineOutcome::AwaitingFiles(missing));
        }
    };
    let Some(mapping) = request.mapping.resolve(&request.load)? else {
        return Ok(PipelineOutcome::AwaitingFiles(vec![InputKind::Mapping]));
    };

    let table = parse_log_table(log_csv, &request.load)?;
    debug!(
        stage = %PipelineStage::Loaded,
        rows = table.len(),
        columns = table.headers().len(),
        mapped = mapping.len(),
        "log table loaded"
    );

    let canonical = normalize(table, &mapping, request.profile)?;
    debug!(stage = %PipelineStage::Validated, profile = ?request.profile, "columns validated");

    let rows = canonical_rows(&canonical);
    let (kept, stats) = filter_rows(&rows);
    debug!(
        total = stats.total_rows,
        dropped_missing = stats.dropped_missing,
        dropped_nonpositive = stats.dropped_nonpositive,
        dropped_out_of_range = stats.dropped_out_of_range,
        kept = stats.kept,
        "rows filtered"
    );
    if kept.is_empty() {
        return Err(MapError::NoData {
            total_rows: stats.total_rows,
        });
    }

    let bucketed: Vec<BucketedRow> = kept.iter().filter_map(BucketedRow::from_row).collect();
    let grids = aggregate(&bucketed);
    debug!(
        stage = %PipelineStage::Aggregated,
        map_bins = grids.values.row_keys().len(),
        rpm_bins = grids.values.col_keys().len(),
        "grids aggregated"
    );

    Ok(PipelineOutcome::Ready(HeatmapReport {
        grids,
        stats,
        columns: canonical.table().headers().to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(outcome: PipelineOutcome) -> HeatmapReport {
        match outcome {
            PipelineOutcome::Ready(report) => report,
            PipelineOutcome::AwaitingFiles(missing) => panic!("still awaiting {missing:?}"),
        }
    }

    const CANONICAL_LOG: &[u8] = b"MAP_mbar,RPM,MAF_gps\n1000,1200,5.0\n1030,1400,7.0\n1000,1200,3.0\n";

    #[test]
    fn test_single_cell_scenario() {
        let mapping: &[u8] = b"original,new\n";
        let request = PipelineRequest::new(CANONICAL_LOG)
            .with_mapping(MappingSource::Upload(Some(mapping)));
        let report = ready(run_pipeline(&request).unwrap());

        assert_eq!(report.grids.values.row_keys(), &[1000]);
        assert_eq!(report.grids.values.col_keys(), &[1000]);
        assert_eq!(report.grids.values.get(1000, 1000), Some(5.0));
        assert_eq!(report.grids.counts.get(1000, 1000), Some(3));
        assert_eq!(report.stats.kept, 3);
    }

    #[test]
    fn test_zero_maf_row_excluded() {
        let log = b"MAP_mbar,RPM,MAF_gps\n1000,1200,5.0\n1500,3000,0\n";
        let report = ready(run_pipeline(&PipelineRequest::new(log)).unwrap());

        assert_eq!(report.grids.values.row_keys(), &[1000]);
        assert_eq!(report.grids.counts.row_keys(), &[1000]);
        assert_eq!(report.grids.counts.get(1500, 3000), None);
        assert_eq!(report.stats.dropped_nonpositive, 1);
    }

    #[test]
    fn test_incomplete_mapping_names_missing_channel() {
        let log = b"SensorA,SensorB,SensorC\n1000,1200,5.0\n";
        let mapping: &[u8] = b"original,new\nSensorA,MAP_mbar\nSensorB,RPM\n";
        let request =
            PipelineRequest::new(log).with_mapping(MappingSource::Upload(Some(mapping)));

        match run_pipeline(&request) {
            Err(MapError::MissingColumns(missing)) => assert_eq!(missing, vec!["MAF_gps"]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_builtin_mapping_renames_vcds_headers() {
        let log = "General: Intake manifold pressure (G71),General: Engine speed (G28),\
                   Emission reduction (secondary air injection: Mass air flow sensor (G70)\n\
                   1012,2510,9.5\n1049,2990,10.5\n"
            .as_bytes();
        let report = ready(run_pipeline(&PipelineRequest::new(log)).unwrap());

        assert_eq!(report.columns, vec!["MAP_mbar", "RPM", "MAF_gps"]);
        assert_eq!(report.grids.values.get(1000, 2500), Some(10.0));
        assert_eq!(report.grids.counts.get(1000, 2500), Some(2));
    }

    #[test]
    fn test_awaiting_files_is_not_an_error() {
        let request = PipelineRequest {
            log_csv: None,
            mapping: MappingSource::Upload(None),
            profile: ColumnProfile::Standard,
            load: LoadOptions::default(),
        };
        match run_pipeline(&request).unwrap() {
            PipelineOutcome::AwaitingFiles(missing) => {
                assert_eq!(missing, vec![InputKind::Log, InputKind::Mapping])
            }
            PipelineOutcome::Ready(_) => panic!("nothing was uploaded"),
        }

        let request = PipelineRequest {
            log_csv: None,
            ..PipelineRequest::new(b"")
        };
        match run_pipeline(&request).unwrap() {
            PipelineOutcome::AwaitingFiles(missing) => assert_eq!(missing, vec![InputKind::Log]),
            PipelineOutcome::Ready(_) => panic!("log was not uploaded"),
        }
    }

    #[test]
    fn test_mapping_not_parsed_while_log_is_missing() {
        let malformed: &[u8] = b"from,to\nSensorA,MAP_mbar\n";
        let request = PipelineRequest {
            log_csv: None,
            ..PipelineRequest::new(b"").with_mapping(MappingSource::Upload(Some(malformed)))
        };
        match run_pipeline(&request) {
            Ok(PipelineOutcome::AwaitingFiles(missing)) => assert_eq!(missing, vec![InputKind::Log]),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let with_log = PipelineRequest::new(CANONICAL_LOG)
            .with_mapping(MappingSource::Upload(Some(malformed)));
        assert!(matches!(
            run_pipeline(&with_log),
            Err(MapError::MappingHeader { .. })
        ));
    }

    #[test]
    fn test_unbinnable_reading_is_dropped() {
        let log = b"MAP_mbar,RPM,MAF_gps\n1000,1200,5.0\n1000,1e20,4.0\n";
        let report = ready(run_pipeline(&PipelineRequest::new(log)).unwrap());
        assert_eq!(report.grids.counts.col_keys(), &[1000]);
        assert_eq!(report.grids.counts.get(1000, 1000), Some(1));
        assert_eq!(report.stats.dropped_out_of_range, 1);
        assert_eq!(report.stats.kept, 1);
    }

    #[test]
    fn test_no_surviving_rows_is_reported() {
        let log = b"MAP_mbar,RPM,MAF_gps\n0,1200,5.0\n1000,,3.0\n";
        match run_pipeline(&PipelineRequest::new(log)) {
            Err(MapError::NoData { total_rows }) => assert_eq!(total_rows, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_log_halts() {
        let log = b"MAP_mbar,RPM\n1000,1200,5.0,extra\n";
        match run_pipeline(&PipelineRequest::new(log)) {
            Err(MapError::Parse { input, .. }) => assert_eq!(input, InputKind::Log),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_strict_profile_requires_optional_channels() {
        let request = PipelineRequest::new(CANONICAL_LOG).with_profile(ColumnProfile::Strict);
        match run_pipeline(&request) {
            Err(MapError::MissingColumns(missing)) => {
                assert_eq!(missing, vec!["IAT_C", "AFR_specified", "Injector_PW_ms"])
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_report_renders_through_backend() {
        let report = ready(run_pipeline(&PipelineRequest::new(CANONICAL_LOG)).unwrap());
        let figure = report
            .render(&PlotlyRenderer, &RenderOptions::default())
            .unwrap();
        assert_eq!(figure.data.as_array().map(|traces| traces.len()), Some(2));
    }

    #[test]
    fn test_missing_columns_message_lists_names() {
        let err = MapError::MissingColumns(vec!["RPM".into(), "MAF_gps".into()]);
        assert_eq!(
            err.to_string(),
            "missing required columns after mapping: RPM, MAF_gps"
        );
    }
}
