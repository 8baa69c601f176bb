//! Row filtering, MAP/RPM bucketing and the mean/count grid aggregation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::mapping::CanonicalTable;

pub const RPM_BIN_WIDTH: i64 = 500;
pub const MAP_BIN_WIDTH: i64 = 50;

/// Lower edge of the fixed-width bucket holding `value`, or `None` when the
/// edge does not fit an `i64`.
pub fn bin_floor(value: f64, width: i64) -> Option<i64> {
    let edge = (value / width as f64).floor() * width as f64;
    // `i64::MAX as f64` rounds up to 2^63, so the upper bound is exclusive.
    if edge.is_finite() && edge >= i64::MIN as f64 && edge < i64::MAX as f64 {
        Some(edge as i64)
    } else {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub map_mbar: Option<f64>,
    pub rpm: Option<f64>,
    pub maf_gps: Option<f64>,
    /// Every profile-required extra channel has a value on this row.
    pub extras_present: bool,
}

impl CanonicalRow {
    pub fn new(map_mbar: Option<f64>, rpm: Option<f64>, maf_gps: Option<f64>) -> Self {
        Self {
            map_mbar,
            rpm,
            maf_gps,
            extras_present: true,
        }
    }

    fn has_missing(&self) -> bool {
        self.map_mbar.is_none()
            || self.rpm.is_none()
            || self.maf_gps.is_none()
            || !self.extras_present
    }

    fn has_nonpositive(&self) -> bool {
        [self.map_mbar, self.rpm, self.maf_gps]
            .iter()
            .flatten()
            .any(|v| *v <= 0.0)
    }

    fn has_out_of_range(&self) -> bool {
        let unbinnable =
            |value: Option<f64>, width: i64| value.is_some_and(|v| bin_floor(v, width).is_none());
        unbinnable(self.map_mbar, MAP_BIN_WIDTH) || unbinnable(self.rpm, RPM_BIN_WIDTH)
    }

    pub fn is_valid(&self) -> bool {
        !self.has_missing() && !self.has_nonpositive() && !self.has_out_of_range()
    }
}

/// Text cells in the aggregated channels read as missing.
pub fn canonical_rows(table: &CanonicalTable) -> Vec<CanonicalRow> {
    let channels = table.channels();
    table
        .table()
        .rows()
        .iter()
        .map(|row| CanonicalRow {
            map_mbar: row[channels.map_mbar].as_f64(),
            rpm: row[channels.rpm].as_f64(),
            maf_gps: row[channels.maf_gps].as_f64(),
            extras_present: channels.extras.iter().all(|&idx| !row[idx].is_missing()),
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub total_rows: usize,
    pub dropped_missing: usize,
    pub dropped_nonpositive: usize,
    /// MAP or RPM readings too large to place in a bin.
    pub dropped_out_of_range: usize,
    pub kept: usize,
}

/// Drop rows with missing values, then rows with a non-positive reading,
/// then rows whose MAP or RPM cannot be binned.
pub fn filter_rows(rows: &[CanonicalRow]) -> (Vec<CanonicalRow>, FilterStats) {
    let mut stats = FilterStats {
        total_rows: rows.len(),
        ..FilterStats::default()
    };
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        if row.has_missing() {
            stats.dropped_missing += 1;
        } else if row.has_nonpositive() {
            stats.dropped_nonpositive += 1;
        } else if row.has_out_of_range() {
            stats.dropped_out_of_range += 1;
        } else {
            kept.push(*row);
        }
    }
    stats.kept = kept.len();
    (kept, stats)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketedRow {
    pub map_mbar: f64,
    pub rpm: f64,
    pub maf_gps: f64,
    pub map_bin: i64,
    pub rpm_bin: i64,
}

impl BucketedRow {
    /// `None` if any of the three channels is missing or MAP/RPM cannot be binned.
    pub fn from_row(row: &CanonicalRow) -> Option<Self> {
        let (map_mbar, rpm, maf_gps) = (row.map_mbar?, row.rpm?, row.maf_gps?);
        Some(Self {
            map_mbar,
            rpm,
            maf_gps,
            map_bin: bin_floor(map_mbar, MAP_BIN_WIDTH)?,
            rpm_bin: bin_floor(rpm, RPM_BIN_WIDTH)?,
        })
    }
}

/// Cells keyed by (MAP bin row, RPM bin column). Rows run from the highest
/// MAP bin down, columns from the lowest RPM bin up. Only observed bins
/// appear; unobserved combinations are `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grid<T> {
    row_keys: Vec<i64>,
    col_keys: Vec<i64>,
    cells: Vec<Vec<Option<T>>>,
}

impl<T: Copy> Grid<T> {
    pub fn row_keys(&self) -> &[i64] {
        &self.row_keys
    }

    pub fn col_keys(&self) -> &[i64] {
        &self.col_keys
    }

    pub fn cells(&self) -> &[Vec<Option<T>>] {
        &self.cells
    }

    pub fn is_empty(&self) -> bool {
        self.row_keys.is_empty() || self.col_keys.is_empty()
    }

    pub fn get(&self, map_bin: i64, rpm_bin: i64) -> Option<T> {
        let row = self.row_keys.iter().position(|&k| k == map_bin)?;
        let col = self.col_keys.iter().position(|&k| k == rpm_bin)?;
        self.cells[row][col]
    }

    /// Present cells as `(map_bin, rpm_bin, value)`.
    pub fn iter_present(&self) -> impl Iterator<Item = (i64, i64, T)> + '_ {
        self.cells.iter().enumerate().flat_map(move |(r, row)| {
            row.iter().enumerate().filter_map(move |(c, cell)| {
                cell.map(|value| (self.row_keys[r], self.col_keys[c], value))
            })
        })
    }

    pub fn map<U, F: Fn(T) -> U>(&self, f: F) -> Grid<U> {
        Grid {
            row_keys: self.row_keys.clone(),
            col_keys: self.col_keys.clone(),
            cells: self
                .cells
                .iter()
                .map(|row| row.iter().map(|cell| cell.map(&f)).collect())
                .collect(),
        }
    }
}

/// Mean MAF and sample count over the same axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateGrids {
    pub values: Grid<f64>,
    pub counts: Grid<u64>,
}

impl AggregateGrids {
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Clone, Copy, Default)]
struct CellAccumulator {
    sum: f64,
    count: u64,
}

pub fn aggregate(rows: &[BucketedRow]) -> AggregateGrids {
    let mut acc: BTreeMap<(i64, i64), CellAccumulator> = BTreeMap::new();
    let mut map_bins = BTreeSet::new();
    let mut rpm_bins = BTreeSet::new();
    for row in rows {
        let cell = acc.entry((row.map_bin, row.rpm_bin)).or_default();
        cell.sum += row.maf_gps;
        cell.count += 1;
        map_bins.insert(row.map_bin);
        rpm_bins.insert(row.rpm_bin);
    }

    let row_keys: Vec<i64> = map_bins.into_iter().rev().collect();
    let col_keys: Vec<i64> = rpm_bins.into_iter().collect();
    let counts_cells: Vec<Vec<Option<u64>>> = row_keys
        .iter()
        .map(|map_bin| {
            col_keys
                .iter()
                .map(|rpm_bin| acc.get(&(*map_bin, *rpm_bin)).map(|c| c.count))
                .collect()
        })
        .collect();
    let mean_cells: Vec<Vec<Option<f64>>> = row_keys
        .iter()
        .map(|map_bin| {
            col_keys
                .iter()
                .map(|rpm_bin| {
                    acc.get(&(*map_bin, *rpm_bin))
                        .map(|c| c.sum / c.count as f64)
                })
                .collect()
        })
        .collect();

    AggregateGrids {
        values: Grid {
            row_keys: row_keys.clone(),
            col_keys: col_keys.clone(),
            cells: mean_cells,
        },
        counts: Grid {
            row_keys,
            col_keys,
            cells: counts_cells,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(map: f64, rpm: f64, maf: f64) -> CanonicalRow {
        CanonicalRow::new(Some(map), Some(rpm), Some(maf))
    }

    fn bucket_all(rows: &[CanonicalRow]) -> Vec<BucketedRow> {
        rows.iter().filter_map(BucketedRow::from_row).collect()
    }

    #[test]
    fn test_bin_floor_boundaries() {
        assert_eq!(bin_floor(1499.0, RPM_BIN_WIDTH), Some(1000));
        assert_eq!(bin_floor(1500.0, RPM_BIN_WIDTH), Some(1500));
        assert_eq!(bin_floor(1000.0, RPM_BIN_WIDTH), Some(1000));
        assert_eq!(bin_floor(999.0, MAP_BIN_WIDTH), Some(950));
        assert_eq!(bin_floor(1030.0, MAP_BIN_WIDTH), Some(1000));
        assert_eq!(bin_floor(49.9, MAP_BIN_WIDTH), Some(0));
    }

    #[test]
    fn test_huge_readings_cannot_be_binned() {
        assert_eq!(bin_floor(1e20, RPM_BIN_WIDTH), None);
        assert_eq!(bin_floor(9.3e18, MAP_BIN_WIDTH), None);
        assert_eq!(bin_floor(f64::INFINITY, RPM_BIN_WIDTH), None);
        assert_eq!(bin_floor(1e15, RPM_BIN_WIDTH), Some(1_000_000_000_000_000));

        let huge_rpm = row(1000.0, 1e20, 4.0);
        assert!(!huge_rpm.is_valid());
        assert_eq!(BucketedRow::from_row(&huge_rpm), None);

        let (kept, stats) = filter_rows(&[row(1000.0, 1200.0, 5.0), huge_rpm]);
        assert_eq!(kept, vec![row(1000.0, 1200.0, 5.0)]);
        assert_eq!(stats.dropped_out_of_range, 1);
        assert_eq!(stats.dropped_nonpositive, 0);
        assert_eq!(stats.kept, 1);
    }

    #[test]
    fn test_filter_drops_missing_and_nonpositive() {
        let mut no_extras = row(1000.0, 2000.0, 5.0);
        no_extras.extras_present = false;
        let rows = vec![
            row(1000.0, 2000.0, 5.0),
            CanonicalRow::new(None, Some(2000.0), Some(5.0)),
            row(0.0, 2000.0, 5.0),
            row(1000.0, -1.0, 5.0),
            row(1000.0, 2000.0, 0.0),
            no_extras,
        ];
        let (kept, stats) = filter_rows(&rows);
        assert_eq!(kept, vec![row(1000.0, 2000.0, 5.0)]);
        assert_eq!(
            stats,
            FilterStats {
                total_rows: 6,
                dropped_missing: 2,
                dropped_nonpositive: 3,
                dropped_out_of_range: 0,
                kept: 1,
            }
        );
        assert!(kept.iter().all(CanonicalRow::is_valid));
    }

    #[test]
    fn test_filter_is_idempotent() {
        let rows = vec![
            row(1000.0, 2000.0, 5.0),
            row(980.0, 900.0, -2.0),
            CanonicalRow::new(Some(1010.0), None, Some(3.0)),
            row(1200.0, 3100.0, 12.5),
        ];
        let (once, _) = filter_rows(&rows);
        let (twice, stats) = filter_rows(&once);
        assert_eq!(once, twice);
        assert_eq!(stats.kept, stats.total_rows);
    }

    #[test]
    fn test_counts_and_means_match_rows() {
        let rows = vec![
            row(1000.0, 1200.0, 5.0),
            row(1030.0, 1400.0, 7.0),
            row(1000.0, 1200.0, 3.0),
            row(1060.0, 2600.0, 11.0),
            row(960.0, 2600.0, 4.0),
            row(1099.0, 2999.0, 13.0),
        ];
        let grids = aggregate(&bucket_all(&rows));

        assert_eq!(grids.values.get(1000, 1000), Some(5.0));
        assert_eq!(grids.counts.get(1000, 1000), Some(3));
        assert_eq!(grids.values.get(1050, 2500), Some(12.0));
        assert_eq!(grids.counts.get(1050, 2500), Some(2));
        assert_eq!(grids.counts.get(950, 2500), Some(1));
        assert_eq!(grids.counts.get(950, 1000), None);
        assert_eq!(grids.values.get(950, 1000), None);

        let total: u64 = grids.counts.iter_present().map(|(_, _, n)| n).sum();
        assert_eq!(total, rows.len() as u64);
    }

    #[test]
    fn test_axes_identical_and_ordered() {
        let rows = vec![
            row(900.0, 3100.0, 1.0),
            row(1200.0, 800.0, 2.0),
            row(1000.0, 1900.0, 3.0),
        ];
        let grids = aggregate(&bucket_all(&rows));
        assert_eq!(grids.values.row_keys(), grids.counts.row_keys());
        assert_eq!(grids.values.col_keys(), grids.counts.col_keys());
        assert_eq!(grids.values.row_keys(), &[1200, 1000, 900]);
        assert_eq!(grids.values.col_keys(), &[500, 1500, 3000]);

        let present_values: Vec<(i64, i64)> =
            grids.values.iter_present().map(|(r, c, _)| (r, c)).collect();
        let present_counts: Vec<(i64, i64)> =
            grids.counts.iter_present().map(|(r, c, _)| (r, c)).collect();
        assert_eq!(present_values, present_counts);
    }

    #[test]
    fn test_no_gap_filling_between_observed_bins() {
        let grids = aggregate(&bucket_all(&[row(1000.0, 1000.0, 1.0), row(1000.0, 4000.0, 1.0)]));
        assert_eq!(grids.counts.col_keys(), &[1000, 4000]);
    }

    #[test]
    fn test_empty_input_gives_empty_grids() {
        let grids = aggregate(&[]);
        assert!(grids.is_empty());
        assert!(grids.values.is_empty());
        assert_eq!(grids.counts.iter_present().count(), 0);
    }

    #[test]
    fn test_grid_map_keeps_axes() {
        let grids = aggregate(&bucket_all(&[row(1000.0, 1000.0, 4.0)]));
        let doubled = grids.values.map(|v| v * 2.0);
        assert_eq!(doubled.row_keys(), grids.values.row_keys());
        assert_eq!(doubled.get(1000, 1000), Some(8.0));
    }
}
