//! Column renaming onto canonical channel names and the missing-column gate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::table::{parse_column_mapping, LoadOptions, LogTable};
use crate::MapError;

pub const MAP_MBAR: &str = "MAP_mbar";
pub const RPM: &str = "RPM";
pub const MAF_GPS: &str = "MAF_gps";
pub const IAT_C: &str = "IAT_C";
pub const AFR_SPECIFIED: &str = "AFR_specified";
pub const INJECTOR_PW_MS: &str = "Injector_PW_ms";
pub const STFT_PERCENT: &str = "STFT_percent";

pub const MANDATORY_COLUMNS: [&str; 3] = [MAP_MBAR, RPM, MAF_GPS];

const STRICT_COLUMNS: [&str; 6] = [MAP_MBAR, RPM, MAF_GPS, IAT_C, AFR_SPECIFIED, INJECTOR_PW_MS];

// VCDS measuring-block export headers.
const BUILTIN_MAPPING: &[(&str, &str)] = &[
    ("General: Intake manifold pressure (G71)", MAP_MBAR),
    ("General: Intake air temperature (G42)", IAT_C),
    ("General: Engine speed (G28)", RPM),
    (
        "Emission reduction (secondary air injection: Mass air flow sensor (G70)",
        MAF_GPS,
    ),
    (
        "Lambda control (lambda sensor voltages): Lambda control bank 1 (specified)",
        AFR_SPECIFIED,
    ),
    ("General: Injection timing", INJECTOR_PW_MS),
    ("Lambda control: Lambda control bank 1 sensor 1", STFT_PERCENT),
];

/// Original column name → canonical column name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    entries: BTreeMap<String, String>,
}

impl ColumnMapping {
    pub fn builtin() -> Self {
        BUILTIN_MAPPING
            .iter()
            .map(|(original, canonical)| (original.to_string(), canonical.to_string()))
            .collect()
    }

    /// Returns the canonical name previously stored for `original`, if any.
    pub fn insert(
        &mut self,
        original: impl Into<String>,
        canonical: impl Into<String>,
    ) -> Option<String> {
        self.entries.insert(original.into(), canonical.into())
    }

    pub fn get(&self, original: &str) -> Option<&str> {
        self.entries.get(original).map(String::as_str)
    }

    /// Canonical name for a header; unmapped headers pass through.
    pub fn apply<'a>(&'a self, header: &'a str) -> &'a str {
        self.get(header).unwrap_or(header)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for ColumnMapping {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut mapping = ColumnMapping::default();
        for (original, canonical) in iter {
            mapping.insert(original, canonical);
        }
        mapping
    }
}

/// Where the rename table comes from.
#[derive(Clone, Copy, Debug)]
pub enum MappingSource<'a> {
    BuiltIn,
    /// A mapping file is expected; `None` until it is uploaded.
    Upload(Option<&'a [u8]>),
}

impl MappingSource<'_> {
    pub fn is_awaiting_upload(&self) -> bool {
        matches!(self, MappingSource::Upload(None))
    }

    /// `Ok(None)` when an upload is expected but absent.
    pub fn resolve(&self, options: &LoadOptions) -> Result<Option<ColumnMapping>, MapError> {
        match self {
            MappingSource::BuiltIn => Ok(Some(ColumnMapping::builtin())),
            MappingSource::Upload(Some(bytes)) => parse_column_mapping(bytes, options).map(Some),
            MappingSource::Upload(None) => Ok(None),
        }
    }
}

/// Which canonical columns a log must provide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnProfile {
    /// MAP, RPM and MAF only.
    #[default]
    Standard,
    /// Also intake temperature, specified lambda and injection timing,
    /// which must be present on every kept row.
    Strict,
}

impl ColumnProfile {
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            ColumnProfile::Standard => &MANDATORY_COLUMNS,
            ColumnProfile::Strict => &STRICT_COLUMNS,
        }
    }

    /// Required columns beyond the three aggregated channels.
    pub fn extra_columns(self) -> &'static [&'static str] {
        &self.required_columns()[MANDATORY_COLUMNS.len()..]
    }
}

/// Column positions of the channels the aggregator reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelIndex {
    pub map_mbar: usize,
    pub rpm: usize,
    pub maf_gps: usize,
    pub extras: Vec<usize>,
}

/// A renamed log table that passed the missing-column check.
#[derive(Clone, Debug)]
pub struct CanonicalTable {
    table: LogTable,
    channels: ChannelIndex,
}

impl CanonicalTable {
    pub fn table(&self) -> &LogTable {
        &self.table
    }

    pub fn channels(&self) -> &ChannelIndex {
        &self.channels
    }
}

/// Rename the table's headers, then check the profile's columns exist.
pub fn normalize(
    table: LogTable,
    mapping: &ColumnMapping,
    profile: ColumnProfile,
) -> Result<CanonicalTable, MapError> {
    let table = table.rename_headers(|header| mapping.apply(header).to_string());

    let missing: Vec<String> = profile
        .required_columns()
        .iter()
        .filter(|name| table.column_index(name).is_none())
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(MapError::MissingColumns(missing));
    }

    for name in profile.required_columns() {
        let occurrences = table.headers().iter().filter(|h| h == name).count();
        if occurrences > 1 {
            warn!(column = *name, occurrences, "duplicate canonical column; using the first");
        }
    }

    let index = |name: &str| table.column_index(name).unwrap_or_default();
    let channels = ChannelIndex {
        map_mbar: index(MAP_MBAR),
        rpm: index(RPM),
        maf_gps: index(MAF_GPS),
        extras: profile.extra_columns().iter().map(|name| index(*name)).collect(),
    };
    Ok(CanonicalTable { table, channels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{parse_log_table, Cell};

    fn load(text: &str) -> LogTable {
        parse_log_table(text.as_bytes(), &LoadOptions::default()).unwrap()
    }

    #[test]
    fn test_builtin_mapping_covers_vcds_channels() {
        let mapping = ColumnMapping::builtin();
        assert_eq!(mapping.len(), 7);
        assert_eq!(mapping.get("General: Engine speed (G28)"), Some(RPM));
        assert_eq!(
            mapping.get("Lambda control: Lambda control bank 1 sensor 1"),
            Some(STFT_PERCENT)
        );
    }

    #[test]
    fn test_unmapped_columns_pass_through() {
        let mut mapping = ColumnMapping::default();
        mapping.insert("p", MAP_MBAR);
        mapping.insert("n", RPM);
        mapping.insert("q", MAF_GPS);
        let canonical = normalize(load("p,n,q,Lap\n1,2,3,4\n"), &mapping, ColumnProfile::Standard)
            .unwrap();
        assert_eq!(canonical.table().headers(), &["MAP_mbar", "RPM", "MAF_gps", "Lap"]);
        assert_eq!(canonical.channels().maf_gps, 2);
    }

    #[test]
    fn test_rename_happens_before_validation() {
        let mut mapping = ColumnMapping::default();
        mapping.insert("p", MAP_MBAR);
        // "MAF_gps" renamed away, so the canonical name is gone.
        mapping.insert(MAF_GPS, "mass_air");
        let err = normalize(load("p,RPM,MAF_gps\n1,2,3\n"), &mapping, ColumnProfile::Standard)
            .unwrap_err();
        match err {
            MapError::MissingColumns(missing) => assert_eq!(missing, vec![MAF_GPS]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_original_name_does_not_satisfy_canonical() {
        let err = normalize(
            load("General: Engine speed (G28),MAP_mbar,MAF_gps\n1,2,3\n"),
            &ColumnMapping::default(),
            ColumnProfile::Standard,
        )
        .unwrap_err();
        match err {
            MapError::MissingColumns(missing) => assert_eq!(missing, vec![RPM]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_all_missing_columns_listed_in_order() {
        let err = normalize(load("x\n1\n"), &ColumnMapping::default(), ColumnProfile::Standard)
            .unwrap_err();
        match err {
            MapError::MissingColumns(missing) => {
                assert_eq!(missing, vec![MAP_MBAR, RPM, MAF_GPS])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_strict_profile_indexes_extras() {
        let table = load("IAT_C,MAP_mbar,RPM,MAF_gps,AFR_specified,Injector_PW_ms\n1,2,3,4,5,6\n");
        let canonical =
            normalize(table, &ColumnMapping::default(), ColumnProfile::Strict).unwrap();
        assert_eq!(canonical.channels().map_mbar, 1);
        assert_eq!(canonical.channels().extras, vec![0, 4, 5]);
    }

    #[test]
    fn test_duplicate_canonical_uses_first_column() {
        let mut mapping = ColumnMapping::default();
        mapping.insert("a", RPM);
        mapping.insert("b", RPM);
        let canonical = normalize(
            load("a,b,MAP_mbar,MAF_gps\n1000,2000,900,4\n"),
            &mapping,
            ColumnProfile::Standard,
        )
        .unwrap();
        let rpm = canonical.channels().rpm;
        assert_eq!(rpm, 0);
        assert_eq!(canonical.table().rows()[0][rpm], Cell::Number(1000.0));
    }

    #[test]
    fn test_mapping_source_resolution() {
        let options = LoadOptions::default();
        assert_eq!(
            MappingSource::BuiltIn.resolve(&options).unwrap(),
            Some(ColumnMapping::builtin())
        );
        assert_eq!(MappingSource::Upload(None).resolve(&options).unwrap(), None);
        let bytes: &[u8] = b"original,new\nSensorA,MAP_mbar\n";
        let mapping = MappingSource::Upload(Some(bytes))
            .resolve(&options)
            .unwrap()
            .unwrap();
        assert_eq!(mapping.get("SensorA"), Some(MAP_MBAR));
    }
}
