//! Loading of the engine-log CSV and the column-mapping CSV.

use serde::{Deserialize, Serialize};

use crate::mapping::ColumnMapping;
use crate::{InputKind, MapError};

/// Field values read as missing, following the usual CSV reader conventions.
const NA_TOKENS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LoadOptions {
    pub delimiter: u8,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Number(f64),
    Text(String),
    Missing,
}

impl Cell {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if NA_TOKENS.contains(&trimmed) {
            return Cell::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => Cell::Number(value),
            Ok(_) => Cell::Missing,
            Err(_) => Cell::Text(trimmed.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }
}

/// Rows of a log file in file order. Every row has exactly one cell per header.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogTable {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl LogTable {
    /// Short rows are padded with [`Cell::Missing`]; long rows are truncated.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Cell::Missing);
                row
            })
            .collect();
        Self { headers, rows }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the first column with this name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, index: usize) -> impl Iterator<Item = &Cell> + '_ {
        self.rows.iter().filter_map(move |row| row.get(index))
    }

    pub(crate) fn rename_headers<F>(mut self, rename: F) -> Self
    where
        F: Fn(&str) -> String,
    {
        for header in &mut self.headers {
            *header = rename(header);
        }
        self
    }
}

struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Parse an uploaded log CSV. Only a header row is assumed.
pub fn parse_log_table(input: &[u8], options: &LoadOptions) -> Result<LogTable, MapError> {
    let raw = read_raw(input, options, InputKind::Log)?;
    let rows = raw
        .rows
        .iter()
        .map(|row| row.iter().map(|field| Cell::parse(field)).collect())
        .collect();
    Ok(LogTable::new(raw.headers, rows))
}

/// Parse a mapping CSV with `original` and `new` columns. Later rows
/// override earlier ones for the same original name.
pub fn parse_column_mapping(
    input: &[u8],
    options: &LoadOptions,
) -> Result<ColumnMapping, MapError> {
    let raw = read_raw(input, options, InputKind::Mapping)?;
    let find = |name: &str| raw.headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let (Some(original_idx), Some(new_idx)) = (find("original"), find("new")) else {
        return Err(MapError::MappingHeader {
            found: raw.headers.clone(),
        });
    };

    let mut mapping = ColumnMapping::default();
    for row in &raw.rows {
        let original = row.get(original_idx).map(|s| s.trim()).unwrap_or("");
        let canonical = row.get(new_idx).map(|s| s.trim()).unwrap_or("");
        if original.is_empty() || canonical.is_empty() {
            continue;
        }
        mapping.insert(original, canonical);
    }
    Ok(mapping)
}

fn read_raw(input: &[u8], options: &LoadOptions, kind: InputKind) -> Result<RawTable, MapError> {
    let parse_err = |message: String| MapError::Parse {
        input: kind,
        message,
    };

    let sniff = &input[..input.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return Err(parse_err("binary content is not delimited text".into()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(options.delimiter)
        .from_reader(input);

    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(|e| parse_err(e.to_string()))?
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let text = String::from_utf8_lossy(field);
            let text: &str = if idx == 0 {
                text.trim_start_matches('\u{feff}')
            } else {
                &text
            };
            text.trim().to_string()
        })
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(parse_err("missing header row".into()));
    }

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record.map_err(|e| parse_err(e.to_string()))?;
        if record.len() > headers.len() {
            let line = record
                .position()
                .map(|p| p.line())
                .unwrap_or(rows.len() as u64 + 2);
            return Err(parse_err(format!(
                "line {}: expected {} fields, saw {}",
                line,
                headers.len(),
                record.len()
            )));
        }
        rows.push(
            record
                .iter()
                .map(|field| String::from_utf8_lossy(field).into_owned())
                .collect(),
        );
    }

    Ok(RawTable { headers, rows })
}
