pub mod aggregate;
pub mod join;
pub mod map;
pub mod states;

use std::error::Error as StdError;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use calamine::{Data, Range, Reader};
use csv::ReaderBuilder;
use polars::prelude::PolarsError;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// UTF-8 byte-order marker written ahead of delimited output.
pub const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("column '{column}' not found in {table}")]
    Schema { table: String, column: String },
    #[error("{message}")]
    Unexpected {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },
}

impl PipelineError {
    pub fn schema(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Schema {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
            source: None,
        }
    }

    fn caused_by(context: &str, err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Unexpected {
            message: format!("{context}: {err}"),
            source: Some(Box::new(err)),
        }
    }

    /// I/O failure on `path`; a missing file is reported as [`PipelineError::NotFound`].
    pub fn io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::caused_by(&format!("I/O error on {}", path.display()), err)
        }
    }

    /// One-line message naming the failure kind, as shown to the user.
    pub fn diagnostic(&self) -> String {
        match self {
            PipelineError::NotFound(path) => {
                format!("❌ ERROR (file not found): '{}' does not exist.", path.display())
            }
            PipelineError::Schema { table, column } => format!(
                "❌ ERROR (missing column): '{column}' not found in {table}; check the column names listed above."
            ),
            PipelineError::Unexpected { message, .. } => {
                format!("⚠️ ERROR (unexpected): {message}")
            }
        }
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        Self::caused_by("CSV error", err)
    }
}

impl From<geojson::Error> for PipelineError {
    fn from(err: geojson::Error) -> Self {
        Self::caused_by("GeoJSON error", err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::caused_by("JSON error", err)
    }
}

impl From<PolarsError> for PipelineError {
    fn from(err: PolarsError) -> Self {
        Self::caused_by("data frame error", err)
    }
}

fn workbook_error(path: &Path, err: calamine::Error) -> PipelineError {
    match err {
        calamine::Error::Io(e) => PipelineError::io(path, e),
        other => PipelineError::caused_by(&format!("spreadsheet error in {}", path.display()), other),
    }
}

/// Print a diagnostic for a failed run to stdout.
pub fn report_failure(err: &PipelineError) {
    println!("{}", err.diagnostic());
}

/// A single spreadsheet value
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

static EMPTY_CELL: Cell = Cell::Empty;

impl Cell {
    /// Build a cell from delimited text; only the empty string is treated as missing.
    pub fn from_text(value: &str) -> Self {
        if value.is_empty() {
            Cell::Empty
        } else {
            Cell::Text(value.to_string())
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value as it reads in the sheet; empty cells give an empty string.
    pub fn to_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => n.to_string(),
            Cell::Bool(b) => b.to_string(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Interpret the cell as a non-negative whole count. Empty cells count as zero.
    pub fn to_count(&self) -> Result<u64, String> {
        match self {
            Cell::Empty => Ok(0),
            Cell::Number(n) => float_to_count(*n).ok_or_else(|| format!("{n} is not a valid count")),
            Cell::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(0);
                }
                if let Ok(n) = trimmed.parse::<u64>() {
                    return Ok(n);
                }
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(float_to_count)
                    .ok_or_else(|| format!("'{s}' is not a valid count"))
            }
            Cell::Bool(b) => Err(format!("{b} is not a valid count")),
        }
    }
}

fn float_to_count(n: f64) -> Option<u64> {
    // u64::MAX as f64 rounds up past the representable range
    if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n < u64::MAX as f64 {
        Some(n as u64)
    } else {
        None
    }
}

impl From<&Data> for Cell {
    fn from(value: &Data) -> Self {
        match value {
            Data::Empty | Data::Error(_) => Cell::Empty,
            Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::from_text(s),
            Data::Float(f) => Cell::Number(*f),
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Bool(b) => Cell::Bool(*b),
            // serial day number, as Excel stores it
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
        }
    }
}

/// In-memory table with whitespace-normalized column names
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(name: impl Into<String>, headers: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            name: name.into(),
            headers: headers.iter().map(|h| h.trim().to_string()).collect(),
            rows,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
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

    /// Index of a column by its trimmed name.
    pub fn column(&self, name: &str) -> Result<usize, PipelineError> {
        self.headers
            .iter()
            .position(|h| h == name.trim())
            .ok_or_else(|| PipelineError::schema(&self.name, name))
    }

    /// Cell at `column` of `row`; ragged rows read as empty.
    pub fn cell<'a>(row: &'a [Cell], column: usize) -> &'a Cell {
        row.get(column).unwrap_or(&EMPTY_CELL)
    }

    /// Error for a bad value in data row `index` (0-based, header excluded).
    pub(crate) fn row_error(&self, index: usize, column: &str, reason: &str) -> PipelineError {
        // +2: header line and 1-based numbering
        PipelineError::unexpected(format!(
            "{}: row {}, column '{column}': {reason}",
            self.name,
            index + 2
        ))
    }
}

/// Read the first worksheet of a spreadsheet, or a delimited text file, into a [`Table`].
///
/// The format is chosen by file extension. `delimiter` only applies to delimited text.
pub fn read_table(path: &Path, delimiter: u8) -> Result<Table, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::NotFound(path.to_path_buf()));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let table = match extension.as_deref() {
        Some("xlsx" | "xlsm" | "xlsb" | "xls" | "ods") => read_workbook(path)?,
        Some("csv" | "txt") => read_delimited(path, delimiter)?,
        _ => {
            return Err(PipelineError::unexpected(format!(
                "unsupported table format: {}",
                path.display()
            )));
        }
    };

    debug!(
        table = table.name(),
        rows = table.len(),
        columns = table.headers().len(),
        "loaded table"
    );
    Ok(table)
}

fn read_workbook(path: &Path) -> Result<Table, PipelineError> {
    let mut workbook = calamine::open_workbook_auto(path).map_err(|e| workbook_error(path, e))?;
    let range = first_sheet(path, workbook.worksheet_range_at(0))?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|header| header.iter().map(|c| c.to_string()).collect())
        .unwrap_or_default();
    let body = rows
        .map(|row| row.iter().map(Cell::from).collect())
        .collect();

    Ok(Table::new(path.display().to_string(), headers, body))
}

fn first_sheet(
    path: &Path,
    sheet: Option<Result<Range<Data>, calamine::Error>>,
) -> Result<Range<Data>, PipelineError> {
    sheet
        .ok_or_else(|| PipelineError::unexpected(format!("{} has no worksheets", path.display())))?
        .map_err(|e| workbook_error(path, e))
}

fn read_delimited(path: &Path, delimiter: u8) -> Result<Table, PipelineError> {
    let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    let content = bytes.strip_prefix(&UTF8_BOM).unwrap_or(&bytes[..]);

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(content);

    let headers = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(Cell::from_text).collect());
    }

    Ok(Table::new(path.display().to_string(), headers, rows))
}

/// Sum of system counts, failing instead of wrapping past `u64::MAX`.
///
/// Any subset of `counts` sums to at most this total.
pub(crate) fn checked_total(
    counts: impl IntoIterator<Item = u64>,
    source: &str,
) -> Result<u64, PipelineError> {
    counts
        .into_iter()
        .try_fold(0u64, |total, n| total.checked_add(n))
        .ok_or_else(|| {
            PipelineError::unexpected(format!("{source}: system counts overflow a 64-bit total"))
        })
}

/// Write a finished artifact, replacing any previous file only once it is complete.
pub(crate) fn write_output(path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
    write_atomically(path, |file| {
        file.write_all(contents)
            .map_err(|e| PipelineError::io(path, e))
    })
}

/// Let `write` fill a temporary file next to `path`, then move it into place.
///
/// If `write` fails the temporary file is removed and `path` is left untouched.
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> Result<(), PipelineError>
where
    F: FnOnce(&mut File) -> Result<(), PipelineError>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;

    let mut staged = NamedTempFile::new_in(parent).map_err(|e| PipelineError::io(parent, e))?;
    write(staged.as_file_mut())?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| PipelineError::io(path, e))?;
    staged
        .persist(path)
        .map_err(|e| PipelineError::io(path, e.error))?;
    Ok(())
}
