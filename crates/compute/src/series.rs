//! Multivariate time series container and the delimited text formats.
//!
//! Input files have one row per timestamp and one comma-separated column per
//! dimension, optionally preceded by a single header row. Output files have
//! the same layout without a header: one row per timestamp, one column per
//! dimension's anomaly score.

use std::fs;
use std::io;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use s2gpp_core::ColumnRange;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ComputeError;
use crate::reconstruction::ReconstructedScoreSeries;

/// Column-major multivariate series.
///
/// `first_column` is the global index of `columns[0]`, so a slice shipped to
/// another node still knows which dimensions it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    first_column: usize,
    n_rows: usize,
    columns: Vec<Vec<f64>>,
}

impl TimeSeries {
    pub fn from_columns(first_column: usize, columns: Vec<Vec<f64>>) -> Result<Self, ComputeError> {
        let n_rows = columns.first().map(Vec::len).unwrap_or(0);
        if let Some((i, c)) = columns.iter().enumerate().find(|(_, c)| c.len() != n_rows) {
            return Err(ComputeError::invalid_column(
                first_column + i,
                format!("has {} rows, expected {n_rows}", c.len()),
            ));
        }
        Ok(Self {
            first_column,
            n_rows,
            columns,
        })
    }

    /// Build from row-major data (one inner vector per timestamp).
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ComputeError> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        let mut columns = vec![Vec::with_capacity(rows.len()); width];
        for (r, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(ComputeError::invalid(format!(
                    "row {r} has {} values, expected {width}",
                    row.len()
                )));
            }
            for (c, v) in row.iter().enumerate() {
                columns[c].push(*v);
            }
        }
        Self::from_columns(0, columns)
    }

    pub fn univariate(values: Vec<f64>) -> Self {
        Self {
            first_column: 0,
            n_rows: values.len(),
            columns: vec![values],
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn first_column(&self) -> usize {
        self.first_column
    }

    /// Global column indices held by this series.
    pub fn column_range(&self) -> ColumnRange {
        ColumnRange {
            start: self.first_column,
            end: self.first_column + self.columns.len(),
        }
    }

    /// `(global index, values)` for every column.
    pub fn columns(&self) -> impl Iterator<Item = (usize, &[f64])> {
        self.columns
            .iter()
            .enumerate()
            .map(move |(i, c)| (self.first_column + i, c.as_slice()))
    }

    pub fn column(&self, global: usize) -> Option<&[f64]> {
        global
            .checked_sub(self.first_column)
            .and_then(|i| self.columns.get(i))
            .map(Vec::as_slice)
    }

    /// Copy out the columns of `range` (global indices).
    pub fn select(&self, range: ColumnRange) -> Result<Self, ComputeError> {
        let held = self.column_range();
        if range.start < held.start || range.end > held.end {
            return Err(ComputeError::invalid(format!(
                "columns {range} are not within the series columns {held}"
            )));
        }
        let from = range.start - self.first_column;
        let to = range.end - self.first_column;
        Ok(Self {
            first_column: range.start,
            n_rows: self.n_rows,
            columns: self.columns[from..to].to_vec(),
        })
    }

    /// Read a delimited file.
    pub fn read_delimited(path: impl AsRef<Path>) -> Result<Self, ComputeError> {
        let path = path.as_ref();
        let series = Self::from_reader(fs::File::open(path)?)?;
        debug!(
            path = %path.display(),
            rows = series.n_rows(),
            columns = series.n_columns(),
            "read series"
        );
        Ok(series)
    }

    /// Parse delimited text. See [`from_reader`](Self::from_reader).
    pub fn parse_delimited(text: &str) -> Result<Self, ComputeError> {
        Self::from_reader(text.as_bytes())
    }

    /// Parse delimited input. A first record that is not entirely numeric is
    /// taken as a header and skipped; blank records are ignored.
    pub fn from_reader(input: impl io::Read) -> Result<Self, ComputeError> {
        let mut reader = input_reader(input);
        let mut rows = Vec::new();
        let mut first = true;
        for record in reader.records() {
            let record = record?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            match parse_record(&record) {
                Ok(row) => rows.push(row),
                Err(_) if first => {
                    debug!(line = line_of(&record), "skipping header row");
                }
                Err(field) => {
                    return Err(ComputeError::invalid(format!(
                        "line {}: '{field}' is not a number",
                        line_of(&record)
                    )));
                }
            }
            first = false;
        }
        if rows.is_empty() {
            return Err(ComputeError::invalid("series has no rows"));
        }
        Self::from_rows(&rows).map_err(|e| match e {
            ComputeError::InvalidInput { column: None, reason } => ComputeError::invalid(format!(
                "ragged input: {reason}"
            )),
            other => other,
        })
    }
}

/// Header detection and ragged-row reporting happen on top of the records,
/// so the reader itself accepts both.
fn input_reader<R: io::Read>(input: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input)
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

fn parse_record(record: &StringRecord) -> Result<Vec<f64>, String> {
    record
        .iter()
        .map(|field| field.parse::<f64>().map_err(|_| field.to_string()))
        .collect()
}

/// Write reconstructed scores, one row per timestamp and one column per
/// series, in the order given.
///
/// The file is written next to `path` under a temporary name and renamed
/// into place once complete, so a failed write never leaves partial output.
pub fn write_scores(
    path: impl AsRef<Path>,
    series: &[ReconstructedScoreSeries],
) -> Result<(), ComputeError> {
    let path = path.as_ref();
    let n_rows = checked_row_count(series)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| ComputeError::invalid(format!("'{}' is not a file path", path.display())))?;
    let partial = path.with_file_name(format!(".{}.partial", file_name.to_string_lossy()));

    let result = fs::File::create(&partial)
        .map_err(ComputeError::from)
        .and_then(|file| write_score_rows(file, series));

    match result {
        Ok(()) => {
            fs::rename(&partial, path)?;
            debug!(path = %path.display(), rows = n_rows, columns = series.len(), "scores written");
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

/// Write scores in the output layout to any sink (a file, stdout).
pub fn write_score_rows(
    out: impl io::Write,
    series: &[ReconstructedScoreSeries],
) -> Result<(), ComputeError> {
    let n_rows = checked_row_count(series)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
    for t in 0..n_rows {
        writer.write_record(series.iter().map(|s| s.scores[t].to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Rows shared by every series, or the first series that disagrees.
fn checked_row_count(series: &[ReconstructedScoreSeries]) -> Result<usize, ComputeError> {
    let n_rows = series.first().map(ReconstructedScoreSeries::len).unwrap_or(0);
    match series.iter().find(|s| s.len() != n_rows) {
        Some(s) => Err(ComputeError::invalid_column(
            s.column,
            format!("has {} scores, expected {n_rows}", s.len()),
        )),
        None => Ok(n_rows),
    }
}

/// Read a score file written by [`write_scores`] back as rows.
pub fn read_scores(path: impl AsRef<Path>) -> Result<Vec<Vec<f64>>, ComputeError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .trim(Trim::All)
        .from_path(path)?;
    reader
        .records()
        .map(|record| {
            let record = record?;
            parse_record(&record).map_err(|field| {
                ComputeError::invalid(format!(
                    "line {}: '{field}' is not a number",
                    line_of(&record)
                ))
            })
        })
        .collect()
}
