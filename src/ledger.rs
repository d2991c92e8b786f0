//! Append-only CSV ledger of location fixes.
//!
//! # File Format
//!
//! ```text
//! timestamp,latitude,longitude,accuracy,provider
//! 2025-01-01 08:00:00,37.5665,126.978,14.5,gps
//! 2025-01-01 08:01:00,37.5671,126.9791,,network
//! ```
//!
//! The header is written exactly once, when the file is created. Rows are
//! only ever appended, each with a single `write` call, so a concurrent
//! reader sees either a complete row or nothing. Readers skip malformed rows
//! instead of aborting the scan.

use crate::types::{Fix, TIMESTAMP_FORMAT};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column header of the ledger and of tabular exports.
pub const HEADER: [&str; 5] = ["timestamp", "latitude", "longitude", "accuracy", "provider"];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Ledger not found: {0}")]
    NotFound(PathBuf),
}

/// A ledger row that could not be turned into a [`Fix`].
#[derive(Debug, Error)]
pub enum RowError {
    #[error("line {line}: {source}")]
    Csv {
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("line {line}: expected {} columns, found {found}", HEADER.len())]
    ColumnCount { line: u64, found: usize },
    #[error("line {line}: invalid timestamp {value:?}")]
    Timestamp { line: u64, value: String },
    #[error("line {line}: invalid {field} {value:?}")]
    Number {
        line: u64,
        field: &'static str,
        value: String,
    },
}

/// Handle to the ledger file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// Refer to the ledger at `path`. The file is created lazily on first append.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append one fix, writing the header first if the file is new or empty.
    pub fn append(&self, fix: &Fix) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::Writer::from_writer(Vec::with_capacity(128));
        if needs_header {
            writer.write_record(HEADER)?;
        }
        write_fix(&mut writer, fix)?;
        let buf = writer.into_inner().map_err(|e| e.into_error())?;

        file.write_all(&buf)?;
        file.flush()?;
        Ok(())
    }

    /// Scan every row in file order.
    pub fn rows(&self) -> Result<LedgerRows, LedgerError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LedgerError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        Ok(LedgerRows {
            records: reader.into_records(),
        })
    }

    /// Every parseable fix, in file order. Malformed rows are logged and skipped.
    pub fn read_all(&self) -> Result<Vec<Fix>, LedgerError> {
        let mut fixes = Vec::new();
        for row in self.rows()? {
            match row {
                Ok(fix) => fixes.push(fix),
                Err(e) => tracing::debug!("Skipping ledger row: {}", e),
            }
        }
        Ok(fixes)
    }

    /// Summary of the ledger contents.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let mut stats = LedgerStats::default();

        for row in self.rows()? {
            match row {
                Ok(fix) => {
                    stats.total_rows += 1;
                    if stats.first.is_none() {
                        stats.first = Some(fix.timestamp);
                    }
                    stats.last = Some(fix.timestamp);
                    *stats.by_provider.entry(fix.provider).or_default() += 1;
                }
                Err(_) => stats.malformed_rows += 1,
            }
        }

        Ok(stats)
    }
}

/// Lazy iterator over ledger rows.
pub struct LedgerRows {
    records: csv::StringRecordsIntoIter<File>,
}

impl Iterator for LedgerRows {
    type Item = Result<Fix, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.records.next()?;
        Some(match result {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or(0);
                parse_record(line, &record)
            }
            Err(source) => {
                let line = source.position().map(|p| p.line()).unwrap_or(0);
                Err(RowError::Csv { line, source })
            }
        })
    }
}

/// Ledger statistics.
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    pub total_rows: u64,
    pub malformed_rows: u64,
    pub first: Option<NaiveDateTime>,
    pub last: Option<NaiveDateTime>,
    pub by_provider: BTreeMap<String, u64>,
}

/// Write one fix as a CSV row in ledger column order.
pub(crate) fn write_fix<W: Write>(writer: &mut csv::Writer<W>, fix: &Fix) -> csv::Result<()> {
    let accuracy = fix.accuracy.map(|a| a.to_string()).unwrap_or_default();
    writer.write_record([
        fix.timestamp_str(),
        fix.latitude.to_string(),
        fix.longitude.to_string(),
        accuracy,
        fix.provider.clone(),
    ])
}

fn parse_record(line: u64, record: &csv::StringRecord) -> Result<Fix, RowError> {
    if record.len() != HEADER.len() {
        return Err(RowError::ColumnCount {
            line,
            found: record.len(),
        });
    }

    let timestamp = NaiveDateTime::parse_from_str(&record[0], TIMESTAMP_FORMAT).map_err(|_| {
        RowError::Timestamp {
            line,
            value: record[0].to_string(),
        }
    })?;

    let number = |idx: usize, field: &'static str| -> Result<f64, RowError> {
        record[idx].parse::<f64>().map_err(|_| RowError::Number {
            line,
            field,
            value: record[idx].to_string(),
        })
    };

    let latitude = number(1, "latitude")?;
    let longitude = number(2, "longitude")?;
    // Older writers store a missing accuracy as empty or "None".
    let accuracy = match &record[3] {
        "" | "None" | "null" => None,
        _ => Some(number(3, "accuracy")?),
    };

    Ok(Fix {
        timestamp,
        latitude,
        longitude,
        accuracy,
        provider: record[4].to_string(),
    })
}
