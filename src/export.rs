//! Ledger queries and export artifacts (CSV table + KML path).

use crate::ledger::{self, Ledger, LedgerError, HEADER};
use crate::types::{local_now, Fix};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Ledger not found: {0}")]
    MissingLedger(PathBuf),
    #[error("Invalid date {0:?}, expected YYYY-MM-DD or YYYY-MM-DD HH:MM")]
    InvalidDate(String),
    #[error("Range start {start} is after end {end}")]
    InvertedRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error("No fixes in {0}")]
    Empty(Selection),
    #[error("Ledger error: {0}")]
    Ledger(LedgerError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<LedgerError> for ExportError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(path) => Self::MissingLedger(path),
            other => Self::Ledger(other),
        }
    }
}

/// Which part of the ledger to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    All,
    /// Inclusive on both ends.
    Range {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

impl Selection {
    /// Build a range from operator input.
    ///
    /// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM` and `YYYY-MM-DD HH:MM:SS`.
    /// A bare start date means the start of that day, a bare end date the
    /// last second of that day.
    pub fn parse_range(start: &str, end: &str) -> Result<Self, ExportError> {
        let start = parse_bound(start, NaiveTime::default())?;
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default();
        let end = parse_bound(end, end_of_day)?;

        if start > end {
            return Err(ExportError::InvertedRange { start, end });
        }
        Ok(Self::Range { start, end })
    }

    pub fn contains(&self, ts: &NaiveDateTime) -> bool {
        match self {
            Self::All => true,
            Self::Range { start, end } => start <= ts && ts <= end,
        }
    }

    /// Tag used in export file names.
    fn file_tag(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Range { start, .. } => start.format("%Y%m%d").to_string(),
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Range { start, end } => write!(
                f,
                "{} ~ {}",
                start.format("%Y-%m-%d %H:%M"),
                end.format("%Y-%m-%d %H:%M")
            ),
        }
    }
}

fn parse_bound(input: &str, default_time: NaiveTime) -> Result<NaiveDateTime, ExportError> {
    let input = input.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(input, fmt) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map(|date| date.and_time(default_time))
        .map_err(|_| ExportError::InvalidDate(input.to_string()))
}

/// Fixes with a timestamp in `[start, end]`, in ledger order.
pub fn filter_range(
    ledger: &Ledger,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<Vec<Fix>, ExportError> {
    select(ledger, Selection::Range { start, end })
}

/// Every parseable fix, in ledger order.
pub fn filter_all(ledger: &Ledger) -> Result<Vec<Fix>, ExportError> {
    select(ledger, Selection::All)
}

/// Fixes matching `selection`, in ledger order. Malformed rows are skipped.
pub fn select(ledger: &Ledger, selection: Selection) -> Result<Vec<Fix>, ExportError> {
    let mut fixes = Vec::new();
    let mut skipped = 0usize;

    for row in ledger.rows()? {
        match row {
            Ok(fix) if selection.contains(&fix.timestamp) => fixes.push(fix),
            Ok(_) => {}
            Err(e) => {
                skipped += 1;
                tracing::debug!("Skipping ledger row: {}", e);
            }
        }
    }

    if skipped > 0 {
        tracing::warn!("Skipped {} malformed ledger rows", skipped);
    }
    Ok(fixes)
}

/// CSV bytes with the ledger header and one row per fix.
pub fn to_table(fixes: &[Fix]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(HEADER)?;
    for fix in fixes {
        ledger::write_fix(&mut writer, fix)?;
    }
    writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))
}

const KML_HEAD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <name>{name}</name>
    <Style id="lineStyle">
      <LineStyle>
        <color>ff0000ff</color>
        <width>4</width>
      </LineStyle>
    </Style>
    <Placemark>
      <name>Path</name>
      <styleUrl>#lineStyle</styleUrl>
      <LineString>
        <tessellate>1</tessellate>
        <coordinates>
"#;

const KML_TAIL: &str = r#"        </coordinates>
      </LineString>
    </Placemark>
  </Document>
</kml>
"#;

/// KML document with one path through `fixes` in the given order.
///
/// Zero or one fix yields a degenerate path rather than an error.
pub fn to_path_geometry(fixes: &[Fix], name: &str) -> Vec<u8> {
    let mut doc = KML_HEAD.replace("{name}", &escape_xml(name));
    for fix in fixes {
        doc.push_str(&format!(
            "          {},{},0\n",
            fix.longitude, fix.latitude
        ));
    }
    doc.push_str(KML_TAIL);
    doc.into_bytes()
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Export files written to disk, waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBundle {
    pub selection: Selection,
    pub fix_count: usize,
    pub table: PathBuf,
    pub path_geometry: PathBuf,
}

impl ExportBundle {
    /// Select fixes and write both artifacts into `dir`.
    ///
    /// Nothing is left on disk when this fails.
    pub fn create(ledger: &Ledger, selection: Selection, dir: &Path) -> Result<Self, ExportError> {
        let fixes = select(ledger, selection)?;
        tracing::info!("Found {} fixes for {}", fixes.len(), selection);

        if fixes.is_empty() {
            return Err(ExportError::Empty(selection));
        }

        let run = local_now().format("%Y%m%d%H%M%S");
        let tag = selection.file_tag();
        let table = dir.join(format!("path_{tag}_{run}.csv"));
        let path_geometry = dir.join(format!("map_{tag}_{run}.kml"));

        let bundle = Self {
            selection,
            fix_count: fixes.len(),
            table,
            path_geometry,
        };

        if let Err(e) = bundle.write(&fixes) {
            bundle.remove();
            return Err(e);
        }

        Ok(bundle)
    }

    fn write(&self, fixes: &[Fix]) -> Result<(), ExportError> {
        fs::create_dir_all(self.table.parent().unwrap_or(Path::new(".")))?;
        fs::write(&self.table, to_table(fixes)?)?;
        let name = format!("Location track ({})", self.selection);
        fs::write(&self.path_geometry, to_path_geometry(fixes, &name))?;
        Ok(())
    }

    pub fn files(&self) -> Vec<PathBuf> {
        vec![self.table.clone(), self.path_geometry.clone()]
    }

    /// Delete both files if present.
    pub fn remove(&self) {
        for path in [&self.table, &self.path_geometry] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn seeded_ledger(dir: &Path) -> Ledger {
        let ledger = Ledger::new(dir.join("gps_log.csv"));
        for (time, lat, lon) in [
            ("2025-01-01 08:00:00", 37.50, 127.00),
            ("2025-01-01 12:00:00", 37.55, 127.05),
            ("2025-01-01 20:00:00", 37.60, 127.10),
        ] {
            ledger
                .append(&Fix::new(ts(time), lat, lon, Some(8.0), "gps"))
                .unwrap();
        }
        ledger
    }

    #[test]
    fn test_filter_range_scenario() {
        let dir = tempdir().unwrap();
        let ledger = seeded_ledger(dir.path());

        let selection = Selection::parse_range("2025-01-01 09:00", "2025-01-01 18:00").unwrap();
        let Selection::Range { start, end } = selection else {
            panic!("expected range");
        };

        let fixes = filter_range(&ledger, start, end).unwrap();
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].timestamp, ts("2025-01-01 12:00:00"));
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let dir = tempdir().unwrap();
        let ledger = seeded_ledger(dir.path());

        let fixes = filter_range(
            &ledger,
            ts("2025-01-01 08:00:00"),
            ts("2025-01-01 20:00:00"),
        )
        .unwrap();
        assert_eq!(fixes.len(), 3);
        assert_eq!(filter_all(&ledger).unwrap(), fixes);
    }

    #[test]
    fn test_parse_range_formats() {
        assert_eq!(
            Selection::parse_range("2025-11-26", "2025-11-26").unwrap(),
            Selection::Range {
                start: ts("2025-11-26 00:00:00"),
                end: ts("2025-11-26 23:59:59"),
            }
        );
        assert_eq!(
            Selection::parse_range("2025-11-26 09:00", "2025-11-27 10:30:15").unwrap(),
            Selection::Range {
                start: ts("2025-11-26 09:00:00"),
                end: ts("2025-11-27 10:30:15"),
            }
        );
        assert!(matches!(
            Selection::parse_range("26/11/2025", "2025-11-27"),
            Err(ExportError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        match Selection::parse_range("2025-11-27", "2025-11-26") {
            Err(ExportError::InvertedRange { start, end }) => {
                assert_eq!(start, ts("2025-11-27 00:00:00"));
                assert_eq!(end, ts("2025-11-26 23:59:59"));
            }
            other => panic!("expected InvertedRange, got {other:?}"),
        }

        // Same instant on both ends is a valid one-second range.
        assert!(Selection::parse_range("2025-11-26 09:00", "2025-11-26 09:00:00").is_ok());
    }

    #[test]
    fn test_table_is_stable() {
        let dir = tempdir().unwrap();
        let ledger = seeded_ledger(dir.path());

        let first = to_table(&filter_all(&ledger).unwrap()).unwrap();
        let second = to_table(&filter_all(&ledger).unwrap()).unwrap();
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        assert!(text.starts_with("timestamp,latitude,longitude,accuracy,provider\n"));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn test_path_geometry_coordinate_order() {
        let fixes = vec![
            Fix::new(ts("2025-01-01 08:00:00"), 37.5, 127.25, None, "gps"),
            Fix::new(ts("2025-01-01 08:01:00"), -33.75, 151.5, None, "network"),
        ];
        let kml = String::from_utf8(to_path_geometry(&fixes, "Trip <1> & more")).unwrap();

        assert!(kml.contains("<name>Trip &lt;1&gt; &amp; more</name>"));
        let coords: Vec<_> = kml
            .lines()
            .map(str::trim)
            .filter(|l| l.ends_with(",0"))
            .collect();
        assert_eq!(coords, vec!["127.25,37.5,0", "151.5,-33.75,0"]);
    }

    #[test]
    fn test_path_geometry_degenerate() {
        let empty = String::from_utf8(to_path_geometry(&[], "empty")).unwrap();
        assert!(empty.contains("<coordinates>\n        </coordinates>"));

        let one = vec![Fix::new(ts("2025-01-01 08:00:00"), 1.0, 2.0, None, "gps")];
        let single = String::from_utf8(to_path_geometry(&one, "one")).unwrap();
        assert!(single.contains("2,1,0"));
        assert!(single.trim_end().ends_with("</kml>"));
    }

    #[test]
    fn test_bundle_create_and_remove() {
        let dir = tempdir().unwrap();
        let ledger = seeded_ledger(dir.path());
        let out = dir.path().join("exports");

        let selection = Selection::parse_range("2025-01-01", "2025-01-01").unwrap();
        let bundle = ExportBundle::create(&ledger, selection, &out).unwrap();

        assert_eq!(bundle.fix_count, 3);
        let table_name = bundle.table.file_name().unwrap().to_string_lossy().to_string();
        assert!(table_name.starts_with("path_20250101_"));
        assert!(bundle.files().iter().all(|p| p.exists()));

        bundle.remove();
        assert!(bundle.files().iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_bundle_errors_leave_nothing_behind() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("exports");

        let missing = Ledger::new(dir.path().join("absent.csv"));
        assert!(matches!(
            ExportBundle::create(&missing, Selection::All, &out),
            Err(ExportError::MissingLedger(_))
        ));

        let ledger = seeded_ledger(dir.path());
        let selection = Selection::parse_range("2030-01-01", "2030-01-02").unwrap();
        assert!(matches!(
            ExportBundle::create(&ledger, selection, &out),
            Err(ExportError::Empty(_))
        ));

        assert!(!out.exists() || fs::read_dir(&out).unwrap().next().is_none());
    }
}
