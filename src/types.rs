//! Core data types for location tracking.

use chrono::{Local, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;

/// Timestamp format used by the ledger and the CLI (local time, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// External location source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Satellite fix: accurate, slow and power hungry.
    Gps,
    /// Wi-Fi / cell tower fix: cheap and coarse.
    Network,
}

impl ProviderKind {
    /// Selector passed to the provider command.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gps => "gps",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gps" => Ok(Self::Gps),
            "network" => Ok(Self::Network),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Provider preference of the acquisition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    GpsMode,
    NetworkMode,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GpsMode => f.write_str("gps-mode"),
            Self::NetworkMode => f.write_str("network-mode"),
        }
    }
}

/// One successful location observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    /// Local wall-clock time the fix was taken, truncated to whole seconds.
    pub timestamp: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    /// Provider-reported accuracy radius in meters.
    pub accuracy: Option<f64>,
    /// Provider tag as reported (`gps`, `network`, or something provider specific).
    pub provider: String,
}

impl Fix {
    pub fn new(
        timestamp: NaiveDateTime,
        latitude: f64,
        longitude: f64,
        accuracy: Option<f64>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: truncate_to_second(timestamp),
            latitude,
            longitude,
            accuracy,
            provider: provider.into(),
        }
    }

    /// Timestamp rendered in the ledger format.
    pub fn timestamp_str(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:.6}, {:.6} ({})",
            self.timestamp_str(),
            self.latitude,
            self.longitude,
            self.provider
        )?;
        if let Some(acc) = self.accuracy {
            write!(f, " ±{acc:.0}m")?;
        }
        Ok(())
    }
}

/// Current local wall-clock time at second precision.
pub fn local_now() -> NaiveDateTime {
    truncate_to_second(Local::now().naive_local())
}

fn truncate_to_second(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_provider_kind_round_trip() {
        assert_eq!(ProviderKind::Gps.to_string(), "gps");
        assert_eq!("network".parse::<ProviderKind>(), Ok(ProviderKind::Network));
        assert!("fused".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_fix_truncates_subsecond() {
        let ts = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_milli_opt(8, 0, 0, 750)
            .unwrap();
        let fix = Fix::new(ts, 37.5, 127.0, None, "gps");
        assert_eq!(fix.timestamp_str(), "2025-01-01 08:00:00");
        assert_eq!(fix.timestamp.nanosecond(), 0);
    }

    #[test]
    fn test_fix_display() {
        let ts = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let fix = Fix::new(ts, 37.5665, 126.978, Some(12.0), "network");
        assert_eq!(
            fix.to_string(),
            "[2025-01-01 12:00:00] 37.566500, 126.978000 (network) ±12m"
        );
    }

    #[test]
    fn test_default_mode_is_gps() {
        assert_eq!(Mode::default(), Mode::GpsMode);
    }
}
