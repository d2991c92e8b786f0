//! Battery-aware location logger for mobile terminals.
//!
//! This library provides functionality to:
//! - Query an external location command (satellite or network provider) under a hard deadline
//! - Switch adaptively between the two providers, backing off from GPS after a failure
//! - Append fixes to a CSV ledger
//! - Export a time range as CSV + KML and mail it with account fallback
//! - Run the loop in the background behind a single-instance lock
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │  Provider   │───▶│   Tracker   │───▶│   Ledger    │
//! │ (gps/net)   │    │ (GPS ⇄ Net) │    │   (CSV)     │
//! └─────────────┘    └─────────────┘    └─────────────┘
//!                                              │
//!                                              ▼
//!                    ┌─────────────┐    ┌─────────────┐
//!                    │  Delivery   │◀───│   Export    │
//!                    │   (SMTP)    │    │ (CSV + KML) │
//!                    └─────────────┘    └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use geotrail::{
//!     ledger::Ledger,
//!     provider::CommandProvider,
//!     tracker::{Tracker, TrackerConfig},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ledger = Ledger::new("gps_log.csv");
//!     let mut tracker = Tracker::new(CommandProvider::default(), ledger, TrackerConfig::default());
//!
//!     // Runs until stopped or the provider command cannot be spawned
//!     tracker.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delivery;
pub mod export;
pub mod ledger;
pub mod provider;
pub mod supervisor;
pub mod tracker;
pub mod types;
pub mod wakelock;

pub use config::Config;
pub use delivery::{Account, DeliveryOutcome, SmtpMailer};
pub use export::{ExportBundle, Selection};
pub use ledger::Ledger;
pub use provider::{AcquireError, CommandProvider, LocationProvider};
pub use supervisor::{InstanceLock, Supervisor};
pub use tracker::{Tracker, TrackerBuilder, TrackerConfig};
pub use types::{Fix, Mode, ProviderKind};
pub use wakelock::WakeLock;
