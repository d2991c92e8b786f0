//! Adaptive dual-provider acquisition loop.
//!
//! # Transitions
//!
//! ```text
//!               gps ok
//!             ┌───────┐
//!             ▼       │
//!        ┌──────────────┐  gps failed: network (long), reset timer  ┌──────────────┐
//!  ─────▶│   GpsMode    │──────────────────────────────────────────▶│ NetworkMode  │
//!        └──────────────┘                                           └──────────────┘
//!             ▲   retry interval elapsed and gps ok                   │    ▲    │
//!             └───────────────────────────────────────────────────────┘    │    │
//!                         interval elapsed, gps failed: network (long), ───┘    │
//!                         reset timer                                          │
//!                         interval not elapsed: network (short) ◀──────────────┘
//! ```
//!
//! Every provider failure is recoverable; only host-level errors (the provider
//! command cannot be spawned at all) end the loop.

use crate::ledger::Ledger;
use crate::provider::{AcquireError, LocationProvider};
use crate::types::{Fix, Mode, ProviderKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Provider error: {0}")]
    Provider(#[from] AcquireError),
}

/// Statistics for the tracker.
#[derive(Debug, Default)]
pub struct TrackerStats {
    pub ticks: AtomicU64,
    pub fixes_written: AtomicU64,
    pub gps_fixes: AtomicU64,
    pub network_fixes: AtomicU64,
    pub acquire_failures: AtomicU64,
    pub persist_failures: AtomicU64,
}

impl TrackerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            fixes_written: self.fixes_written.load(Ordering::Relaxed),
            gps_fixes: self.gps_fixes.load(Ordering::Relaxed),
            network_fixes: self.network_fixes.load(Ordering::Relaxed),
            acquire_failures: self.acquire_failures.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerStatsSnapshot {
    pub ticks: u64,
    pub fixes_written: u64,
    pub gps_fixes: u64,
    pub network_fixes: u64,
    pub acquire_failures: u64,
    pub persist_failures: u64,
}

/// Timeouts and intervals for the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Deadline for a satellite probe
    pub gps_timeout: Duration,
    /// Network deadline right after a satellite failure
    pub long_network_timeout: Duration,
    /// Network deadline while settled in network mode
    pub short_network_timeout: Duration,
    /// How long to stay on the network provider before re-probing the satellite
    pub gps_retry_interval: Duration,
    /// Sleep between ticks
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            gps_timeout: Duration::from_secs(15),
            long_network_timeout: Duration::from_secs(120),
            short_network_timeout: Duration::from_secs(20),
            gps_retry_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// In-memory acquisition state. A restart always begins in [`Mode::GpsMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionState {
    pub mode: Mode,
    /// When the retry timer was last reset.
    pub retry_since: Instant,
}

impl AcquisitionState {
    pub fn new(now: Instant) -> Self {
        Self {
            mode: Mode::GpsMode,
            retry_since: now,
        }
    }
}

/// One provider query made during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub provider: ProviderKind,
    pub timeout: Duration,
    pub succeeded: bool,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub from: Mode,
    pub to: Mode,
    pub probes: Vec<Probe>,
    /// The fix to persist, if any provider succeeded.
    pub fix: Option<Fix>,
}

/// The acquisition state machine and its polling loop.
pub struct Tracker<P> {
    provider: P,
    ledger: Ledger,
    config: TrackerConfig,
    state: AcquisitionState,
    stats: Arc<TrackerStats>,
}

impl<P: LocationProvider> Tracker<P> {
    /// Create a new tracker starting in GPS mode.
    pub fn new(provider: P, ledger: Ledger, config: TrackerConfig) -> Self {
        Self {
            provider,
            ledger,
            config,
            state: AcquisitionState::new(Instant::now()),
            stats: Arc::new(TrackerStats::new()),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Get a reference to the tracker stats.
    pub fn stats(&self) -> Arc<TrackerStats> {
        Arc::clone(&self.stats)
    }

    /// Run ticks until the future is dropped or a host-level error occurs.
    ///
    /// Cancellation is safe between and during ticks: an in-flight provider
    /// child is killed when its future is dropped.
    pub async fn run(&mut self) -> Result<(), TrackerError> {
        tracing::info!(
            gps_timeout = ?self.config.gps_timeout,
            long_network_timeout = ?self.config.long_network_timeout,
            short_network_timeout = ?self.config.short_network_timeout,
            gps_retry_interval = ?self.config.gps_retry_interval,
            poll_interval = ?self.config.poll_interval,
            "Starting location tracker"
        );
        tracing::info!("Ledger: {}", self.ledger.path().display());

        self.poll_loop().await
    }

    async fn poll_loop(&mut self) -> Result<(), TrackerError> {
        loop {
            let outcome = self.tick(Instant::now()).await?;

            if let Some(fix) = &outcome.fix {
                self.persist(fix);
            } else {
                tracing::warn!("No location fix this tick");
            }

            sleep(self.config.poll_interval).await;
        }
    }

    /// Evaluate one poll tick at time `now`. Does not persist or sleep.
    pub async fn tick(&mut self, now: Instant) -> Result<TickOutcome, TrackerError> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let from = self.state.mode;
        let mut probes = Vec::with_capacity(2);

        let fix = match from {
            Mode::GpsMode => {
                let gps = self.probe(ProviderKind::Gps, &mut probes).await?;
                if gps.is_some() {
                    gps
                } else {
                    let fix = self.probe(ProviderKind::Network, &mut probes).await?;
                    self.enter_network_mode(now);
                    fix
                }
            }
            Mode::NetworkMode => {
                let elapsed = now.saturating_duration_since(self.state.retry_since);

                if elapsed >= self.config.gps_retry_interval {
                    tracing::info!(?elapsed, "Retry interval elapsed, re-probing GPS");
                    let gps = self.probe(ProviderKind::Gps, &mut probes).await?;
                    if gps.is_some() {
                        self.state.mode = Mode::GpsMode;
                        tracing::info!("GPS is back, switching to {}", Mode::GpsMode);
                        gps
                    } else {
                        let fix = self.probe(ProviderKind::Network, &mut probes).await?;
                        self.state.retry_since = now;
                        tracing::info!("GPS still unavailable, staying in {}", Mode::NetworkMode);
                        fix
                    }
                } else {
                    let fix = self.probe(ProviderKind::Network, &mut probes).await?;
                    let remaining = self.config.gps_retry_interval - elapsed;
                    tracing::debug!(
                        "Staying in {}, GPS retry in {}m",
                        Mode::NetworkMode,
                        remaining.as_secs() / 60
                    );
                    fix
                }
            }
        };

        Ok(TickOutcome {
            from,
            to: self.state.mode,
            probes,
            fix,
        })
    }

    fn enter_network_mode(&mut self, now: Instant) {
        self.state.mode = Mode::NetworkMode;
        self.state.retry_since = now;
        tracing::info!(
            "GPS failed, switching to {} for {:?}",
            Mode::NetworkMode,
            self.config.gps_retry_interval
        );
    }

    /// Deadline for a probe of `kind` in the current situation.
    fn timeout_for(&self, kind: ProviderKind, probes: &[Probe]) -> Duration {
        match kind {
            ProviderKind::Gps => self.config.gps_timeout,
            // A network probe right after a failed satellite probe gets the long window.
            ProviderKind::Network if probes.iter().any(|p| p.provider == ProviderKind::Gps) => {
                self.config.long_network_timeout
            }
            ProviderKind::Network => self.config.short_network_timeout,
        }
    }

    async fn probe(
        &self,
        kind: ProviderKind,
        probes: &mut Vec<Probe>,
    ) -> Result<Option<Fix>, TrackerError> {
        let timeout = self.timeout_for(kind, probes);
        tracing::info!(provider = %kind, ?timeout, "Requesting location");

        let result = self.provider.acquire(kind, timeout).await;
        probes.push(Probe {
            provider: kind,
            timeout,
            succeeded: result.is_ok(),
        });

        match result {
            Ok(fix) => {
                match kind {
                    ProviderKind::Gps => self.stats.gps_fixes.fetch_add(1, Ordering::Relaxed),
                    ProviderKind::Network => {
                        self.stats.network_fixes.fetch_add(1, Ordering::Relaxed)
                    }
                };
                tracing::info!(provider = %kind, "Location acquired: {}", fix);
                Ok(Some(fix))
            }
            Err(e) if e.is_recoverable() => {
                self.stats.acquire_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{}", e);
                Ok(None)
            }
            Err(e) => {
                tracing::error!("Cannot query location provider: {}", e);
                Err(e.into())
            }
        }
    }

    fn persist(&self, fix: &Fix) {
        match self.ledger.append(fix) {
            Ok(()) => {
                self.stats.fixes_written.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Recorded {}", fix);
            }
            Err(e) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Ledger write error, fix lost: {}", e);
            }
        }
    }
}

/// Builder for creating a Tracker with custom configuration.
pub struct TrackerBuilder<P> {
    provider: P,
    ledger: Option<Ledger>,
    config: TrackerConfig,
}

impl<P: LocationProvider> TrackerBuilder<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            ledger: None,
            config: TrackerConfig::default(),
        }
    }

    pub fn ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn build(self) -> Tracker<P> {
        let ledger = self
            .ledger
            .unwrap_or_else(|| Ledger::new(crate::config::DEFAULT_LEDGER_FILE));
        Tracker::new(self.provider, ledger, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::local_now;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Provider that replays scripted answers and records every call.
    #[derive(Default)]
    struct ScriptedProvider {
        gps: Mutex<VecDeque<bool>>,
        network: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<(ProviderKind, Duration)>>,
    }

    impl ScriptedProvider {
        fn new(gps: &[bool], network: &[bool]) -> Self {
            Self {
                gps: Mutex::new(gps.iter().copied().collect()),
                network: Mutex::new(network.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn take_calls(&self) -> Vec<(ProviderKind, Duration)> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl LocationProvider for ScriptedProvider {
        async fn acquire(&self, kind: ProviderKind, timeout: Duration) -> Result<Fix, AcquireError> {
            self.calls.lock().unwrap().push((kind, timeout));
            let queue = match kind {
                ProviderKind::Gps => &self.gps,
                ProviderKind::Network => &self.network,
            };
            let ok = queue.lock().unwrap().pop_front().unwrap_or(false);
            if ok {
                Ok(Fix::new(local_now(), 37.5, 127.0, Some(10.0), kind.as_str()))
            } else {
                Err(AcquireError::Timeout {
                    provider: kind,
                    timeout,
                })
            }
        }
    }

    impl LocationProvider for &ScriptedProvider {
        async fn acquire(&self, kind: ProviderKind, timeout: Duration) -> Result<Fix, AcquireError> {
            (**self).acquire(kind, timeout).await
        }
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            gps_timeout: Duration::from_secs(15),
            long_network_timeout: Duration::from_secs(120),
            short_network_timeout: Duration::from_secs(20),
            gps_retry_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn tracker(provider: &ScriptedProvider) -> Tracker<&ScriptedProvider> {
        Tracker::new(provider, Ledger::new("unused.csv"), config())
    }

    #[tokio::test]
    async fn test_gps_success_stays_in_gps_mode() {
        let provider = ScriptedProvider::new(&[true], &[]);
        let mut tracker = tracker(&provider);

        let outcome = tracker.tick(Instant::now()).await.unwrap();

        assert_eq!(outcome.from, Mode::GpsMode);
        assert_eq!(outcome.to, Mode::GpsMode);
        assert_eq!(outcome.fix.unwrap().provider, "gps");
        assert_eq!(
            provider.take_calls(),
            vec![(ProviderKind::Gps, Duration::from_secs(15))]
        );
    }

    #[tokio::test]
    async fn test_gps_failure_falls_back_with_long_network_timeout() {
        let provider = ScriptedProvider::new(&[false], &[true]);
        let mut tracker = tracker(&provider);
        let now = Instant::now() + Duration::from_secs(5);

        let outcome = tracker.tick(now).await.unwrap();

        assert_eq!(outcome.to, Mode::NetworkMode);
        assert_eq!(tracker.state().retry_since, now);
        assert_eq!(outcome.fix.unwrap().provider, "network");
        assert_eq!(
            provider.take_calls(),
            vec![
                (ProviderKind::Gps, Duration::from_secs(15)),
                (ProviderKind::Network, Duration::from_secs(120)),
            ]
        );
    }

    #[tokio::test]
    async fn test_both_providers_failing_still_enters_network_mode() {
        let provider = ScriptedProvider::new(&[false], &[false]);
        let mut tracker = tracker(&provider);

        let outcome = tracker.tick(Instant::now()).await.unwrap();

        assert_eq!(outcome.to, Mode::NetworkMode);
        assert!(outcome.fix.is_none());
        assert_eq!(tracker.stats().snapshot().acquire_failures, 2);
    }

    #[tokio::test]
    async fn test_network_mode_within_interval_uses_short_timeout() {
        let provider = ScriptedProvider::new(&[false], &[true, true, false]);
        let mut tracker = tracker(&provider);
        let start = Instant::now();

        tracker.tick(start).await.unwrap();
        provider.take_calls();

        for minutes in [1, 30, 59] {
            let now = start + Duration::from_secs(minutes * 60);
            let outcome = tracker.tick(now).await.unwrap();
            assert_eq!(outcome.to, Mode::NetworkMode);
            assert_eq!(tracker.state().retry_since, start);
            assert_eq!(
                provider.take_calls(),
                vec![(ProviderKind::Network, Duration::from_secs(20))]
            );
        }
    }

    #[tokio::test]
    async fn test_retry_interval_elapsed_reprobes_gps_and_recovers() {
        let provider = ScriptedProvider::new(&[false, true], &[true]);
        let mut tracker = tracker(&provider);
        let start = Instant::now();

        tracker.tick(start).await.unwrap();
        provider.take_calls();

        let outcome = tracker
            .tick(start + Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(outcome.from, Mode::NetworkMode);
        assert_eq!(outcome.to, Mode::GpsMode);
        assert_eq!(outcome.fix.unwrap().provider, "gps");
        assert_eq!(
            provider.take_calls(),
            vec![(ProviderKind::Gps, Duration::from_secs(15))]
        );
    }

    #[tokio::test]
    async fn test_retry_failure_resets_timer_and_stays() {
        let provider = ScriptedProvider::new(&[false, false], &[true, true, true]);
        let mut tracker = tracker(&provider);
        let start = Instant::now();

        tracker.tick(start).await.unwrap();
        provider.take_calls();

        let retry_at = start + Duration::from_secs(3700);
        let outcome = tracker.tick(retry_at).await.unwrap();

        assert_eq!(outcome.to, Mode::NetworkMode);
        assert_eq!(tracker.state().retry_since, retry_at);
        assert_eq!(
            provider.take_calls(),
            vec![
                (ProviderKind::Gps, Duration::from_secs(15)),
                (ProviderKind::Network, Duration::from_secs(120)),
            ]
        );

        // Timer restarted: the next tick is a plain short network probe.
        tracker
            .tick(retry_at + Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            provider.take_calls(),
            vec![(ProviderKind::Network, Duration::from_secs(20))]
        );
    }

    #[tokio::test]
    async fn test_fatal_provider_error_propagates() {
        struct Broken;

        impl LocationProvider for Broken {
            async fn acquire(
                &self,
                _kind: ProviderKind,
                _timeout: Duration,
            ) -> Result<Fix, AcquireError> {
                Err(AcquireError::Spawn {
                    command: "termux-location".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
        }

        let mut tracker = Tracker::new(Broken, Ledger::new("unused.csv"), config());
        let err = tracker.run().await.unwrap_err();
        assert!(matches!(err, TrackerError::Provider(AcquireError::Spawn { .. })));
        assert_eq!(tracker.stats().snapshot().ticks, 1);
    }

    #[tokio::test]
    async fn test_run_persists_each_fix() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("gps_log.csv"));
        let provider = ScriptedProvider::new(&[true; 64], &[]);

        let mut tracker = TrackerBuilder::new(&provider)
            .ledger(ledger.clone())
            .config(config())
            .poll_interval(Duration::from_millis(5))
            .build();
        let stats = tracker.stats();

        let _ = tokio::time::timeout(Duration::from_millis(100), tracker.run()).await;

        let snapshot = stats.snapshot();
        let rows = ledger.read_all().unwrap();
        assert!(snapshot.fixes_written >= 1);
        assert_eq!(rows.len() as u64, snapshot.fixes_written);
        assert!(rows.iter().all(|fix| fix.provider == "gps"));
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_stop_loop() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened for appending.
        let ledger = Ledger::new(dir.path());
        let provider = ScriptedProvider::new(&[true; 64], &[]);

        let mut tracker = Tracker::new(&provider, ledger, config());
        let stats = tracker.stats();

        let result = tokio::time::timeout(Duration::from_millis(50), tracker.run()).await;

        assert!(result.is_err(), "loop should still be running");
        let snapshot = stats.snapshot();
        assert!(snapshot.persist_failures >= 1);
        assert_eq!(snapshot.fixes_written, 0);
    }
}
