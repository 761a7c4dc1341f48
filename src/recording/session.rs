//! Recording session lifecycle
//!
//! A [`SessionController`] owns one capture source and one session ledger.
//! It moves through `Idle → Recording → Stopped`; `Stopped` is terminal and
//! keeps the finalized record so repeated `stop` calls return it again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::capture::{CaptureSource, Exchange};
use crate::config::{Config, FilterConfig};
use crate::matcher::{self, Matcher};
use crate::{RecorderError, Result};

use super::assembler::{prepare, PreparedExchange, Sequencer};
use super::entry::{default_scenario_name, iso_timestamp, Entry, SessionRecord};
use super::{DEFAULT_DRAIN_TIMEOUT_MS, DEFAULT_MAX_IN_FLIGHT};

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, nothing captured yet
    Idle,
    /// Capture source open, entries being appended
    Recording,
    /// Finalized
    Stopped,
}

/// Tuning for one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Scenario name; generated from construction time when `None`
    pub scenario: Option<String>,
    /// Maximum exchanges assembled concurrently
    pub max_in_flight: usize,
    /// Grace period for in-flight exchanges when stopping
    pub drain_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            scenario: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
        }
    }
}

impl SessionOptions {
    /// Options from the `[session]` config section
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            scenario: config.session.scenario.clone(),
            max_in_flight: config.session.max_in_flight,
            drain_timeout: Duration::from_millis(config.session.drain_timeout_ms),
        }
    }
}

/// What `stop` hands back
#[derive(Debug)]
pub struct StopReport {
    /// Finalized session record
    pub record: Arc<SessionRecord>,
    /// Failure releasing the capture source; reported on the first stop only
    pub release_error: Option<RecorderError>,
    /// In-flight exchanges abandoned after the drain timeout
    pub dropped: usize,
}

/// Entries and their counter; only touched under the session lock
#[derive(Debug, Default)]
struct Ledger {
    sequencer: Sequencer,
    entries: Vec<Entry>,
}

impl Ledger {
    fn commit(&mut self, prepared: PreparedExchange) -> &Entry {
        let entry = self.sequencer.seal(prepared);
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }
}

/// Live session; stays in place until `stop` has built the record so a
/// cancelled `stop` can be retried
struct Recording {
    started_at: String,
    base_url: String,
    ledger: Arc<Mutex<Ledger>>,
    shutdown: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<PumpStats>>,
    stats: PumpStats,
    released: bool,
    release_error: Option<RecorderError>,
}

enum State {
    Idle,
    Recording(Recording),
    Stopped(Arc<SessionRecord>),
}

/// Drives one recording session over a capture source
pub struct SessionController<S: CaptureSource> {
    source: S,
    scenario: String,
    filter: FilterConfig,
    matcher: Arc<Matcher>,
    options: SessionOptions,
    state: State,
}

impl<S: CaptureSource> SessionController<S> {
    /// Create an idle controller
    ///
    /// # Errors
    ///
    /// Returns error if the filter config is invalid
    pub fn new(source: S, filter: FilterConfig, options: SessionOptions) -> Result<Self> {
        filter.validate()?;
        if options.max_in_flight == 0 {
            return Err(RecorderError::ConfigError(
                "max_in_flight must be > 0".to_string(),
            ));
        }

        let matcher = Matcher::new(&filter.include_patterns, &filter.exclude_patterns)?;
        let scenario = options
            .scenario
            .clone()
            .unwrap_or_else(|| default_scenario_name(Utc::now()));

        Ok(Self {
            source,
            scenario,
            filter,
            matcher: Arc::new(matcher),
            options,
            state: State::Idle,
        })
    }

    /// Create an idle controller from a full config
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid
    pub fn from_config(source: S, config: &Config) -> Result<Self> {
        Self::new(
            source,
            config.filter.clone(),
            SessionOptions::from_config(config),
        )
    }

    /// Scenario name
    #[must_use]
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        match self.state {
            State::Idle => SessionState::Idle,
            State::Recording(_) => SessionState::Recording,
            State::Stopped(_) => SessionState::Stopped,
        }
    }

    /// Number of entries committed so far
    pub async fn entry_count(&self) -> usize {
        match &self.state {
            State::Idle => 0,
            State::Recording(recording) => recording.ledger.lock().await.entries.len(),
            State::Stopped(record) => record.entries.len(),
        }
    }

    /// Open the capture source on `url` and start recording
    ///
    /// # Errors
    ///
    /// Returns error if the controller is not idle, `url` is not a valid
    /// URL, or the capture source fails to open. On error the controller
    /// stays idle.
    pub async fn start(&mut self, url: &str) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(RecorderError::InvalidState(format!(
                "cannot start session '{}' twice",
                self.scenario
            )));
        }

        let base_url = matcher::origin(url)?;
        let started_at = iso_timestamp(Utc::now());

        let events = self.source.open(url).await?;

        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let pump = Pump {
            matcher: Arc::clone(&self.matcher),
            ledger: Arc::clone(&ledger),
            body_limit: self.filter.body_size_limit,
            max_in_flight: self.options.max_in_flight,
            drain_timeout: self.options.drain_timeout,
        };
        let pump = tokio::spawn(pump.run(events, shutdown_rx));

        info!("Recording started: {} ({})", self.scenario, url);

        self.state = State::Recording(Recording {
            started_at,
            base_url,
            ledger,
            shutdown: Some(shutdown),
            pump: Some(pump),
            stats: PumpStats::default(),
            released: false,
            release_error: None,
        });
        Ok(())
    }

    /// Stop recording, release the capture source and return the record
    ///
    /// Calling `stop` again returns the same record without touching the
    /// capture source.
    ///
    /// # Errors
    ///
    /// Returns error if the session was never started
    pub async fn stop(&mut self) -> Result<StopReport> {
        let recording = match &mut self.state {
            State::Idle => {
                return Err(RecorderError::InvalidState(format!(
                    "session '{}' was never started",
                    self.scenario
                )));
            }
            State::Stopped(record) => {
                return Ok(StopReport {
                    record: Arc::clone(record),
                    release_error: None,
                    dropped: 0,
                });
            }
            State::Recording(recording) => recording,
        };

        // The pump may already be gone if the source closed its stream
        if let Some(shutdown) = recording.shutdown.take() {
            shutdown.send(()).ok();
        }
        if let Some(pump) = recording.pump.as_mut() {
            recording.stats = match pump.await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!("Capture pump failed: {}", e);
                    PumpStats::default()
                }
            };
            recording.pump = None;

            let stats = recording.stats;
            debug!(
                "Capture pump finished: {} received, {} out of scope, {} dropped, {} unprocessed",
                stats.received, stats.filtered, stats.dropped, stats.unprocessed
            );
        }

        if !recording.released {
            if let Err(e) = self.source.close().await {
                warn!("Failed to release capture source: {}", e);
                recording.release_error = Some(RecorderError::Release(e.to_string()));
            }
            recording.released = true;
        }

        let entries = std::mem::take(&mut recording.ledger.lock().await.entries);
        let record = Arc::new(SessionRecord {
            scenario: self.scenario.clone(),
            recorded_at: recording.started_at.clone(),
            base_url: recording.base_url.clone(),
            config: self.filter.clone(),
            entries,
        });
        let release_error = recording.release_error.take();
        let dropped = recording.stats.dropped;

        info!(
            "Recording stopped: {} ({} entries)",
            record.scenario,
            record.entries.len()
        );

        self.state = State::Stopped(Arc::clone(&record));
        Ok(StopReport {
            record,
            release_error,
            dropped,
        })
    }
}

/// Counters reported by the pump when it exits
#[derive(Debug, Default, Clone, Copy)]
struct PumpStats {
    received: usize,
    filtered: usize,
    dropped: usize,
    unprocessed: usize,
}

/// Background task draining the exchange channel into the ledger
struct Pump {
    matcher: Arc<Matcher>,
    ledger: Arc<Mutex<Ledger>>,
    body_limit: usize,
    max_in_flight: usize,
    drain_timeout: Duration,
}

impl Pump {
    async fn run(
        self,
        mut events: mpsc::Receiver<Exchange>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> PumpStats {
        let mut tasks = JoinSet::new();
        let mut stats = PumpStats::default();
        let mut source_open = true;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Exchange task failed: {}", e);
                    }
                }
                next = events.recv(), if source_open && tasks.len() < self.max_in_flight => {
                    match next {
                        Some(exchange) => {
                            stats.received += 1;
                            self.dispatch(&mut tasks, exchange, &mut stats);
                        }
                        None => {
                            debug!("Capture source closed its event stream");
                            source_open = false;
                        }
                    }
                }
            }
        }

        // Stopped: nothing new is accepted, in-flight work gets a grace period
        events.close();
        while events.try_recv().is_ok() {
            stats.unprocessed += 1;
        }

        if !tasks.is_empty() {
            debug!("Draining {} in-flight exchanges", tasks.len());
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        warn!("Exchange task failed: {}", e);
                    }
                }
            })
            .await;

            if drained.is_err() {
                stats.dropped = tasks.len();
                warn!(
                    "Dropping {} exchanges still in flight after {:?}",
                    stats.dropped, self.drain_timeout
                );
                tasks.shutdown().await;
            }
        }

        stats
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, exchange: Exchange, stats: &mut PumpStats) {
        let Some(path) = self.matcher.scope(&exchange.request.url) else {
            stats.filtered += 1;
            return;
        };

        let ledger = Arc::clone(&self.ledger);
        let body_limit = self.body_limit;
        tasks.spawn(async move {
            let prepared = prepare(exchange, path, body_limit).await;

            let mut ledger = ledger.lock().await;
            let entry = ledger.commit(prepared);
            info!(
                "[{}] {} {} => {}",
                entry.seq, entry.request.method, entry.request.url, entry.response.status
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ready, CapturedRequest, CapturedResponse};
    use crate::headers::Headers;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ChannelSource {
        tx: Option<mpsc::Sender<Exchange>>,
        closed: Arc<AtomicUsize>,
        fail_open: bool,
    }

    impl CaptureSource for ChannelSource {
        async fn open(&mut self, _url: &str) -> Result<mpsc::Receiver<Exchange>> {
            if self.fail_open {
                return Err(RecorderError::Navigation("net::ERR_NAME_NOT_RESOLVED".to_string()));
            }
            let (tx, rx) = mpsc::channel(16);
            self.tx = Some(tx);
            Ok(rx)
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.tx = None;
            Ok(())
        }
    }

    fn exchange(url: &str) -> Exchange {
        Exchange {
            request: CapturedRequest {
                method: "GET".to_string(),
                url: url.to_string(),
                headers: Headers::new(),
                body: ready(Ok(None)),
            },
            response: CapturedResponse {
                status: 200,
                status_text: "OK".to_string(),
                headers: Headers::new(),
                body: ready(Ok("{}".to_string())),
            },
            page_url: "https://example.com/".to_string(),
            timing: None,
        }
    }

    fn controller(source: ChannelSource) -> SessionController<ChannelSource> {
        let options = SessionOptions {
            scenario: Some("unit".to_string()),
            ..SessionOptions::default()
        };
        SessionController::new(source, FilterConfig::default(), options).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut session = controller(ChannelSource::default());
        assert_eq!(session.state(), SessionState::Idle);

        session.start("https://example.com/home").await.unwrap();
        assert_eq!(session.state(), SessionState::Recording);

        let tx = session.source.tx.clone().unwrap();
        tx.send(exchange("https://example.com/api/rooms")).await.unwrap();
        tx.send(exchange("https://example.com/logo.png")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.entry_count().await, 1);

        let report = session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(report.record.scenario, "unit");
        assert_eq!(report.record.base_url, "https://example.com");
        assert_eq!(report.record.entries.len(), 1);
        assert_eq!(report.record.entries[0].request.url, "/api/rooms");
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut session = controller(ChannelSource::default());
        session.start("https://example.com").await.unwrap();
        assert!(matches!(
            session.start("https://example.com").await,
            Err(RecorderError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_rejected() {
        let mut session = controller(ChannelSource::default());
        assert!(matches!(
            session.stop().await,
            Err(RecorderError::InvalidState(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_idle() {
        let source = ChannelSource {
            fail_open: true,
            ..ChannelSource::default()
        };
        let mut session = controller(source);

        let result = session.start("https://unreachable.invalid").await;
        assert!(matches!(result, Err(RecorderError::Navigation(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_url() {
        let mut session = controller(ChannelSource::default());
        assert!(matches!(
            session.start("not a url").await,
            Err(RecorderError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let closed = Arc::new(AtomicUsize::new(0));
        let source = ChannelSource {
            closed: Arc::clone(&closed),
            ..ChannelSource::default()
        };
        let mut session = controller(source);
        session.start("https://example.com").await.unwrap();

        let tx = session.source.tx.clone().unwrap();
        tx.send(exchange("https://example.com/api/a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = session.stop().await.unwrap();
        let second = session.stop().await.unwrap();

        assert_eq!(first.record.entries.len(), 1);
        assert_eq!(second.record.entries.len(), 1);
        assert!(Arc::ptr_eq(&first.record, &second.record));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_stop_can_be_retried() {
        let closed = Arc::new(AtomicUsize::new(0));
        let source = ChannelSource {
            closed: Arc::clone(&closed),
            ..ChannelSource::default()
        };
        let options = SessionOptions {
            scenario: Some("unit".to_string()),
            drain_timeout: Duration::from_secs(10),
            ..SessionOptions::default()
        };
        let mut session = SessionController::new(source, FilterConfig::default(), options).unwrap();
        session.start("https://example.com").await.unwrap();

        let (release, gate) = oneshot::channel::<()>();
        let mut slow = exchange("https://example.com/api/slow");
        slow.response.body = async move {
            gate.await.ok();
            Ok("{}".to_string())
        }
        .boxed();
        let tx = session.source.tx.clone().unwrap();
        tx.send(slow).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancelled = tokio::time::timeout(Duration::from_millis(50), session.stop()).await;
        assert!(cancelled.is_err());
        assert_eq!(session.state(), SessionState::Recording);
        assert!(matches!(
            session.start("https://example.com").await,
            Err(RecorderError::InvalidState(_))
        ));

        release.send(()).unwrap();
        let report = session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(report.record.entries.len(), 1);
        assert_eq!(report.record.entries[0].request.url, "/api/slow");
        assert_eq!(report.dropped, 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_generated_scenario_name() {
        let session = SessionController::new(
            ChannelSource::default(),
            FilterConfig::default(),
            SessionOptions::default(),
        )
        .unwrap();
        assert!(session.scenario().starts_with("scenario_"));
        assert_eq!(session.scenario().len(), "scenario_20261018_090507".len());
    }

    #[test]
    fn test_zero_in_flight_rejected() {
        let options = SessionOptions {
            max_in_flight: 0,
            ..SessionOptions::default()
        };
        assert!(
            SessionController::new(ChannelSource::default(), FilterConfig::default(), options)
                .is_err()
        );
    }
}
