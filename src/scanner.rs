//! # Scan Orchestrator
//!
//! Walks the unit range, applies the retry policy and collects results.
//! The strategy is chosen once per scan from the request:
//!
//! | transport | concurrency | strategy |
//! |-----------|-------------|----------|
//! | TCP       | 1           | [`Strategy::PersistentTcp`] |
//! | TCP       | > 1         | [`Strategy::EphemeralTcp`] |
//! | serial    | any         | [`Strategy::BlockingSerial`] |
//!
//! Before any unit is probed the scanner opens one connection (or the
//! serial port). If that fails the scan returns
//! [`ScanError::ConnectionFailed`] without touching the range.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use voltage_modbus_scan::{ScanRequest, Scanner};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (trace_tx, mut trace_rx) = mpsc::unbounded_channel();
//! let request = ScanRequest::tcp("192.168.1.50", 502)
//!     .with_units(1, 32)
//!     .with_timeout(Duration::from_millis(500))
//!     .with_concurrency(8);
//!
//! let scanner = Scanner::new(request)?.with_trace_channel(trace_tx);
//! tokio::spawn(async move {
//!     while let Some(line) = trace_rx.recv().await {
//!         println!("{}", line);
//!     }
//! });
//!
//! let report = scanner.scan().await?;
//! for device in &report.found_devices {
//!     println!("unit {} -> {:?}", device.unit_id, device.value);
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classify::{classify, Classification, FoundDevice};
use crate::codec::{build_request, parse_response};
use crate::config::ScanRequest;
use crate::error::{AttemptError, ScanError, ScanResult};
use crate::protocol::{Framing, ModbusAddress, UnitId};
use crate::serial::{open_serial, run_serial_scan, ScanStop, SerialSession, SerialSettings};
use crate::trace::{ResultSink, TraceLog};
use crate::transport::{EphemeralTcpSession, PersistentTcpSession, TcpLink, TransportSession, TransportStats};
use crate::utils::format::{elapsed_secs, format_duration};

/// How units are reached during one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// One TCP connection, units probed one after another
    PersistentTcp,
    /// A connection per attempt, up to `concurrency` units in flight
    EphemeralTcp { concurrency: usize },
    /// One serial port on a blocking worker
    BlockingSerial,
}

impl Strategy {
    pub fn select(request: &ScanRequest) -> Self {
        if request.transport.is_serial() {
            Strategy::BlockingSerial
        } else if request.concurrency > 1 {
            Strategy::EphemeralTcp { concurrency: request.concurrency }
        } else {
            Strategy::PersistentTcp
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::PersistentTcp => "persistent TCP",
            Strategy::EphemeralTcp { .. } => "ephemeral TCP",
            Strategy::BlockingSerial => "blocking serial",
        }
    }
}

/// Hands a serial port over to the scanner and back
///
/// Whoever normally holds the port (a polling client, for instance) must
/// close it before the scan opens it. `reclaim_port` is called after every
/// serial scan, whether it succeeded, failed or was cancelled.
#[async_trait]
pub trait PortHandoff: Send + Sync {
    async fn release_port(&self, port: &str);
    async fn reclaim_port(&self, port: &str);
}

/// Result of a completed scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Units that answered, ordered by unit id
    pub found_devices: Vec<FoundDevice>,
    pub count: usize,
    pub scanned_range: RangeInclusive<UnitId>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub strategy: Strategy,
    pub stats: TransportStats,
    pub trace: Vec<String>,
}

impl ScanReport {
    /// Look up the result for one unit
    pub fn device(&self, unit_id: UnitId) -> Option<&FoundDevice> {
        self.found_devices.iter().find(|device| device.unit_id == unit_id)
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.found_devices.iter().map(|device| device.unit_id).collect()
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Per-unit attempt bookkeeping shared by every strategy
///
/// Builds the request frame, writes the trace lines and turns one attempt's
/// outcome into either a result or a retry.
#[derive(Debug, Clone)]
pub(crate) struct UnitProbe {
    framing: Framing,
    function_code: u8,
    register: ModbusAddress,
    attempts: u32,
    trace: TraceLog,
    results: ResultSink,
}

impl UnitProbe {
    pub(crate) fn new(request: &ScanRequest, trace: TraceLog, results: ResultSink) -> Self {
        Self {
            framing: request.framing(),
            function_code: request.register_kind.function_code(),
            register: request.register,
            attempts: request.attempts(),
            trace,
            results,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Request ADU for `unit`; the MBAP transaction id is the unit id
    pub(crate) fn request_frame(&self, unit: UnitId) -> Bytes {
        build_request(self.framing, unit, self.function_code, self.register, 1, unit as u16)
    }

    pub(crate) fn begin_attempt(&self, unit: UnitId, attempt: u32) {
        self.trace.unit(unit, format!("Attempt {}/{}", attempt, self.attempts));
    }

    pub(crate) fn trace_tx(&self, unit: UnitId, frame: &[u8]) {
        self.trace.packet(unit, "TX", frame);
    }

    /// Decide one attempt; `Some` ends probing for this unit
    pub(crate) fn settle(
        &self,
        unit: UnitId,
        result: Result<Vec<u8>, AttemptError>,
        elapsed: Duration,
    ) -> Option<FoundDevice> {
        let err = match result {
            Ok(raw) => {
                self.trace.packet(unit, "RX", &raw);
                match classify(parse_response(self.framing, &raw, unit)) {
                    Classification::Conclusive(outcome) => {
                        self.trace.unit(unit, format!("Response ({}) {}", elapsed_secs(elapsed), outcome.describe()));
                        let device = FoundDevice::new(unit, self.register, &outcome, &raw);
                        self.results.publish(&device);
                        return Some(device);
                    }
                    Classification::Inconclusive(err) => AttemptError::Frame(err),
                }
            }
            Err(err) => err,
        };
        self.trace.unit(unit, format!("Error - {} ({})", err, elapsed_secs(elapsed)));
        None
    }

    pub(crate) fn exhausted(&self, unit: UnitId) {
        self.trace.unit(unit, format!("No response after {} attempts", self.attempts));
    }

    /// Run every attempt for one unit on an async session
    pub(crate) async fn probe<S>(&self, session: &mut S, unit: UnitId) -> Option<FoundDevice>
    where
        S: TransportSession + ?Sized,
    {
        for attempt in 1..=self.attempts {
            self.begin_attempt(unit, attempt);
            let started = Instant::now();
            let result = match session.open_attempt().await {
                Ok(()) => {
                    let frame = self.request_frame(unit);
                    self.trace_tx(unit, &frame);
                    session.exchange(&frame).await
                }
                Err(err) => Err(err),
            };
            session.release().await;
            if let Some(device) = self.settle(unit, result, started.elapsed()) {
                return Some(device);
            }
        }
        self.exhausted(unit);
        None
    }
}

/// Probe units one after another on a single session
pub(crate) async fn scan_sequential<S>(
    session: &mut S,
    probe: &UnitProbe,
    units: RangeInclusive<UnitId>,
) -> Vec<FoundDevice>
where
    S: TransportSession + ?Sized,
{
    let mut found = Vec::new();
    for unit in units {
        if let Some(device) = probe.probe(session, unit).await {
            found.push(device);
        }
    }
    session.shutdown().await;
    found
}

/// Probe all units at once, at most `concurrency` in flight
///
/// Every unit gets its own session from `make_session`. The unit futures
/// are polled inside the caller's task, so dropping the returned future
/// drops every open connection with it.
pub(crate) async fn scan_concurrent<F, S>(
    make_session: F,
    probe: &UnitProbe,
    units: RangeInclusive<UnitId>,
    concurrency: usize,
) -> (Vec<FoundDevice>, TransportStats)
where
    F: Fn() -> S,
    S: TransportSession,
{
    let limiter = Semaphore::new(concurrency.max(1));
    let tasks = units.map(|unit| {
        let mut session = make_session();
        let limiter = &limiter;
        async move {
            let Ok(_permit) = limiter.acquire().await else {
                return (None, TransportStats::default());
            };
            let found = probe.probe(&mut session, unit).await;
            session.shutdown().await;
            (found, session.stats())
        }
    });

    let mut found = Vec::new();
    let mut stats = TransportStats::default();
    for (device, session_stats) in join_all(tasks).await {
        stats.merge(&session_stats);
        found.extend(device);
    }
    (found, stats)
}

/// Scan engine for one [`ScanRequest`]
pub struct Scanner {
    request: ScanRequest,
    strategy: Strategy,
    trace_sender: Option<UnboundedSender<String>>,
    results: ResultSink,
    cancel: CancellationToken,
    handoff: Option<Arc<dyn PortHandoff>>,
}

impl Scanner {
    /// Validate the request and pick a strategy
    pub fn new(request: ScanRequest) -> ScanResult<Self> {
        request.validate()?;
        let strategy = Strategy::select(&request);
        Ok(Self {
            request,
            strategy,
            trace_sender: None,
            results: ResultSink::default(),
            cancel: CancellationToken::new(),
            handoff: None,
        })
    }

    /// Stream trace lines as they are produced
    pub fn with_trace_channel(mut self, sender: UnboundedSender<String>) -> Self {
        self.trace_sender = Some(sender);
        self
    }

    /// Stream each result as soon as its unit is settled
    pub fn with_result_channel(mut self, sender: UnboundedSender<FoundDevice>) -> Self {
        self.results = ResultSink::new(Some(sender));
        self
    }

    /// Abort the scan when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Borrow the serial port from its usual owner for the scan
    pub fn with_port_handoff(mut self, handoff: Arc<dyn PortHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    /// Token that cancels this scanner's scans
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn request(&self) -> &ScanRequest {
        &self.request
    }

    /// Run the scan
    pub async fn scan(&self) -> ScanResult<ScanReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let trace = TraceLog::new(self.trace_sender.clone());
        let probe = UnitProbe::new(&self.request, trace.clone(), self.results.clone());

        info!(
            "Scanning units {}-{} on {} ({})",
            self.request.start_unit,
            self.request.end_unit,
            self.request.transport.describe(),
            self.strategy.name()
        );
        trace.line(format!(
            "Scanning units {}-{} on {} ({}, timeout {}, {} attempt(s))",
            self.request.start_unit,
            self.request.end_unit,
            self.request.transport.describe(),
            self.strategy.name(),
            format_duration(self.request.timeout),
            self.request.attempts()
        ));

        let outcome = match self.strategy {
            Strategy::BlockingSerial => self.scan_serial(&probe, &trace, clock).await,
            _ => self.until_aborted(self.scan_tcp(&probe, &trace), clock).await,
        };

        let (mut found_devices, stats) = match outcome {
            Ok(done) => done,
            Err(err) => {
                if matches!(err, ScanError::Cancelled { .. }) {
                    trace.line(format!("Scan cancelled after {}", elapsed_secs(clock.elapsed())));
                }
                warn!("Scan failed: {}", err);
                return Err(err);
            }
        };

        found_devices.sort_by_key(|device| device.unit_id);
        let duration = clock.elapsed();
        trace.line(format!(
            "Scan complete: found {} device(s) in {}",
            found_devices.len(),
            elapsed_secs(duration)
        ));
        info!("Scan complete: {} device(s) in {}", found_devices.len(), format_duration(duration));

        Ok(ScanReport {
            count: found_devices.len(),
            found_devices,
            scanned_range: self.request.units(),
            duration,
            started_at,
            strategy: self.strategy,
            stats,
            trace: trace.lines(),
        })
    }

    /// Race `work` against the caller's token and the scan deadline
    async fn until_aborted<T, F>(&self, work: F, started: Instant) -> ScanResult<T>
    where
        F: Future<Output = ScanResult<T>>,
    {
        tokio::select! {
            result = work => result,
            _ = self.cancel.cancelled() => Err(ScanError::cancelled("cancelled by caller")),
            err = self.deadline_elapsed(started) => Err(err),
        }
    }

    /// Resolves once the scan deadline passes; never without one
    async fn deadline_elapsed(&self, started: Instant) -> ScanError {
        match self.request.scan_deadline {
            Some(limit) => {
                tokio::time::sleep_until(started + limit).await;
                ScanError::deadline_exceeded(limit)
            }
            None => std::future::pending().await,
        }
    }

    async fn scan_tcp(&self, probe: &UnitProbe, trace: &TraceLog) -> ScanResult<(Vec<FoundDevice>, TransportStats)> {
        let link = TcpLink::from_request(&self.request)
            .ok_or_else(|| ScanError::internal("TCP scan requested for a serial transport"))?;

        trace.line(format!("Connecting to {}", link.target()));
        let stream = match link.connect().await {
            Ok(stream) => stream,
            Err(cause) => {
                trace.line(format!("Connection Failed: {}", cause));
                return Err(ScanError::connection_failed(cause, link.target()));
            }
        };
        trace.line(format!("Connected to {}", link.target()));

        match self.strategy {
            Strategy::EphemeralTcp { concurrency } => {
                drop(stream);
                let (found, mut stats) =
                    scan_concurrent(|| EphemeralTcpSession::new(link.clone()), probe, self.request.units(), concurrency)
                        .await;
                stats.connections += 1;
                Ok((found, stats))
            }
            _ => {
                let mut session = PersistentTcpSession::with_stream(link, stream);
                let found = scan_sequential(&mut session, probe, self.request.units()).await;
                Ok((found, session.stats()))
            }
        }
    }

    async fn scan_serial(
        &self,
        probe: &UnitProbe,
        trace: &TraceLog,
        started: Instant,
    ) -> ScanResult<(Vec<FoundDevice>, TransportStats)> {
        let settings = SerialSettings::from_transport(&self.request.transport)?;

        if let Some(handoff) = &self.handoff {
            trace.line(format!("Releasing {} for the scan", settings.port));
            handoff.release_port(&settings.port).await;
        }

        let result = self.run_serial_worker(settings.clone(), probe.clone(), trace.clone(), started).await;

        if let Some(handoff) = &self.handoff {
            handoff.reclaim_port(&settings.port).await;
            trace.line(format!("Returned {} to its owner", settings.port));
        }
        result
    }

    async fn run_serial_worker(
        &self,
        settings: SerialSettings,
        probe: UnitProbe,
        trace: TraceLog,
        started: Instant,
    ) -> ScanResult<(Vec<FoundDevice>, TransportStats)> {
        let worker_cancel = self.cancel.child_token();
        let stop = ScanStop::new(worker_cancel.clone(), started.into_std(), self.request.scan_deadline);
        let timeout = self.request.timeout;
        let units = self.request.units();

        let mut worker = tokio::task::spawn_blocking(move || {
            trace.line(format!("Opening serial port {}", settings.port));
            let port = match open_serial(&settings, timeout) {
                Ok(port) => port,
                Err(cause) => {
                    trace.line(format!("Connection Failed: {}", cause));
                    return Err(ScanError::connection_failed(cause, settings.port));
                }
            };
            // the port closes when the session drops
            let mut session = SerialSession::new(port, timeout).with_stop(stop);
            let found = run_serial_scan(&mut session, &probe, units)?;
            Ok((found, session.stats()))
        });

        let err = tokio::select! {
            joined = &mut worker => {
                return joined.map_err(|e| ScanError::internal(format!("serial worker failed: {}", e)))?;
            }
            _ = self.cancel.cancelled() => ScanError::cancelled("cancelled by caller"),
            err = self.deadline_elapsed(started) => err,
        };

        // reads poll the token, so the worker lets go of the port within one read slice
        worker_cancel.cancel();
        let _ = worker.await;
        Err(err)
    }
}
