//! # Blocking Serial Strategy
//!
//! RTU scans over a local serial port. The port is a blocking handle opened
//! once for the whole scan and driven from a blocking worker thread.
//!
//! Each read has its own deadline: the per-attempt timeout, cut short by the
//! scan deadline. Reads are issued in short slices so a cancelled or expired
//! scan releases the port within one slice instead of one full timeout.
//!
//! A response is read in two steps: five bytes first (enough for a complete
//! exception frame), then two more if the function code is not an exception.

use std::io::{self, Read, Write};
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::FoundDevice;
use crate::config::TransportConfig;
use crate::error::{AttemptError, ConnectFailure, ScanError, ScanResult};
use crate::protocol::{UnitId, EXCEPTION_FLAG};
use crate::scanner::UnitProbe;
use crate::transport::TransportStats;

/// First read of every response: unit, function, and three more bytes
const FIRST_READ_LEN: usize = 5;

/// Second read for a register response
const REGISTER_TAIL_LEN: usize = 2;

/// Longest single blocking read
const READ_SLICE: Duration = Duration::from_millis(50);

/// A serial line the scan loop can drive
pub trait SerialLink: Read + Write + Send {
    /// Discard unread input
    fn clear_input(&mut self) -> io::Result<()>;

    /// Bound the next blocking read
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }
}

/// Line settings for one serial scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baudrate: u32,
    pub parity: char,
    pub stopbits: u8,
    pub bytesize: u8,
}

impl SerialSettings {
    pub fn from_transport(transport: &TransportConfig) -> ScanResult<Self> {
        match transport {
            TransportConfig::Serial { port, baudrate, parity, stopbits, bytesize } => Ok(Self {
                port: port.clone(),
                baudrate: *baudrate,
                parity: *parity,
                stopbits: *stopbits,
                bytesize: *bytesize,
            }),
            TransportConfig::Tcp { .. } => Err(ScanError::internal("serial scan requested for a TCP transport")),
        }
    }

    fn parity(&self) -> Parity {
        match self.parity.to_ascii_uppercase() {
            'E' => Parity::Even,
            'O' => Parity::Odd,
            _ => Parity::None,
        }
    }

    fn stop_bits(&self) -> StopBits {
        if self.stopbits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        }
    }

    fn data_bits(&self) -> DataBits {
        match self.bytesize {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }
}

/// Open and reset the serial port
///
/// Blocking; call from a blocking worker.
pub fn open_serial(settings: &SerialSettings, timeout: Duration) -> Result<Box<dyn SerialPort>, ConnectFailure> {
    let port = tokio_serial::new(&settings.port, settings.baudrate)
        .data_bits(settings.data_bits())
        .parity(settings.parity())
        .stop_bits(settings.stop_bits())
        .timeout(timeout)
        .open()
        .map_err(|e| {
            warn!("Failed to open serial port {}: {}", settings.port, e);
            ConnectFailure::Other(e.to_string())
        })?;

    if let Err(e) = port.clear(ClearBuffer::All) {
        debug!("Failed to clear buffers on {}: {}", settings.port, e);
    }
    Ok(port)
}

/// Caller cancellation and the scan deadline, as seen from the worker thread
#[derive(Debug, Clone)]
pub struct ScanStop {
    cancel: CancellationToken,
    started: Instant,
    limit: Option<Duration>,
}

impl ScanStop {
    pub fn new(cancel: CancellationToken, started: Instant, limit: Option<Duration>) -> Self {
        Self { cancel, started, limit }
    }

    /// Never stops on its own
    pub fn never() -> Self {
        Self::new(CancellationToken::new(), Instant::now(), None)
    }

    fn deadline(&self) -> Option<Instant> {
        self.limit.map(|limit| self.started + limit)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline().is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline_passed()
    }

    /// Error to end the scan with once stopped
    pub fn error(&self) -> ScanError {
        match self.limit {
            Some(limit) if self.deadline_passed() => ScanError::deadline_exceeded(limit),
            _ => ScanError::cancelled("cancelled by caller"),
        }
    }

    /// Deadline for one read starting now
    fn read_deadline(&self, timeout: Duration) -> Instant {
        let due = Instant::now() + timeout;
        self.deadline().map_or(due, |deadline| deadline.min(due))
    }
}

/// Serial port plus exchange counters
pub struct SerialSession<L: SerialLink> {
    link: L,
    timeout: Duration,
    stop: ScanStop,
    stats: TransportStats,
}

impl<L: SerialLink> SerialSession<L> {
    pub fn new(link: L, timeout: Duration) -> Self {
        Self {
            link,
            timeout,
            stop: ScanStop::never(),
            stats: TransportStats { connections: 1, ..TransportStats::default() },
        }
    }

    pub fn with_stop(mut self, stop: ScanStop) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop(&self) -> &ScanStop {
        &self.stop
    }

    /// Send one RTU request and read its response
    ///
    /// Input is flushed after a failed exchange so a late reply cannot be
    /// taken as the answer to the next request.
    pub fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, AttemptError> {
        let result = self.exchange_inner(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;
        match &result {
            Ok(response) => {
                self.stats.responses_received += 1;
                self.stats.bytes_received += response.len() as u64;
            }
            Err(err) => {
                self.stats.errors += 1;
                if matches!(err, AttemptError::NoData { .. } | AttemptError::Timeout { .. }) {
                    self.stats.timeouts += 1;
                }
                self.discard_input();
            }
        }
        result
    }

    /// Drop whatever is left in the input buffer
    pub fn discard_input(&mut self) {
        if let Err(e) = self.link.clear_input() {
            debug!("Failed to clear serial input: {}", e);
        }
    }

    fn exchange_inner(&mut self, request: &[u8]) -> Result<Vec<u8>, AttemptError> {
        self.link.write_all(request)?;
        self.link.flush()?;

        let mut response = vec![0u8; FIRST_READ_LEN];
        let deadline = self.stop.read_deadline(self.timeout);
        let received = self.read_until(&mut response, deadline)?;
        if received < FIRST_READ_LEN {
            return Err(AttemptError::NoData { received });
        }

        if response[1] < EXCEPTION_FLAG {
            response.resize(FIRST_READ_LEN + REGISTER_TAIL_LEN, 0);
            let deadline = self.stop.read_deadline(self.timeout);
            let tail = self.read_until(&mut response[FIRST_READ_LEN..], deadline)?;
            // a short tail fails the CRC check in the parser
            response.truncate(FIRST_READ_LEN + tail);
        }
        Ok(response)
    }

    /// Fill `buf` until it is full, `deadline` passes or the scan stops
    fn read_until(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && !self.stop.is_stopped() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.link.set_read_timeout(remaining.min(READ_SLICE))?;
            match self.link.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    pub fn into_inner(self) -> L {
        self.link
    }
}

/// Probe every unit in order on an open serial session
///
/// Returns `Cancelled` once the session's stop fires, whether between two
/// attempts or in the middle of a read.
pub(crate) fn run_serial_scan<L: SerialLink>(
    session: &mut SerialSession<L>,
    probe: &UnitProbe,
    units: RangeInclusive<UnitId>,
) -> ScanResult<Vec<FoundDevice>> {
    let mut found = Vec::new();
    for unit in units {
        let mut outcome = None;
        for attempt in 1..=probe.attempts() {
            if session.stop().is_stopped() {
                return Err(session.stop().error());
            }
            probe.begin_attempt(unit, attempt);
            let frame = probe.request_frame(unit);
            probe.trace_tx(unit, &frame);
            let started = Instant::now();
            let result = session.exchange(&frame);
            if result.is_err() && session.stop().is_stopped() {
                return Err(session.stop().error());
            }
            let complete = result.is_ok();
            if let Some(device) = probe.settle(unit, result, started.elapsed()) {
                outcome = Some(device);
                break;
            }
            if complete {
                // rest of a corrupt or misaddressed reply
                session.discard_input();
            }
        }
        match outcome {
            Some(device) => found.push(device),
            None => probe.exhausted(unit),
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_exception_response, build_register_response};
    use crate::config::ScanRequest;
    use crate::protocol::Framing;
    use crate::trace::{ResultSink, TraceLog};
    use std::collections::{HashMap, VecDeque};

    /// Answers RTU requests from a table; silent units produce no bytes
    #[derive(Default)]
    struct MockLine {
        answers: HashMap<UnitId, VecDeque<Vec<u8>>>,
        pending: VecDeque<u8>,
        written: Vec<Vec<u8>>,
        clears: usize,
        read_timeout: Duration,
    }

    impl MockLine {
        fn answer(mut self, unit: UnitId, frames: Vec<Vec<u8>>) -> Self {
            self.answers.insert(unit, frames.into());
            self
        }
    }

    impl Read for MockLine {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                std::thread::sleep(self.read_timeout);
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            // one byte at a time, like a slow line
            buf[0] = self.pending.pop_front().unwrap_or_default();
            Ok(1)
        }
    }

    impl Write for MockLine {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.push(buf.to_vec());
            if let Some(frame) = self.answers.get_mut(&buf[0]).and_then(|queue| queue.pop_front()) {
                self.pending.extend(frame);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLink for MockLine {
        fn clear_input(&mut self) -> io::Result<()> {
            self.clears += 1;
            self.pending.clear();
            Ok(())
        }

        fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            assert!(timeout <= READ_SLICE);
            self.read_timeout = timeout;
            Ok(())
        }
    }

    const SHORT: Duration = Duration::from_millis(60);

    fn probe_for(request: &ScanRequest) -> (UnitProbe, TraceLog) {
        let trace = TraceLog::new(None);
        (UnitProbe::new(request, trace.clone(), ResultSink::default()), trace)
    }

    #[test]
    fn test_settings_mapping() {
        let settings = SerialSettings {
            port: "/dev/ttyUSB0".into(),
            baudrate: 19200,
            parity: 'e',
            stopbits: 2,
            bytesize: 7,
        };
        assert_eq!(settings.parity(), Parity::Even);
        assert_eq!(settings.stop_bits(), StopBits::Two);
        assert_eq!(settings.data_bits(), DataBits::Seven);

        let tcp = ScanRequest::tcp("gw", 502);
        assert!(SerialSettings::from_transport(&tcp.transport).is_err());
    }

    #[test]
    fn test_exchange_reads_register_response() {
        let response = build_register_response(Framing::Rtu, 1, 0x03, &[0x04D2], 0).to_vec();
        let mut session = SerialSession::new(MockLine::default().answer(1, vec![response.clone()]), SHORT);
        assert_eq!(session.exchange(&[0x01, 0x03, 0, 0, 0, 1, 0x84, 0x0A]).unwrap(), response);
        assert_eq!(session.stats().responses_received, 1);
    }

    #[test]
    fn test_exchange_reads_exception_in_one_step() {
        let response = build_exception_response(Framing::Rtu, 2, 0x03, 0x02, 0).to_vec();
        let mut session = SerialSession::new(MockLine::default().answer(2, vec![response.clone()]), SHORT);
        assert_eq!(session.exchange(&[0x02, 0x03, 0, 0, 0, 1, 0, 0]).unwrap(), response);
    }

    #[test]
    fn test_short_read_is_no_data_and_clears_input() {
        let mut session = SerialSession::new(MockLine::default().answer(3, vec![vec![0x03, 0x03]]), SHORT);
        let started = Instant::now();
        let err = session.exchange(&[0x03, 0x03, 0, 0, 0, 1, 0, 0]).unwrap_err();
        assert_eq!(err, AttemptError::NoData { received: 2 });
        assert!(started.elapsed() >= SHORT);

        let line = session.into_inner();
        assert_eq!(line.clears, 1);
        assert!(line.pending.is_empty());
    }

    #[test]
    fn test_serial_scan_retries_and_classifies() {
        let healthy = build_register_response(Framing::Rtu, 1, 0x03, &[1111], 0).to_vec();
        let exception = build_exception_response(Framing::Rtu, 2, 0x03, 0x0B, 0).to_vec();
        let mut corrupt = build_register_response(Framing::Rtu, 4, 0x03, &[7], 0).to_vec();
        let fixed = corrupt.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let line = MockLine::default()
            .answer(1, vec![healthy])
            .answer(2, vec![exception])
            .answer(4, vec![corrupt, fixed]);
        let request = ScanRequest::serial("/dev/null", 9600).with_units(1, 4).with_retries(1).with_timeout(SHORT);
        let mut session = SerialSession::new(line, request.timeout);

        let (probe, trace) = probe_for(&request);
        let found = run_serial_scan(&mut session, &probe, request.units()).unwrap();

        let units: Vec<UnitId> = found.iter().map(|device| device.unit_id).collect();
        assert_eq!(units, vec![1, 2, 4]);
        assert_eq!(found[0].value, Some(1111));
        assert_eq!(found[1].exception_code, Some(0x0B));
        assert_eq!(found[2].value, Some(7));

        let lines = trace.lines();
        assert!(lines.iter().any(|line| line.starts_with("Unit 3: Error - No data (0 bytes)")));
        assert!(lines.iter().any(|line| line == "Unit 3: No response after 2 attempts"));
        assert!(lines.iter().any(|line| line.starts_with("Unit 4: Error - CRC Error")));
        assert_eq!(lines.iter().filter(|line| line.starts_with("Unit 4: Attempt")).count(), 2);
    }

    #[test]
    fn test_corrupt_reply_leftovers_are_discarded() {
        // trailing noise after a bad frame must not prefix the retry's reply
        let mut noisy = build_register_response(Framing::Rtu, 4, 0x03, &[7], 0).to_vec();
        let fixed = noisy.clone();
        let last = noisy.len() - 1;
        noisy[last] ^= 0xFF;
        noisy.extend_from_slice(&[0xAA, 0xBB]);

        let line = MockLine::default().answer(4, vec![noisy, fixed]);
        let request = ScanRequest::serial("/dev/null", 9600).with_units(4, 4).with_retries(1).with_timeout(SHORT);
        let mut session = SerialSession::new(line, request.timeout);
        let (probe, trace) = probe_for(&request);

        let found = run_serial_scan(&mut session, &probe, request.units()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, Some(7));
        assert!(trace.lines().iter().any(|line| line.starts_with("Unit 4: Error - CRC Error")));
        assert_eq!(session.into_inner().clears, 1);
    }

    #[test]
    fn test_serial_scan_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stop = ScanStop::new(cancel, Instant::now(), None);
        let mut session = SerialSession::new(MockLine::default(), SHORT).with_stop(stop);
        let request = ScanRequest::serial("/dev/null", 9600).with_units(1, 10);
        let (probe, trace) = probe_for(&request);

        let err = run_serial_scan(&mut session, &probe, request.units()).unwrap_err();
        assert!(matches!(err, ScanError::Cancelled { ref reason } if reason == "cancelled by caller"));
        assert!(trace.lines().is_empty());
        assert!(session.into_inner().written.is_empty());
    }

    #[test]
    fn test_cancel_interrupts_a_read_in_progress() {
        let cancel = CancellationToken::new();
        let stop = ScanStop::new(cancel.clone(), Instant::now(), None);
        let mut session = SerialSession::new(MockLine::default(), Duration::from_secs(2)).with_stop(stop);
        let request = ScanRequest::serial("/dev/null", 9600).with_units(1, 10).with_retries(0);
        let (probe, trace) = probe_for(&request);

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let started = Instant::now();
        let err = run_serial_scan(&mut session, &probe, request.units()).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, ScanError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
        // the interrupted attempt is not reported as a unit failure
        assert!(!trace.lines().iter().any(|line| line.contains("Error -")));
    }

    #[test]
    fn test_scan_deadline_cuts_reads_short() {
        let limit = Duration::from_millis(150);
        let stop = ScanStop::new(CancellationToken::new(), Instant::now(), Some(limit));
        let mut session = SerialSession::new(MockLine::default(), Duration::from_secs(2)).with_stop(stop);
        let request = ScanRequest::serial("/dev/null", 9600).with_units(1, 10).with_retries(0);
        let (probe, _trace) = probe_for(&request);

        let started = Instant::now();
        let err = run_serial_scan(&mut session, &probe, request.units()).unwrap_err();
        let elapsed = started.elapsed();

        match err {
            ScanError::Cancelled { reason } => assert_eq!(reason, "scan deadline of 150ms exceeded"),
            other => panic!("expected deadline cancellation, got {:?}", other),
        }
        assert!(elapsed >= limit);
        assert!(elapsed < Duration::from_millis(500));
        assert_eq!(session.into_inner().written.len(), 1);
    }

    #[test]
    fn test_read_deadline_is_capped_by_scan_deadline() {
        let started = Instant::now();
        let stop = ScanStop::new(CancellationToken::new(), started, Some(Duration::from_millis(200)));
        assert!(stop.read_deadline(Duration::from_secs(3)) <= started + Duration::from_millis(200));
        assert!(ScanStop::never().read_deadline(Duration::from_secs(3)) > started + Duration::from_secs(2));
        assert!(!stop.is_stopped());
    }
}
