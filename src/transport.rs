//! # Scan Transport Layer
//!
//! Transport sessions own the connection used to probe units and perform
//! exactly-sized reads under a time budget. Two TCP strategies implement
//! [`TransportSession`]:
//!
//! ### Persistent (`PersistentTcpSession`)
//! - One connection reused across the whole unit range
//! - Dropped on any transport error and reopened by the next attempt
//!
//! ### Ephemeral (`EphemeralTcpSession`)
//! - A fresh connection for every attempt, closed right after it
//! - Used when several units are probed in parallel
//!
//! The serial strategy lives in [`crate::serial`]; serial ports are blocking
//! handles and do not fit this async interface.
//!
//! ## Reads
//!
//! Every exact read computes its deadline once and hands each partial `read`
//! only the time left until that deadline, so a peer trickling bytes cannot
//! stretch an attempt past its timeout. A zero-length read means the peer
//! closed the connection.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_modbus_scan::codec::build_request;
//! use voltage_modbus_scan::protocol::Framing;
//! use voltage_modbus_scan::transport::{PersistentTcpSession, TcpLink, TransportSession};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let link = TcpLink::new("192.168.1.50", 502, Framing::Mbap, Duration::from_secs(1));
//! let mut session = PersistentTcpSession::new(link);
//! session.open_attempt().await?;
//! let response = session.exchange(&build_request(Framing::Mbap, 1, 0x03, 0, 1, 1)).await?;
//! println!("{} bytes", response.len());
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::codec::expected_rtu_remainder;
use crate::config::{ScanRequest, TransportConfig};
use crate::error::{AttemptError, ConnectFailure};
use crate::protocol::{Framing, MBAP_HEADER_LEN};

/// Largest MBAP length field a valid response can carry (unit id + 253 byte PDU)
const MAX_MBAP_LENGTH: usize = 254;

/// Transport statistics for one scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub connections: u64,
    pub connect_failures: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    /// Add another session's counters to this one
    pub fn merge(&mut self, other: &TransportStats) {
        self.connections += other.connections;
        self.connect_failures += other.connect_failures;
        self.requests_sent += other.requests_sent;
        self.responses_received += other.responses_received;
        self.timeouts += other.timeouts;
        self.errors += other.errors;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
    }

    fn record_exchange(&mut self, sent: usize, result: &Result<Vec<u8>, AttemptError>) {
        self.requests_sent += 1;
        self.bytes_sent += sent as u64;
        match result {
            Ok(response) => {
                self.responses_received += 1;
                self.bytes_received += response.len() as u64;
            }
            Err(AttemptError::Timeout { .. }) => {
                self.timeouts += 1;
                self.errors += 1;
            }
            Err(_) => self.errors += 1,
        }
    }
}

/// One connection strategy used by the scan orchestrator
///
/// An attempt is `open_attempt`, then `exchange` if that succeeded, then
/// always `release`. `shutdown` closes whatever is still open at the end of
/// the scan.
#[async_trait]
pub trait TransportSession: Send {
    /// Make sure a connection is available for the next exchange
    async fn open_attempt(&mut self) -> Result<(), AttemptError>;

    /// Send one request ADU and read back one response ADU
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, AttemptError>;

    /// End of one attempt
    async fn release(&mut self);

    /// End of the scan
    async fn shutdown(&mut self) {}

    /// Counters accumulated by this session
    fn stats(&self) -> TransportStats;
}

/// Read exactly `buf.len()` bytes within `budget`
pub async fn read_exact_within<R>(reader: &mut R, buf: &mut [u8], budget: Duration) -> Result<(), AttemptError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = Instant::now() + budget;
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AttemptError::timeout(budget));
        }
        match timeout(remaining, reader.read(&mut buf[filled..])).await {
            Err(_) => return Err(AttemptError::timeout(budget)),
            Ok(Ok(0)) => return Err(AttemptError::Closed),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read one complete response ADU from a stream
///
/// MBAP responses are sized by their length field. RTU responses carried
/// over TCP have no length field, so the size is inferred from the function
/// code for a single-register read.
pub async fn read_response<R>(reader: &mut R, framing: Framing, budget: Duration) -> Result<Vec<u8>, AttemptError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match framing {
        Framing::Mbap => {
            let mut frame = vec![0u8; MBAP_HEADER_LEN];
            read_exact_within(reader, &mut frame, budget).await?;
            let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
            if length > MAX_MBAP_LENGTH {
                return Err(AttemptError::io(format!("MBAP length {} out of range", length)));
            }
            // the unit id counted by the length field is already in the header
            let remainder = length.saturating_sub(1);
            frame.resize(MBAP_HEADER_LEN + remainder, 0);
            read_exact_within(reader, &mut frame[MBAP_HEADER_LEN..], budget).await?;
            Ok(frame)
        }
        Framing::Rtu => {
            let mut frame = vec![0u8; 2];
            read_exact_within(reader, &mut frame, budget).await?;
            let remainder = expected_rtu_remainder(frame[1]);
            frame.resize(2 + remainder, 0);
            read_exact_within(reader, &mut frame[2..], budget).await?;
            Ok(frame)
        }
    }
}

/// Write a request and read its response on an open stream
pub async fn exchange_on<S>(stream: &mut S, framing: Framing, request: &[u8], budget: Duration) -> Result<Vec<u8>, AttemptError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match timeout(budget, stream.write_all(request)).await {
        Err(_) => return Err(AttemptError::timeout(budget)),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(())) => {}
    }
    read_response(stream, framing, budget).await
}

/// Addressing and timing shared by the TCP sessions
#[derive(Debug, Clone)]
pub struct TcpLink {
    host: String,
    port: u16,
    framing: Framing,
    timeout: Duration,
}

impl TcpLink {
    pub fn new<S: Into<String>>(host: S, port: u16, framing: Framing, timeout: Duration) -> Self {
        Self { host: host.into(), port, framing, timeout }
    }

    /// Build the link for a TCP scan request; `None` for serial transports
    pub fn from_request(request: &ScanRequest) -> Option<Self> {
        match &request.transport {
            TransportConfig::Tcp { host, port, .. } => {
                Some(Self::new(host.clone(), *port, request.framing(), request.timeout))
            }
            TransportConfig::Serial { .. } => None,
        }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a connection, classifying the failure
    ///
    /// Resolution and every connect try share one per-attempt timeout.
    /// Resolved addresses are tried in order; the failure of the last one is
    /// reported.
    pub async fn connect(&self) -> Result<TcpStream, ConnectFailure> {
        let stream = within(self.timeout, async {
            let addrs = self.resolve().await?;
            connect_any(addrs, |addr| TcpStream::connect(addr)).await
        })
        .await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>, ConnectFailure> {
        match lookup_host((self.host.as_str(), self.port)).await {
            Ok(addrs) => Ok(addrs.collect()),
            Err(e) => {
                debug!("Failed to resolve {}: {}", self.host, e);
                Err(ConnectFailure::NameResolution)
            }
        }
    }
}

/// Run a whole connect sequence under one budget
async fn within<T, F>(budget: Duration, connecting: F) -> Result<T, ConnectFailure>
where
    F: Future<Output = Result<T, ConnectFailure>>,
{
    timeout(budget, connecting).await.unwrap_or(Err(ConnectFailure::Timeout))
}

/// Try each address in order until one connects
async fn connect_any<T, F, Fut>(addrs: Vec<SocketAddr>, mut connect: F) -> Result<T, ConnectFailure>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut failure = ConnectFailure::NameResolution;
    for addr in addrs {
        match connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Failed to connect to {}: {}", addr, e);
                failure = ConnectFailure::from_io(&e);
            }
        }
    }
    Err(failure)
}

/// One connection reused for every unit
pub struct PersistentTcpSession {
    link: TcpLink,
    stream: Option<TcpStream>,
    stats: TransportStats,
}

impl PersistentTcpSession {
    pub fn new(link: TcpLink) -> Self {
        Self { link, stream: None, stats: TransportStats::default() }
    }

    /// Start from an already open connection
    pub fn with_stream(link: TcpLink, stream: TcpStream) -> Self {
        let mut session = Self::new(link);
        session.stream = Some(stream);
        session.stats.connections = 1;
        session
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl TransportSession for PersistentTcpSession {
    async fn open_attempt(&mut self) -> Result<(), AttemptError> {
        if self.stream.is_none() {
            match self.link.connect().await {
                Ok(stream) => {
                    self.stats.connections += 1;
                    self.stream = Some(stream);
                }
                Err(cause) => {
                    self.stats.connect_failures += 1;
                    return Err(AttemptError::Connect { cause });
                }
            }
        }
        Ok(())
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, AttemptError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(AttemptError::Closed);
        };
        let result = exchange_on(stream, self.link.framing, request, self.link.timeout).await;
        self.stats.record_exchange(request.len(), &result);
        if matches!(&result, Err(err) if err.is_transport_error()) {
            // leftover bytes would be read as the next unit's response
            self.stream = None;
        }
        result
    }

    async fn release(&mut self) {}

    async fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// A fresh connection per attempt
pub struct EphemeralTcpSession {
    link: TcpLink,
    stream: Option<TcpStream>,
    stats: TransportStats,
}

impl EphemeralTcpSession {
    pub fn new(link: TcpLink) -> Self {
        Self { link, stream: None, stats: TransportStats::default() }
    }
}

#[async_trait]
impl TransportSession for EphemeralTcpSession {
    async fn open_attempt(&mut self) -> Result<(), AttemptError> {
        match self.link.connect().await {
            Ok(stream) => {
                self.stats.connections += 1;
                self.stream = Some(stream);
                Ok(())
            }
            Err(cause) => {
                self.stats.connect_failures += 1;
                Err(AttemptError::Connect { cause })
            }
        }
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, AttemptError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(AttemptError::Closed);
        };
        let result = exchange_on(stream, self.link.framing, request, self.link.timeout).await;
        self.stats.record_exchange(request.len(), &result);
        result
    }

    async fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn shutdown(&mut self) {
        self.release().await;
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_exception_response, build_register_response, build_request};
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    const BUDGET: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_read_mbap_in_chunks() {
        let frame = build_register_response(Framing::Mbap, 1, 0x03, &[0x04D2], 1);
        let mut mock = Builder::new()
            .read(&frame[..3])
            .read(&frame[3..8])
            .read(&frame[8..])
            .build();

        let response = read_response(&mut mock, Framing::Mbap, BUDGET).await.unwrap();
        assert_eq!(response, frame.to_vec());
    }

    #[tokio::test]
    async fn test_read_rtu_exception_and_success() {
        let exception = build_exception_response(Framing::Rtu, 4, 0x03, 0x0B, 0);
        assert_eq!(exception.len(), 5);
        let mut mock = Builder::new().read(&exception[..1]).read(&exception[1..]).build();
        let response = read_response(&mut mock, Framing::Rtu, BUDGET).await.unwrap();
        assert_eq!(response, exception.to_vec());

        let success = build_register_response(Framing::Rtu, 1, 0x04, &[1111], 0);
        assert_eq!(success.len(), 7);
        let mut mock = Builder::new().read(&success).build();
        let response = read_response(&mut mock, Framing::Rtu, BUDGET).await.unwrap();
        assert_eq!(response, success.to_vec());
    }

    #[tokio::test]
    async fn test_read_times_out_on_silence() {
        let (mut client, _server) = tokio::io::duplex(64);
        let started = std::time::Instant::now();
        let err = read_response(&mut client, Framing::Mbap, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, AttemptError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_partial_frame_then_silence_times_out() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0x00, 0x01, 0x00]).await.unwrap();
        let err = read_response(&mut client, Framing::Mbap, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, AttemptError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_read_reports_closed_peer() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        let err = read_response(&mut client, Framing::Rtu, BUDGET).await.unwrap_err();
        assert_eq!(err, AttemptError::Closed);
    }

    #[tokio::test]
    async fn test_oversized_mbap_length_rejected() {
        let mut mock = Builder::new().read(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01]).build();
        let err = read_response(&mut mock, Framing::Mbap, BUDGET).await.unwrap_err();
        assert!(matches!(err, AttemptError::Io { .. }));
    }

    #[tokio::test]
    async fn test_exchange_writes_then_reads() {
        let request = build_request(Framing::Mbap, 2, 0x03, 0, 1, 2);
        let response = build_exception_response(Framing::Mbap, 2, 0x03, 0x02, 2);
        let mut mock = Builder::new().write(&request).read(&response).build();

        let raw = exchange_on(&mut mock, Framing::Mbap, &request, BUDGET).await.unwrap();
        assert_eq!(raw, response.to_vec());
    }

    #[tokio::test]
    async fn test_connect_refused_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let link = TcpLink::new("127.0.0.1", port, Framing::Mbap, Duration::from_secs(1));
        assert_eq!(link.connect().await.unwrap_err(), ConnectFailure::Refused);
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let link = TcpLink::new("no-such-gateway.invalid", 502, Framing::Mbap, Duration::from_secs(2));
        let cause = link.connect().await.unwrap_err();
        assert!(matches!(cause, ConnectFailure::NameResolution | ConnectFailure::Timeout));
    }

    #[tokio::test]
    async fn test_connect_budget_spans_every_address() {
        let addrs: Vec<SocketAddr> = (1..=3).map(|n| SocketAddr::from(([192, 0, 2, n], 502))).collect();
        let tried = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = tried.clone();

        let started = Instant::now();
        let result: Result<(), ConnectFailure> = within(
            Duration::from_millis(100),
            connect_any(addrs, move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {
                    // a gateway that drops SYNs
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Err(io::Error::from(io::ErrorKind::TimedOut))
                }
            }),
        )
        .await;

        assert_eq!(result.unwrap_err(), ConnectFailure::Timeout);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(tried.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_any_falls_through_to_next_address() {
        let addrs: Vec<SocketAddr> = vec![([192, 0, 2, 1], 502).into(), ([192, 0, 2, 2], 502).into()];
        let refusing = addrs[0];
        let connected = connect_any(addrs.clone(), move |addr| async move {
            if addr == refusing {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            } else {
                Ok(addr)
            }
        })
        .await;
        assert_eq!(connected.unwrap(), addrs[1]);

        let refused: Result<(), _> = connect_any(vec![([192, 0, 2, 1], 502).into()], |_| async {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        })
        .await;
        assert_eq!(refused.unwrap_err(), ConnectFailure::Refused);
    }

    #[tokio::test]
    async fn test_persistent_session_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            while socket.read_exact(&mut request).await.is_ok() {
                let response = build_register_response(Framing::Mbap, request[6], 0x03, &[request[6] as u16], 0);
                socket.write_all(&response).await.unwrap();
            }
        });

        let link = TcpLink::new("127.0.0.1", port, Framing::Mbap, BUDGET);
        let mut session = PersistentTcpSession::new(link);
        for unit in 1..=3u8 {
            session.open_attempt().await.unwrap();
            let raw = session.exchange(&build_request(Framing::Mbap, unit, 0x03, 0, 1, unit as u16)).await.unwrap();
            assert_eq!(raw[6], unit);
            session.release().await;
            assert!(session.is_connected());
        }
        session.shutdown().await;

        let stats = session.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.requests_sent, 3);
        assert_eq!(stats.responses_received, 3);
    }

    #[tokio::test]
    async fn test_persistent_session_drops_connection_on_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // accept and never answer
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let link = TcpLink::new("127.0.0.1", port, Framing::Mbap, Duration::from_millis(50));
        let mut session = PersistentTcpSession::new(link);
        session.open_attempt().await.unwrap();
        let err = session.exchange(&build_request(Framing::Mbap, 1, 0x03, 0, 1, 1)).await.unwrap_err();
        assert!(matches!(err, AttemptError::Timeout { .. }));
        assert!(!session.is_connected());

        session.open_attempt().await.unwrap();
        assert_eq!(session.stats().connections, 2);
        assert_eq!(session.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_ephemeral_session_reconnects_every_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 8];
                    if socket.read_exact(&mut request).await.is_ok() {
                        let response = build_register_response(Framing::Rtu, request[0], request[1], &[42], 0);
                        let _ = socket.write_all(&response).await;
                    }
                });
            }
        });

        let link = TcpLink::new("127.0.0.1", port, Framing::Rtu, BUDGET);
        let mut session = EphemeralTcpSession::new(link);
        for _ in 0..2 {
            session.open_attempt().await.unwrap();
            let raw = session.exchange(&build_request(Framing::Rtu, 9, 0x04, 0, 1, 0)).await.unwrap();
            assert_eq!(raw.len(), 7);
            session.release().await;
        }
        assert_eq!(session.stats().connections, 2);
        assert_eq!(session.exchange(&[0x01]).await.unwrap_err(), AttemptError::Closed);
    }
}
