/// Modbus gateway simulator
///
/// A TCP listener that answers read requests for several unit ids, each with
/// its own behaviour. Speaks MBAP or RTU-over-TCP. Integration tests and the
/// `mock-gateway` binary scan against it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::codec::{build_exception_response, build_register_response};
use crate::crc::verify_trailing_crc;
use crate::error::{ScanError, ScanResult};
use crate::protocol::{Framing, ModbusException, RegisterKind, UnitId, MBAP_HEADER_LEN};

/// RTU read request: unit, function, address, count, CRC
const RTU_REQUEST_LEN: usize = 8;

/// How one simulated unit reacts to a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitProfile {
    /// Answers with this register value
    Healthy(u16),
    /// Answers with this exception code
    Exception(u8),
    /// Never answers
    Silent,
    /// Answers after a delay
    Slow { value: u16, delay: Duration },
    /// Ignores the first `fail_first` requests, then answers
    Flaky { value: u16, fail_first: u32 },
}

/// Simulator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub connections: u64,
    pub requests: u64,
    pub responses: u64,
    pub ignored: u64,
}

struct SharedState {
    framing: Framing,
    profiles: HashMap<UnitId, UnitProfile>,
    /// Requests seen per flaky unit, across connections
    flaky_seen: Mutex<HashMap<UnitId, u32>>,
    stats: Mutex<SimulatorStats>,
}

impl SharedState {
    fn bump<F: FnOnce(&mut SimulatorStats)>(&self, update: F) {
        update(&mut self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }
}

/// Multi-unit Modbus gateway on a local port
pub struct GatewaySimulator {
    framing: Framing,
    profiles: HashMap<UnitId, UnitProfile>,
    state: Option<Arc<SharedState>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl GatewaySimulator {
    /// Create a simulator with no units; unconfigured units never answer
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            profiles: HashMap::new(),
            state: None,
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Units 1-6 with one of each behaviour
    ///
    /// 1 healthy (1111), 2 illegal data address, 3 silent, 4 gateway target
    /// failed to respond, 5 slow (5555 after 200 ms), 6 flaky (123, first
    /// request ignored).
    pub fn mock_gateway(framing: Framing) -> Self {
        Self::new(framing)
            .with_unit(1, UnitProfile::Healthy(1111))
            .with_unit(2, UnitProfile::Exception(ModbusException::IllegalDataAddress as u8))
            .with_unit(3, UnitProfile::Silent)
            .with_unit(4, UnitProfile::Exception(ModbusException::GatewayTargetDeviceFailedToRespond as u8))
            .with_unit(5, UnitProfile::Slow { value: 5555, delay: Duration::from_millis(200) })
            .with_unit(6, UnitProfile::Flaky { value: 123, fail_first: 1 })
    }

    pub fn with_unit(mut self, unit: UnitId, profile: UnitProfile) -> Self {
        self.profiles.insert(unit, profile);
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Bind and start serving in the background
    ///
    /// Use port 0 to let the OS pick; the bound address is returned.
    pub async fn start(&mut self, bind_address: &str) -> ScanResult<SocketAddr> {
        if self.shutdown_tx.is_some() {
            return Err(ScanError::configuration("Simulator is already running"));
        }

        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!("🚀 Gateway simulator listening on {} ({:?} framing)", local_addr, self.framing);

        let state = Arc::new(SharedState {
            framing: self.framing,
            profiles: self.profiles.clone(),
            flaky_seen: Mutex::new(HashMap::new()),
            stats: Mutex::new(SimulatorStats::default()),
        });
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.state = Some(state.clone());
        self.local_addr = Some(local_addr);

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("Accepted connection from {}", addr);
                                let state = state.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    Self::handle_client(stream, state, shutdown_rx).await;
                                });
                            }
                            Err(e) => error!("Failed to accept connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping simulator");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every open connection
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
            info!("⏹️  Gateway simulator stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> SimulatorStats {
        self.state
            .as_ref()
            .map(|state| state.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone())
            .unwrap_or_default()
    }

    async fn handle_client(mut stream: TcpStream, state: Arc<SharedState>, mut shutdown_rx: broadcast::Receiver<()>) {
        let peer_addr = stream.peer_addr().map(|addr| addr.to_string()).unwrap_or_else(|_| "unknown".into());
        state.bump(|stats| stats.connections += 1);

        loop {
            let request = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = read_request(&mut stream, state.framing) => match result {
                    Ok(request) => request,
                    Err(e) => {
                        debug!("Client {} disconnected: {}", peer_addr, e);
                        break;
                    }
                },
            };
            state.bump(|stats| stats.requests += 1);

            let Some(response) = Self::respond(&state, &request).await else {
                state.bump(|stats| stats.ignored += 1);
                continue;
            };
            if let Err(e) = stream.write_all(&response).await {
                debug!("Failed to send response to {}: {}", peer_addr, e);
                break;
            }
            state.bump(|stats| stats.responses += 1);
        }
    }

    /// Build the reply for one request, or `None` to stay silent
    async fn respond(state: &SharedState, frame: &[u8]) -> Option<Vec<u8>> {
        let request = ReadRequest::decode(state.framing, frame)?;
        let framing = state.framing;
        let reply = |value: u16| {
            build_register_response(framing, request.unit_id, request.function_code, &[value], request.transaction_id)
                .to_vec()
        };

        if RegisterKind::from_function_code(request.function_code).is_none() {
            return Some(
                build_exception_response(
                    framing,
                    request.unit_id,
                    request.function_code,
                    ModbusException::IllegalFunction as u8,
                    request.transaction_id,
                )
                .to_vec(),
            );
        }

        match state.profiles.get(&request.unit_id)? {
            UnitProfile::Healthy(value) => Some(reply(*value)),
            UnitProfile::Exception(code) => Some(
                build_exception_response(framing, request.unit_id, request.function_code, *code, request.transaction_id)
                    .to_vec(),
            ),
            UnitProfile::Silent => None,
            UnitProfile::Slow { value, delay } => {
                tokio::time::sleep(*delay).await;
                Some(reply(*value))
            }
            UnitProfile::Flaky { value, fail_first } => {
                let mut seen = state.flaky_seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let count = seen.entry(request.unit_id).or_insert(0);
                *count += 1;
                (*count > *fail_first).then(|| reply(*value))
            }
        }
    }
}

impl Drop for GatewaySimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fields of a read request the simulator needs
struct ReadRequest {
    transaction_id: u16,
    unit_id: UnitId,
    function_code: u8,
}

impl ReadRequest {
    fn decode(framing: Framing, frame: &[u8]) -> Option<Self> {
        match framing {
            Framing::Mbap => Some(Self {
                transaction_id: u16::from_be_bytes([*frame.first()?, *frame.get(1)?]),
                unit_id: *frame.get(6)?,
                function_code: *frame.get(7)?,
            }),
            Framing::Rtu => {
                if !verify_trailing_crc(frame) {
                    debug!("Dropping RTU request with bad CRC");
                    return None;
                }
                Some(Self { transaction_id: 0, unit_id: *frame.first()?, function_code: *frame.get(1)? })
            }
        }
    }
}

async fn read_request(stream: &mut TcpStream, framing: Framing) -> std::io::Result<Vec<u8>> {
    match framing {
        Framing::Mbap => {
            let mut frame = vec![0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut frame).await?;
            let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
            frame.resize(MBAP_HEADER_LEN + length.saturating_sub(1), 0);
            stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;
            Ok(frame)
        }
        Framing::Rtu => {
            let mut frame = vec![0u8; RTU_REQUEST_LEN];
            stream.read_exact(&mut frame).await?;
            Ok(frame)
        }
    }
}
