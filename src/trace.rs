//! Scan output channels
//!
//! A scan produces two streams: human-readable trace lines (connection
//! attempts, per-unit results, retry reasons) and result records for units
//! that answered. Both are optional for the caller; the trace is always
//! collected into the final report as well, so omitting a sink changes only
//! what the caller sees live.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::classify::FoundDevice;
use crate::protocol::UnitId;
use crate::utils::format::bytes_to_hex;

/// Append-only trace of one scan
///
/// Cloned into every unit worker; lines from concurrent workers interleave
/// in the order they are emitted.
#[derive(Clone, Default)]
pub struct TraceLog {
    lines: Arc<Mutex<Vec<String>>>,
    sink: Option<UnboundedSender<String>>,
}

impl TraceLog {
    /// Create a trace log, optionally forwarding every line to `sink`
    pub fn new(sink: Option<UnboundedSender<String>>) -> Self {
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
            sink,
        }
    }

    /// Append a line
    pub fn line<S: Into<String>>(&self, message: S) {
        let message = message.into();
        debug!(target: "voltage_modbus_scan::trace", "{}", message);
        if let Some(sink) = &self.sink {
            // a receiver that went away only loses the live view
            let _ = sink.send(message.clone());
        }
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }

    /// Append a line about one unit
    pub fn unit<S: AsRef<str>>(&self, unit_id: UnitId, message: S) {
        self.line(format!("Unit {}: {}", unit_id, message.as_ref()));
    }

    /// Append a hex dump of a frame sent to or received from a unit
    pub fn packet(&self, unit_id: UnitId, direction: &str, data: &[u8]) {
        self.unit(unit_id, format!("{} {}", direction, bytes_to_hex(data)));
    }

    /// Snapshot of all lines so far
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for TraceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceLog")
            .field("lines", &self.lines().len())
            .field("live", &self.sink.is_some())
            .finish()
    }
}

/// Live channel for conclusive per-unit results
#[derive(Clone, Debug, Default)]
pub struct ResultSink {
    sender: Option<UnboundedSender<FoundDevice>>,
}

impl ResultSink {
    pub fn new(sender: Option<UnboundedSender<FoundDevice>>) -> Self {
        Self { sender }
    }

    /// Forward a result as soon as it is known
    pub fn publish(&self, device: &FoundDevice) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(device.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_lines_are_collected_without_sink() {
        let trace = TraceLog::new(None);
        trace.line("Connecting");
        trace.unit(3, "Attempt 1/2");
        trace.packet(3, "TX", &[0x03, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(
            trace.lines(),
            vec!["Connecting", "Unit 3: Attempt 1/2", "Unit 3: TX 03 03 00 00 00 01"]
        );
    }

    #[test]
    fn test_lines_are_forwarded_to_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let trace = TraceLog::new(Some(tx));
        let worker = trace.clone();
        worker.unit(7, "Error - Timeout (0.50s)");
        assert_eq!(rx.try_recv().unwrap(), "Unit 7: Error - Timeout (0.50s)");
        assert_eq!(trace.lines().len(), 1);
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let trace = TraceLog::new(Some(tx));
        trace.line("still recorded");
        assert_eq!(trace.lines(), vec!["still recorded"]);
    }
}
