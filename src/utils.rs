/// Utility functions and helpers for scan operations
///
/// This module contains formatting helpers used by trace lines and reports,
/// plus range validation shared by the configuration layer.

use std::time::Duration;

use crate::error::{ScanError, ScanResult};

/// Data validation utilities
pub mod validation {
    use super::*;
    use crate::protocol::{UnitId, MAX_UNIT_ID, MIN_UNIT_ID};

    /// Validate unit ID (1-247)
    pub fn validate_unit_id(unit_id: UnitId) -> ScanResult<()> {
        if !(MIN_UNIT_ID..=MAX_UNIT_ID).contains(&unit_id) {
            return Err(ScanError::configuration(format!(
                "Invalid unit ID: {} (must be {}-{})",
                unit_id, MIN_UNIT_ID, MAX_UNIT_ID
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format a register value the way scan results report it
    pub fn register_hex(value: u16) -> String {
        format!("0x{:04X}", value)
    }

    /// Format an attempt duration for trace lines, e.g. `1.02s`
    pub fn elapsed_secs(duration: Duration) -> String {
        format!("{:.2}s", duration.as_secs_f64())
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}
