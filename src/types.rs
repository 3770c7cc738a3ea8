use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Reasons a [`ScanRequest`] can be rejected before a scan starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("target must not be empty")]
    EmptyTarget,
    #[error("invalid port range {start}-{end} (start > end)")]
    InvalidRange { start: u16, end: u16 },
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

/// What to scan: one host, an inclusive port range and a per-attempt timeout.
///
/// Fields are private so a request can only exist in a valid state.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    target: String,
    start_port: u16,
    end_port: u16,
    timeout_ms: u64,
}

impl ScanRequest {
    pub fn new(
        target: impl Into<String>,
        start_port: u16,
        end_port: u16,
        timeout_ms: u64,
    ) -> Result<Self, RequestError> {
        let target = target.into().trim().to_string();
        if target.is_empty() {
            return Err(RequestError::EmptyTarget);
        }
        if start_port > end_port {
            return Err(RequestError::InvalidRange {
                start: start_port,
                end: end_port,
            });
        }
        if timeout_ms == 0 {
            return Err(RequestError::ZeroTimeout);
        }
        Ok(Self {
            target,
            start_port,
            end_port,
            timeout_ms,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    pub fn end_port(&self) -> u16 {
        self.end_port
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Number of ports in the inclusive range; never zero.
    pub fn total(&self) -> u64 {
        u64::from(self.end_port - self.start_port) + 1
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start_port..=self.end_port
    }
}

/// Result of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Open { port: u16, service: String },
    Closed { port: u16 },
}

impl ScanOutcome {
    pub fn port(&self) -> u16 {
        match self {
            ScanOutcome::Open { port, .. } | ScanOutcome::Closed { port } => *port,
        }
    }
}

/// How a scan ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// The reachability gate failed; no port was attempted.
    Unreachable,
    Completed,
    /// Scheduling stopped early because `cancel()` was observed.
    Cancelled,
    /// The grace period expired with tasks still outstanding.
    Abandoned,
}

/// One open port entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenPort {
    pub port: u16,
    pub service: String,
}

/// Aggregate view of a finished scan.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScanSummary {
    pub target: String,
    pub start_port: u16,
    pub end_port: u16,
    pub total: u64,
    pub completed: u64,
    pub status: ScanStatus,
    pub open: Vec<OpenPort>,
    pub started_at: String,
    pub finished_at: String,
}

pub fn open_port_message(target: &str, port: u16, service: &str) -> String {
    format!("Open port: {target}:{port} ({service})")
}

pub fn unreachable_message(target: &str) -> String {
    format!("Target {target} does not exist or is unreachable.")
}

/// Whole percent of `completed` over `total`, rounded down and capped at 100.
pub fn percent(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (completed.min(total) * 100 / total) as u8
}
