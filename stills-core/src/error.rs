//! Domain-specific error types for still uploads.
//!
//! All fallible operations return `Result<T, StillsError>`.
//! Device callbacks never panic; every failure surfaces as a typed variant
//! that the uploader either retries, skips, or turns into a fatal exit.

use std::time::Duration;
use thiserror::Error;

// ── ConnectFailure ───────────────────────────────────────────────

/// Reason reported by the discovery collaborator when a connect attempt
/// does not yield a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    /// The device did not answer within the discovery deadline.
    #[error("No response from Switcher")]
    NoResponse,

    /// The device answered but runs firmware this API cannot drive.
    #[error("Switcher has incompatible firmware")]
    IncompatibleFirmware,

    /// Anything the discovery layer could not classify.
    #[error("Connection failed for unknown reason")]
    Unknown,
}

impl ConnectFailure {
    /// Only a silent device is worth another attempt.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::NoResponse)
    }
}

// ── StillsError ──────────────────────────────────────────────────

/// The canonical error type for the still-upload protocol.
#[derive(Debug, Error)]
pub enum StillsError {
    // ── Connection Errors ────────────────────────────────────────
    /// The discovery collaborator could not produce a session.
    #[error("{0}")]
    Connect(#[from] ConnectFailure),

    /// An empty device address was supplied.
    #[error("device address is empty")]
    EmptyAddress,

    /// The blocking connect worker died before reporting.
    #[error("connect worker failed: {0}")]
    ConnectWorker(String),

    // ── Capability Errors ────────────────────────────────────────
    /// The session does not expose a media pool (API version mismatch).
    #[error("Failed to cast to media pool")]
    MediaPoolUnavailable,

    /// The media pool did not hand out its stills pool.
    #[error("Failed to get stills pool")]
    StillsUnavailable,

    /// The device refused to allocate a frame of the requested shape.
    #[error("Failed to create frame")]
    FrameUnavailable,

    /// A frame was supplied whose byte length does not match its shape.
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    /// A slot index outside the device's still ring.
    #[error("slot {slot} out of range (ring size {ring})")]
    SlotOutOfRange { slot: u32, ring: u32 },

    // ── Coordination Timeouts ────────────────────────────────────
    /// The media-pool lock was not granted in time.
    #[error("Timed out getting lock after {0:?}")]
    LockTimeout(Duration),

    /// No terminal transfer event arrived for the slot in time.
    #[error("Timed out doing upload to slot {slot} after {after:?}")]
    TransferTimeout { slot: u32, after: Duration },

    // ── Protocol Errors ──────────────────────────────────────────
    /// A transfer-phase transition was attempted from the wrong state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl StillsError {
    /// Returns `true` for the two bounded waits of an upload attempt.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::TransferTimeout { .. })
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StillsError {
    fn from(s: String) -> Self {
        StillsError::Other(s)
    }
}

impl From<&str> for StillsError {
    fn from(s: &str) -> Self {
        StillsError::Other(s.to_string())
    }
}

impl From<tokio::task::JoinError> for StillsError {
    fn from(e: tokio::task::JoinError) -> Self {
        StillsError::ConnectWorker(e.to_string())
    }
}
