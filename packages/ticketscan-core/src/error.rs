//! Error types for capture sessions and code validation.

use serde::Serialize;
use thiserror::Error;

use crate::session::SessionState;

/// Failures raised while acquiring a camera stream or binding it to a surface.
///
/// These never escape [`ScanSession`](crate::ScanSession) operations as `Err`;
/// the session records them as `last_error` and moves to the error state.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum CaptureError {
    /// The user or platform declined camera access.
    #[error("camera permission denied: {0}")]
    Permission(String),

    /// No camera is present, or the platform cannot capture video at all.
    #[error("camera hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// The camera is held by another consumer.
    #[error("camera is busy: {0}")]
    DeviceBusy(String),

    /// The requested device/resolution/frame-rate combination cannot be met.
    #[error("capture constraints cannot be satisfied: {0}")]
    Constraint(String),

    /// Capture was attempted outside a secure context.
    #[error("capture not allowed in this context: {0}")]
    Security(String),

    /// The render surface never appeared or never became ready.
    #[error("render surface timed out: {0}")]
    SurfaceTimeout(String),

    /// The surface refused to start playback.
    #[error("playback failed: {0}")]
    Playback(String),

    /// The in-flight operation was cancelled by `stop()`.
    #[error("capture aborted")]
    Aborted,
}

impl CaptureError {
    /// Whether retrying `start()` can succeed without out-of-band user action.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CaptureError::SurfaceTimeout(_)
            | CaptureError::DeviceBusy(_)
            | CaptureError::Playback(_)
            | CaptureError::Aborted => true,
            CaptureError::Permission(_)
            | CaptureError::HardwareUnavailable(_)
            | CaptureError::Constraint(_)
            | CaptureError::Security(_) => false,
        }
    }
}

/// An operation on the session was rejected before doing any work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is busy ({0}); stop it before starting again")]
    Busy(SessionState),

    #[error("switching cameras requires more than one device, found {0}")]
    NoAlternateCamera(usize),
}

/// Failures reported by a [`ValidationClient`](crate::validation::ValidationClient).
///
/// Passed through to the caller of `submit_code` unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("validation service unreachable: {message}")]
    Transport { message: String },

    #[error("validation rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed validation response: {message}")]
    Malformed { message: String },
}
