//! Camera capture module.
//!
//! Provides the pieces a scanning session is assembled from:
//! - Device enumeration and default selection
//! - Camera permission probing and change notifications
//! - Stream acquisition under resolution/device constraints
//! - Binding a stream to a render surface that may not be mounted yet

mod acquire;
mod catalog;
mod permission;
mod surface;

#[cfg(target_os = "linux")]
mod linux;

pub use acquire::{Constraints, FacingMode, MediaStream, Range, StreamAcquirer, StreamHandle, StreamSlot};
pub use catalog::{next_after, pick_default, DeviceCatalog};
pub use permission::PermissionMonitor;
pub use surface::{BindOptions, ReadyState, RenderSurface, SurfaceBinder, SurfaceProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::CaptureError;
use crate::subscription::Subscription;

/// Camera orientation inferred from the device label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingHint {
    Environment,
    User,
    Unknown,
}

impl FacingHint {
    /// Infer the facing direction from a device label.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if ["back", "rear", "environment"].iter().any(|k| lower.contains(k)) {
            FacingHint::Environment
        } else if ["front", "user", "face"].iter().any(|k| lower.contains(k)) {
            FacingHint::User
        } else {
            FacingHint::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDevice {
    pub id: String,
    /// May be empty until camera permission has been granted
    pub label: String,
    pub facing_hint: FacingHint,
}

impl CameraDevice {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            id: id.into(),
            facing_hint: FacingHint::from_label(&label),
            label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Unknown,
    Granted,
    Denied,
}

impl std::fmt::Display for PermissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionState::Unknown => write!(f, "unknown"),
            PermissionState::Granted => write!(f, "granted"),
            PermissionState::Denied => write!(f, "denied"),
        }
    }
}

/// What the platform can do before any stream is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureEnvironment {
    pub supports_capture: bool,
    pub secure_context: bool,
}

/// Settings a track reports after negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSettings {
    pub device_id: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

/// One live hardware track.
pub trait Track: Send + Sync {
    fn id(&self) -> &str;
    fn settings(&self) -> TrackSettings;
    /// Release the underlying hardware. Called at most once per track.
    fn stop(&mut self);
}

/// A failed `open`, carrying any tracks that were obtained before the failure.
pub struct OpenFailure {
    pub error: CaptureError,
    pub partial: Vec<Box<dyn Track>>,
}

impl OpenFailure {
    pub fn new(error: CaptureError) -> Self {
        Self {
            error,
            partial: Vec::new(),
        }
    }
}

impl From<CaptureError> for OpenFailure {
    fn from(error: CaptureError) -> Self {
        Self::new(error)
    }
}

pub type PermissionCallback = Box<dyn Fn(PermissionState) + Send + Sync>;

/// Platform camera access.
#[async_trait]
pub trait CameraBackend: Send + Sync {
    fn environment(&self) -> CaptureEnvironment;

    async fn enumerate(&self) -> Result<Vec<CameraDevice>, CaptureError>;

    /// Current permission, or `None` when the platform cannot introspect it.
    async fn query_permission(&self) -> Option<PermissionState>;

    /// Register for permission changes, or `None` when unsupported.
    fn watch_permission(&self, on_change: PermissionCallback) -> Option<Subscription>;

    /// Make exactly one attempt to open a stream.
    async fn open(&self, constraints: &Constraints) -> Result<Vec<Box<dyn Track>>, OpenFailure>;
}

/// Backend for platforms without native camera support.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

#[async_trait]
impl CameraBackend for UnsupportedBackend {
    fn environment(&self) -> CaptureEnvironment {
        CaptureEnvironment {
            supports_capture: false,
            secure_context: true,
        }
    }

    async fn enumerate(&self) -> Result<Vec<CameraDevice>, CaptureError> {
        Ok(Vec::new())
    }

    async fn query_permission(&self) -> Option<PermissionState> {
        None
    }

    fn watch_permission(&self, _on_change: PermissionCallback) -> Option<Subscription> {
        None
    }

    async fn open(&self, _constraints: &Constraints) -> Result<Vec<Box<dyn Track>>, OpenFailure> {
        Err(CaptureError::HardwareUnavailable("video capture is not supported on this platform".to_string()).into())
    }
}

/// The camera backend for the current platform.
pub fn platform_backend() -> Arc<dyn CameraBackend> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::V4l2Backend::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedBackend)
    }
}
