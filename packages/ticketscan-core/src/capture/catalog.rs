//! Camera enumeration and default device selection

use std::sync::Arc;

use super::{CameraBackend, CameraDevice};
use crate::error::CaptureError;

/// Label fragments that identify a rear-facing camera.
const ENVIRONMENT_HINTS: [&str; 3] = ["back", "rear", "environment"];

#[derive(Clone)]
pub struct DeviceCatalog {
    backend: Arc<dyn CameraBackend>,
}

impl DeviceCatalog {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self { backend }
    }

    /// Enumerate cameras in platform order. Never cached.
    pub async fn list_cameras(&self) -> Result<Vec<CameraDevice>, CaptureError> {
        let devices = self.backend.enumerate().await?;
        tracing::debug!("Enumerated {} camera(s)", devices.len());
        Ok(devices)
    }
}

/// Prefer a rear-facing camera, then the first one enumerated.
pub fn pick_default(devices: &[CameraDevice]) -> Option<&CameraDevice> {
    devices
        .iter()
        .find(|device| {
            let label = device.label.to_lowercase();
            ENVIRONMENT_HINTS.iter().any(|hint| label.contains(hint))
        })
        .or_else(|| devices.first())
}

/// The device after `current_id`, wrapping around.
///
/// Returns the first device when `current_id` is `None` or no longer listed.
pub fn next_after<'a>(devices: &'a [CameraDevice], current_id: Option<&str>) -> Option<&'a CameraDevice> {
    let position = current_id.and_then(|id| devices.iter().position(|d| d.id == id));
    match position {
        Some(index) => devices.get((index + 1) % devices.len()),
        None => devices.first(),
    }
}
