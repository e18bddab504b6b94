//! Stream acquisition under device and resolution constraints

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::{CameraBackend, Track, TrackSettings};
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    Environment,
    User,
}

/// A requested value with a hard lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    pub ideal: T,
    pub min: T,
}

impl<T> Range<T> {
    pub const fn new(ideal: T, min: T) -> Self {
        Self { ideal, min }
    }
}

/// Requested capture parameters.
///
/// `exact_device_id` takes precedence over `facing_mode` when both are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facing_mode: Option<FacingMode>,
    pub width: Range<u32>,
    pub height: Range<u32>,
    pub frame_rate: Range<f64>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            exact_device_id: None,
            facing_mode: Some(FacingMode::Environment),
            width: Range::new(1280, 640),
            height: Range::new(720, 480),
            frame_rate: Range::new(30.0, 15.0),
        }
    }
}

impl Constraints {
    /// Pin these constraints to one device, dropping any facing preference.
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.exact_device_id = Some(device_id.into());
        self.facing_mode = None;
        self
    }

    /// Check that the request is self-consistent before any platform call.
    ///
    /// A minimum of zero means no minimum.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.width.min > self.width.ideal || self.height.min > self.height.ideal {
            return Err(CaptureError::Constraint(format!(
                "minimum resolution {}x{} exceeds ideal {}x{}",
                self.width.min, self.height.min, self.width.ideal, self.height.ideal
            )));
        }
        if !(self.frame_rate.min >= 0.0) || self.frame_rate.min > self.frame_rate.ideal {
            return Err(CaptureError::Constraint(format!(
                "frame rate minimum {} must be non-negative and not exceed ideal {}",
                self.frame_rate.min, self.frame_rate.ideal
            )));
        }
        if matches!(self.exact_device_id.as_deref(), Some(id) if id.trim().is_empty()) {
            return Err(CaptureError::Constraint("exact device id is empty".to_string()));
        }
        Ok(())
    }

    /// Check negotiated track settings against this request.
    fn check_settings(&self, settings: &TrackSettings) -> Result<(), CaptureError> {
        if let Some(ref wanted) = self.exact_device_id {
            if &settings.device_id != wanted {
                return Err(CaptureError::Constraint(format!(
                    "requested device {} but got {}",
                    wanted, settings.device_id
                )));
            }
        }
        if settings.width < self.width.min || settings.height < self.height.min {
            return Err(CaptureError::Constraint(format!(
                "negotiated {}x{} is below minimum {}x{}",
                settings.width, settings.height, self.width.min, self.height.min
            )));
        }
        if settings.frame_rate < self.frame_rate.min {
            return Err(CaptureError::Constraint(format!(
                "negotiated {:.1} fps is below minimum {:.1}",
                settings.frame_rate, self.frame_rate.min
            )));
        }
        Ok(())
    }
}

/// Description of a live stream, handed to render surfaces.
///
/// Holds no hardware; only [`StreamHandle`] does.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStream {
    pub id: String,
    pub device_id: String,
    pub settings: TrackSettings,
    pub track_count: usize,
}

/// Owner of the live hardware tracks from one acquisition.
pub struct StreamHandle {
    stream: MediaStream,
    tracks: Vec<Box<dyn Track>>,
}

impl StreamHandle {
    fn new(tracks: Vec<Box<dyn Track>>) -> Self {
        let settings = tracks[0].settings();
        let stream = MediaStream {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: settings.device_id.clone(),
            track_count: tracks.len(),
            settings,
        };
        Self { stream, tracks }
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Stop every track. Returns how many tracks were stopped.
    pub fn release(mut self) -> usize {
        self.stop_all()
    }

    fn stop_all(&mut self) -> usize {
        let count = self.tracks.len();
        for mut track in self.tracks.drain(..) {
            track.stop();
        }
        count
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let stopped = self.stop_all();
        if stopped > 0 {
            tracing::warn!("Stream {} dropped without release; stopped {} track(s)", self.stream.id, stopped);
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream", &self.stream)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

fn stop_tracks(tracks: Vec<Box<dyn Track>>) -> usize {
    let count = tracks.len();
    for mut track in tracks {
        track.stop();
    }
    count
}

/// The single place a session keeps its live stream.
///
/// Installing over a live handle is refused, so at most one handle exists per
/// slot. `release` is idempotent and may be called from any task.
#[derive(Clone, Default)]
pub struct StreamSlot {
    inner: Arc<Mutex<Option<StreamHandle>>>,
}

impl StreamSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handle`, handing it back if the slot is already occupied.
    pub fn install(&self, handle: StreamHandle) -> Result<MediaStream, StreamHandle> {
        let mut slot = match self.inner.lock() {
            Ok(slot) => slot,
            Err(_) => return Err(handle),
        };
        if slot.is_some() {
            return Err(handle);
        }
        let stream = handle.stream().clone();
        *slot = Some(handle);
        Ok(stream)
    }

    /// Stop all tracks of the held handle. Returns the number stopped.
    pub fn release(&self) -> usize {
        let handle = self.inner.lock().ok().and_then(|mut slot| slot.take());
        match handle {
            Some(handle) => {
                let id = handle.stream().id.clone();
                let stopped = handle.release();
                tracing::info!("Released stream {} ({} track(s) stopped)", id, stopped);
                stopped
            }
            None => 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn stream(&self) -> Option<MediaStream> {
        self.inner
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|h| h.stream().clone()))
    }
}

/// Negotiates streams from a [`CameraBackend`].
#[derive(Clone)]
pub struct StreamAcquirer {
    backend: Arc<dyn CameraBackend>,
}

impl StreamAcquirer {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self { backend }
    }

    /// Make exactly one acquisition attempt.
    ///
    /// Checks capability support, then the secure context, then negotiates
    /// with the platform. Tracks obtained before a failure are stopped before
    /// the error is returned.
    pub async fn acquire(&self, constraints: &Constraints) -> Result<StreamHandle, CaptureError> {
        let env = self.backend.environment();
        if !env.supports_capture {
            return Err(CaptureError::HardwareUnavailable(
                "this platform cannot capture video".to_string(),
            ));
        }
        if !env.secure_context {
            return Err(CaptureError::Security(
                "camera access requires a secure context".to_string(),
            ));
        }
        constraints.validate()?;

        match constraints.exact_device_id {
            Some(ref id) => tracing::info!("Requesting camera stream from device {}", id),
            None => tracing::info!("Requesting camera stream (facing: {:?})", constraints.facing_mode),
        }

        let tracks = match self.backend.open(constraints).await {
            Ok(tracks) => tracks,
            Err(failure) => {
                let stopped = stop_tracks(failure.partial);
                if stopped > 0 {
                    tracing::debug!("Stopped {} partially acquired track(s)", stopped);
                }
                tracing::warn!("Camera acquisition failed: {}", failure.error);
                return Err(failure.error);
            }
        };

        if tracks.is_empty() {
            return Err(CaptureError::HardwareUnavailable(
                "platform returned a stream without video tracks".to_string(),
            ));
        }

        if let Some(err) = tracks
            .iter()
            .find_map(|t| constraints.check_settings(&t.settings()).err())
        {
            let stopped = stop_tracks(tracks);
            tracing::warn!("Rejected negotiated stream ({} track(s) stopped): {}", stopped, err);
            return Err(err);
        }

        let handle = StreamHandle::new(tracks);
        let settings = &handle.stream().settings;
        tracing::info!(
            "Acquired stream {} from {}: {}x{} @ {:.0} fps, {} track(s)",
            handle.stream().id,
            settings.device_id,
            settings.width,
            settings.height,
            settings.frame_rate,
            handle.track_count()
        );
        Ok(handle)
    }
}
