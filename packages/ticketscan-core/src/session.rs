//! The scanning session state machine.
//!
//! A [`ScanSession`] composes the catalog, permission monitor, acquirer and
//! binder into `Idle → Requesting → Binding → Streaming`, with `Error` and
//! `Stopped` reachable from any of them. Capture failures never surface as
//! `Err`; they are recorded as `last_error` and the caller inspects the state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::capture::{
    next_after, BindOptions, CameraBackend, CameraDevice, Constraints, DeviceCatalog,
    PermissionMonitor, PermissionState, RenderSurface, StreamAcquirer, StreamSlot, SurfaceBinder,
    SurfaceProvider,
};
use crate::error::{CaptureError, SessionError, ValidationError};
use crate::subscription::{Subscribers, Subscription};
use crate::validation::{ValidationClient, ValidationVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Requesting,
    Binding,
    Streaming,
    Error,
    Stopped,
}

impl SessionState {
    /// A start is in flight or a stream is live.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SessionState::Requesting | SessionState::Binding | SessionState::Streaming
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Requesting => write!(f, "requesting"),
            SessionState::Binding => write!(f, "binding"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Error => write!(f, "error"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub bind: BindOptions,
    /// Pause between releasing one camera and opening the next on switch
    pub settle_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bind: BindOptions::default(),
            settle_delay: Duration::from_millis(500),
        }
    }
}

/// One decoded code and the validation service's verdict on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanAttempt {
    pub decoded_code: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: ValidationVerdict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    DevicesChanged { devices: Vec<CameraDevice> },
    PermissionChanged { state: PermissionState },
    CodeScanned { attempt: ScanAttempt },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub active_device_id: Option<String>,
    pub last_error: Option<CaptureError>,
    pub devices: Vec<CameraDevice>,
}

struct Inner {
    state: SessionState,
    last_error: Option<CaptureError>,
    devices: Vec<CameraDevice>,
    active_device_id: Option<String>,
    surface: Option<Weak<dyn RenderSurface>>,
    /// Token for the current run; replaced on every stop.
    cancel: CancellationToken,
}

pub struct ScanSession {
    catalog: DeviceCatalog,
    acquirer: StreamAcquirer,
    binder: SurfaceBinder,
    permission: PermissionMonitor,
    provider: Arc<dyn SurfaceProvider>,
    validator: Arc<dyn ValidationClient>,
    constraints: Constraints,
    settle_delay: Duration,
    slot: StreamSlot,
    /// Held for the whole enumerate/acquire/bind run so a start issued after
    /// a stop waits for the cancelled run to finish releasing.
    pipeline: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    events: Subscribers<SessionEvent>,
    permission_events: Mutex<Option<Subscription>>,
}

impl ScanSession {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        provider: Arc<dyn SurfaceProvider>,
        validator: Arc<dyn ValidationClient>,
        constraints: Constraints,
        options: SessionOptions,
    ) -> Self {
        let permission = PermissionMonitor::new(backend.clone());
        let events = Subscribers::new();
        let permission_events = {
            let events = events.clone();
            permission.subscribe(move |state| events.notify(SessionEvent::PermissionChanged { state }))
        };

        Self {
            catalog: DeviceCatalog::new(backend.clone()),
            acquirer: StreamAcquirer::new(backend),
            binder: SurfaceBinder::new(options.bind),
            permission,
            provider,
            validator,
            constraints,
            settle_delay: options.settle_delay,
            slot: StreamSlot::new(),
            pipeline: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                last_error: None,
                devices: Vec::new(),
                active_device_id: None,
                surface: None,
                cancel: CancellationToken::new(),
            }),
            events,
            permission_events: Mutex::new(Some(permission_events)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn last_error(&self) -> Option<CaptureError> {
        self.lock().last_error.clone()
    }

    pub fn active_device_id(&self) -> Option<String> {
        self.lock().active_device_id.clone()
    }

    /// Devices seen by the most recent enumeration.
    pub fn devices(&self) -> Vec<CameraDevice> {
        self.lock().devices.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            state: inner.state,
            active_device_id: inner.active_device_id.clone(),
            last_error: inner.last_error.clone(),
            devices: inner.devices.clone(),
        }
    }

    pub fn subscribe<F>(&self, on_event: F) -> Subscription
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(on_event)
    }

    pub async fn probe_permission(&self) -> PermissionState {
        self.permission.probe().await
    }

    /// Enumerate cameras and remember the result.
    pub async fn refresh_devices(&self) -> Result<Vec<CameraDevice>, CaptureError> {
        let devices = self.catalog.list_cameras().await?;
        self.set_devices(devices.clone());
        Ok(devices)
    }

    /// Acquire a stream and bind it to the host surface.
    ///
    /// With `device_id` the stream is pinned to that device; otherwise the
    /// configured facing preference applies. Returns the state the run ended
    /// in: `Streaming`, `Error` (see [`last_error`](Self::last_error)) or
    /// `Stopped` when [`stop`](Self::stop) interrupted it.
    pub async fn start(&self, device_id: Option<&str>) -> Result<SessionState, SessionError> {
        let (cancel, from) = {
            let mut inner = self.lock();
            if inner.state.is_busy() {
                return Err(SessionError::Busy(inner.state));
            }
            inner.last_error = None;
            let from = std::mem::replace(&mut inner.state, SessionState::Requesting);
            (inner.cancel.clone(), from)
        };
        self.emit_transition(from, SessionState::Requesting);

        let _pipeline = self.pipeline.lock().await;
        Ok(self.run(device_id, &cancel).await)
    }

    async fn run(&self, device_id: Option<&str>, cancel: &CancellationToken) -> SessionState {
        let devices = match self.refresh_devices().await {
            Ok(devices) => devices,
            Err(err) => return self.fail(cancel, err),
        };
        if devices.is_empty() {
            return self.fail(
                cancel,
                CaptureError::HardwareUnavailable("no camera connected".to_string()),
            );
        }
        if cancel.is_cancelled() {
            return SessionState::Stopped;
        }

        let constraints = match device_id {
            Some(id) => self.constraints.clone().with_device(id),
            None => self.constraints.clone(),
        };

        let handle = match self.acquirer.acquire(&constraints).await {
            Ok(handle) => handle,
            Err(err) => {
                if matches!(err, CaptureError::Permission(_)) {
                    self.permission.observe(PermissionState::Denied);
                }
                return self.fail(cancel, err);
            }
        };
        self.permission.observe(PermissionState::Granted);
        let device = handle.stream().device_id.clone();

        let rejected = {
            let mut inner = self.lock();
            if cancel.is_cancelled() {
                Some(handle)
            } else {
                match self.slot.install(handle) {
                    Ok(_) => {
                        inner.active_device_id = Some(device.clone());
                        None
                    }
                    Err(handle) => Some(handle),
                }
            }
        };
        if let Some(handle) = rejected {
            let stopped = handle.release();
            if cancel.is_cancelled() {
                tracing::info!("Session stopped during acquisition; released {} track(s)", stopped);
                return SessionState::Stopped;
            }
            tracing::warn!("Stream slot already occupied; released {} new track(s)", stopped);
            return self.fail(
                cancel,
                CaptureError::DeviceBusy("a stream is already live in this session".to_string()),
            );
        }

        // Labels are often only available once permission has been granted.
        if let Err(err) = self.refresh_devices().await {
            tracing::debug!("Device refresh after acquisition failed: {}", err);
        }

        if !self.advance(cancel, SessionState::Binding) {
            return SessionState::Stopped;
        }

        let surface = match self.binder.bind(&self.slot, self.provider.as_ref(), cancel).await {
            Ok(surface) => surface,
            Err(err) => return self.fail(cancel, err),
        };

        let from = {
            let mut inner = self.lock();
            if cancel.is_cancelled() {
                None
            } else {
                inner.surface = Some(Arc::downgrade(&surface));
                Some(std::mem::replace(&mut inner.state, SessionState::Streaming))
            }
        };
        match from {
            Some(from) => {
                tracing::info!("Streaming from {}", device);
                self.emit_transition(from, SessionState::Streaming);
                SessionState::Streaming
            }
            None => {
                surface.detach();
                self.slot.release();
                SessionState::Stopped
            }
        }
    }

    /// Release everything and move to `Stopped`. Safe from any state.
    pub fn stop(&self) {
        let (from, surface) = {
            let mut inner = self.lock();
            inner.cancel.cancel();
            inner.cancel = CancellationToken::new();
            inner.last_error = None;
            inner.active_device_id = None;
            let surface = inner.surface.take();
            (std::mem::replace(&mut inner.state, SessionState::Stopped), surface)
        };

        if let Some(surface) = surface.and_then(|weak| weak.upgrade()) {
            surface.detach();
        }
        let stopped = self.slot.release();
        if from != SessionState::Stopped {
            tracing::info!("Session stopped from {} ({} track(s) released)", from, stopped);
        }
        self.emit_transition(from, SessionState::Stopped);
    }

    /// Stop, wait for the hardware to settle, then start on the next device.
    pub async fn switch_camera(&self) -> Result<SessionState, SessionError> {
        let next = {
            let inner = self.lock();
            if inner.devices.len() < 2 {
                return Err(SessionError::NoAlternateCamera(inner.devices.len()));
            }
            let Some(next) = next_after(&inner.devices, inner.active_device_id.as_deref()) else {
                return Err(SessionError::NoAlternateCamera(0));
            };
            next.id.clone()
        };

        self.stop();
        let cancel = self.lock().cancel.clone();
        tracing::debug!("Switching to {} after {:?}", next, self.settle_delay);

        tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionState::Stopped),
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        self.start(Some(&next)).await
    }

    /// Validate a decoded code. Does not touch the capture state.
    pub async fn submit_code(&self, code: &str) -> Result<ScanAttempt, ValidationError> {
        let outcome = match self.validator.submit_code(code).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!("Validation of {} failed: {}", code, err);
                return Err(err);
            }
        };

        tracing::info!(
            "Code {} is {}",
            code,
            if outcome.is_valid { "valid" } else { "invalid" }
        );
        let attempt = ScanAttempt {
            decoded_code: code.to_string(),
            timestamp: Utc::now(),
            outcome,
        };
        self.events.notify(SessionEvent::CodeScanned {
            attempt: attempt.clone(),
        });
        Ok(attempt)
    }

    /// Stop and drop every platform subscription.
    pub fn teardown(&self) {
        self.stop();
        let forward = self
            .permission_events
            .lock()
            .ok()
            .and_then(|mut sub| sub.take());
        if let Some(forward) = forward {
            forward.unsubscribe();
        }
        self.permission.close();
    }

    fn set_devices(&self, devices: Vec<CameraDevice>) {
        let changed = {
            let mut inner = self.lock();
            if inner.devices == devices {
                false
            } else {
                inner.devices = devices.clone();
                true
            }
        };
        if changed {
            self.events.notify(SessionEvent::DevicesChanged { devices });
        }
    }

    /// Move to `to` unless the run was cancelled.
    fn advance(&self, cancel: &CancellationToken, to: SessionState) -> bool {
        let from = {
            let mut inner = self.lock();
            if cancel.is_cancelled() {
                return false;
            }
            std::mem::replace(&mut inner.state, to)
        };
        self.emit_transition(from, to);
        true
    }

    fn fail(&self, cancel: &CancellationToken, error: CaptureError) -> SessionState {
        self.slot.release();
        let from = {
            let mut inner = self.lock();
            if cancel.is_cancelled() || error == CaptureError::Aborted {
                return SessionState::Stopped;
            }
            inner.last_error = Some(error.clone());
            inner.active_device_id = None;
            std::mem::replace(&mut inner.state, SessionState::Error)
        };

        if error.is_recoverable() {
            tracing::warn!("Session failed: {} (retrying start may succeed)", error);
        } else {
            tracing::error!("Session failed: {}", error);
        }
        self.emit_transition(from, SessionState::Error);
        SessionState::Error
    }

    fn emit_transition(&self, from: SessionState, to: SessionState) {
        if from != to {
            tracing::debug!("Session {} -> {}", from, to);
            self.events.notify(SessionEvent::StateChanged { from, to });
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
