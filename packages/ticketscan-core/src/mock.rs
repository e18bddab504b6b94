//! Test doubles for the camera backend, render surfaces and validation.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::capture::{
    pick_default, CameraBackend, CameraDevice, CaptureEnvironment, Constraints, FacingMode,
    MediaStream, OpenFailure, PermissionCallback, PermissionState, ReadyState, RenderSurface,
    SurfaceProvider, Track, TrackSettings,
};
use crate::error::{CaptureError, ValidationError};
use crate::subscription::{Subscribers, Subscription};
use crate::validation::{ValidationClient, ValidationVerdict};

/// Scripted outcome for the next `open` call.
pub(crate) enum OpenScript {
    Succeed,
    Fail(CaptureError),
    /// Start this many tracks, then fail.
    FailAfterPartial(CaptureError, usize),
}

struct BackendState {
    devices: Vec<CameraDevice>,
    environment: CaptureEnvironment,
    permission: Option<PermissionState>,
    scripts: VecDeque<OpenScript>,
    tracks_per_stream: usize,
    resolution: (u32, u32),
    open_delay: Option<Duration>,
}

#[derive(Default)]
struct Counters {
    open_calls: AtomicUsize,
    tracks_started: AtomicUsize,
    tracks_stopped: AtomicUsize,
    overlapping_opens: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl Counters {
    fn push(&self, entry: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
    }

    fn live(&self) -> usize {
        self.tracks_started.load(Ordering::SeqCst) - self.tracks_stopped.load(Ordering::SeqCst)
    }
}

/// In-memory camera backend that counts acquisitions and releases.
pub(crate) struct MockBackend {
    state: Mutex<BackendState>,
    counters: Arc<Counters>,
    watchers: Subscribers<PermissionState>,
}

impl MockBackend {
    pub(crate) fn with_labels(labels: &[&str]) -> Arc<Self> {
        let devices = labels
            .iter()
            .enumerate()
            .map(|(i, label)| CameraDevice::new(format!("cam-{}", i), *label))
            .collect();

        Arc::new(Self {
            state: Mutex::new(BackendState {
                devices,
                environment: CaptureEnvironment {
                    supports_capture: true,
                    secure_context: true,
                },
                permission: Some(PermissionState::Unknown),
                scripts: VecDeque::new(),
                tracks_per_stream: 1,
                resolution: (1280, 720),
                open_delay: None,
            }),
            counters: Arc::new(Counters::default()),
            watchers: Subscribers::new(),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BackendState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn set_environment(&self, supports_capture: bool, secure_context: bool) {
        self.with_state(|s| {
            s.environment = CaptureEnvironment {
                supports_capture,
                secure_context,
            }
        });
    }

    pub(crate) fn set_permission(&self, permission: Option<PermissionState>) {
        self.with_state(|s| s.permission = permission);
    }

    pub(crate) fn set_tracks_per_stream(&self, count: usize) {
        self.with_state(|s| s.tracks_per_stream = count);
    }

    pub(crate) fn set_resolution(&self, width: u32, height: u32) {
        self.with_state(|s| s.resolution = (width, height));
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.with_state(|s| s.open_delay = Some(delay));
    }

    pub(crate) fn script_open(&self, script: OpenScript) {
        self.with_state(|s| s.scripts.push_back(script));
    }

    pub(crate) fn emit_permission(&self, state: PermissionState) {
        self.watchers.notify(state);
    }

    pub(crate) fn permission_watchers(&self) -> usize {
        self.watchers.len()
    }

    pub(crate) fn open_calls(&self) -> usize {
        self.counters.open_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn tracks_started(&self) -> usize {
        self.counters.tracks_started.load(Ordering::SeqCst)
    }

    pub(crate) fn tracks_stopped(&self) -> usize {
        self.counters.tracks_stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn live_tracks(&self) -> usize {
        self.counters.live()
    }

    /// Opens that began while tracks from an earlier open were still live.
    pub(crate) fn overlapping_opens(&self) -> usize {
        self.counters.overlapping_opens.load(Ordering::SeqCst)
    }

    /// Ordered `open:<device>` / `stop:<track>` entries.
    pub(crate) fn log(&self) -> Vec<String> {
        self.counters.log.lock().unwrap().clone()
    }

    fn start_tracks(&self, device_id: &str, count: usize, resolution: (u32, u32)) -> Vec<Box<dyn Track>> {
        (0..count)
            .map(|_| {
                let n = self.counters.tracks_started.fetch_add(1, Ordering::SeqCst);
                Box::new(MockTrack {
                    id: format!("track-{}", n),
                    settings: TrackSettings {
                        device_id: device_id.to_string(),
                        width: resolution.0,
                        height: resolution.1,
                        frame_rate: 30.0,
                    },
                    stopped: false,
                    counters: self.counters.clone(),
                }) as Box<dyn Track>
            })
            .collect()
    }
}

#[async_trait]
impl CameraBackend for MockBackend {
    fn environment(&self) -> CaptureEnvironment {
        self.with_state(|s| s.environment)
    }

    async fn enumerate(&self) -> Result<Vec<CameraDevice>, CaptureError> {
        Ok(self.with_state(|s| s.devices.clone()))
    }

    async fn query_permission(&self) -> Option<PermissionState> {
        self.with_state(|s| s.permission)
    }

    fn watch_permission(&self, on_change: PermissionCallback) -> Option<Subscription> {
        Some(self.watchers.subscribe(move |state| on_change(state)))
    }

    async fn open(&self, constraints: &Constraints) -> Result<Vec<Box<dyn Track>>, OpenFailure> {
        if self.counters.live() > 0 {
            self.counters.overlapping_opens.fetch_add(1, Ordering::SeqCst);
        }
        self.counters.open_calls.fetch_add(1, Ordering::SeqCst);

        let (devices, script, tracks_per_stream, resolution, delay) = self.with_state(|s| {
            (
                s.devices.clone(),
                s.scripts.pop_front().unwrap_or(OpenScript::Succeed),
                s.tracks_per_stream,
                s.resolution,
                s.open_delay,
            )
        });

        let device = match constraints.exact_device_id {
            Some(ref id) => devices.iter().find(|d| &d.id == id),
            None if constraints.facing_mode == Some(FacingMode::Environment) => pick_default(&devices),
            None => devices.first(),
        };
        let device_id = device.map(|d| d.id.clone()).unwrap_or_else(|| "none".to_string());
        self.counters.push(format!("open:{}", device_id));

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match script {
            OpenScript::Succeed => {}
            OpenScript::Fail(error) => {
                if matches!(error, CaptureError::Permission(_)) {
                    self.set_permission(Some(PermissionState::Denied));
                }
                return Err(OpenFailure::new(error));
            }
            OpenScript::FailAfterPartial(error, count) => {
                return Err(OpenFailure {
                    error,
                    partial: self.start_tracks(&device_id, count, resolution),
                });
            }
        }

        if devices.is_empty() {
            return Err(CaptureError::HardwareUnavailable("no camera connected".to_string()).into());
        }
        if device.is_none() {
            return Err(CaptureError::Constraint(format!("no device matches {:?}", constraints.exact_device_id)).into());
        }

        self.set_permission(Some(PermissionState::Granted));
        Ok(self.start_tracks(&device_id, tracks_per_stream, resolution))
    }
}

struct MockTrack {
    id: String,
    settings: TrackSettings,
    stopped: bool,
    counters: Arc<Counters>,
}

impl Track for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn settings(&self) -> TrackSettings {
        self.settings.clone()
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.counters.tracks_stopped.fetch_add(1, Ordering::SeqCst);
            self.counters.push(format!("stop:{}", self.id));
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SurfaceBehavior {
    /// Metadata is available as soon as a stream is attached.
    MetadataOnAttach,
    /// The metadata event fires after a delay.
    MetadataAfter(Duration),
    /// No metadata event, but data shows up after a second.
    SilentWithData,
    /// Nothing ever happens.
    Silent,
}

struct SurfaceState {
    attached: Option<MediaStream>,
    ready: ReadyState,
    playing: bool,
    refuse_play: Option<String>,
}

pub(crate) struct MockSurface {
    behavior: SurfaceBehavior,
    state: Arc<Mutex<SurfaceState>>,
    listeners: Subscribers<()>,
}

impl MockSurface {
    pub(crate) fn new(behavior: SurfaceBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            state: Arc::new(Mutex::new(SurfaceState {
                attached: None,
                ready: ReadyState::Nothing,
                playing: false,
                refuse_play: None,
            })),
            listeners: Subscribers::new(),
        })
    }

    pub(crate) fn refuse_play(&self, message: &str) {
        self.state.lock().unwrap().refuse_play = Some(message.to_string());
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    pub(crate) fn attached_stream(&self) -> Option<MediaStream> {
        self.state.lock().unwrap().attached.clone()
    }

    pub(crate) fn metadata_listeners(&self) -> usize {
        self.listeners.len()
    }

    /// A provider that always returns this surface.
    pub(crate) fn provider(self: &Arc<Self>) -> MockProvider {
        MockProvider {
            surface: self.clone(),
            mounted: Arc::new(AtomicBool::new(true)),
            mount_delay: None,
            current_calls: AtomicUsize::new(0),
        }
    }

    /// A provider whose surface mounts after `delay` and announces it.
    pub(crate) fn mount_after(self: &Arc<Self>, delay: Duration) -> MockProvider {
        MockProvider {
            surface: self.clone(),
            mounted: Arc::new(AtomicBool::new(false)),
            mount_delay: Some(delay),
            current_calls: AtomicUsize::new(0),
        }
    }
}

impl RenderSurface for MockSurface {
    fn attach(&self, stream: &MediaStream) {
        {
            let mut state = self.state.lock().unwrap();
            state.attached = Some(stream.clone());
        }

        match self.behavior {
            SurfaceBehavior::MetadataOnAttach => {
                self.state.lock().unwrap().ready = ReadyState::Metadata;
                self.listeners.notify(());
            }
            SurfaceBehavior::MetadataAfter(delay) => {
                let state = self.state.clone();
                let listeners = self.listeners.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state.lock().unwrap().ready = ReadyState::Metadata;
                    listeners.notify(());
                });
            }
            SurfaceBehavior::SilentWithData => {
                let state = self.state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    state.lock().unwrap().ready = ReadyState::CurrentData;
                });
            }
            SurfaceBehavior::Silent => {}
        }
    }

    fn detach(&self) {
        let mut state = self.state.lock().unwrap();
        state.attached = None;
        state.playing = false;
        state.ready = ReadyState::Nothing;
    }

    fn ready_state(&self) -> ReadyState {
        self.state.lock().unwrap().ready
    }

    fn on_metadata_ready(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.listeners.subscribe(move |_| callback())
    }

    fn play(&self) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        if let Some(ref message) = state.refuse_play {
            return Err(message.clone());
        }
        if state.attached.is_none() {
            return Err("no stream attached".to_string());
        }
        state.playing = true;
        Ok(())
    }
}

pub(crate) struct MockProvider {
    surface: Arc<MockSurface>,
    mounted: Arc<AtomicBool>,
    mount_delay: Option<Duration>,
    current_calls: AtomicUsize,
}

impl MockProvider {
    pub(crate) fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }
}

impl SurfaceProvider for MockProvider {
    fn current(&self) -> Option<Arc<dyn RenderSurface>> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        if self.mounted.load(Ordering::SeqCst) {
            Some(self.surface.clone())
        } else {
            None
        }
    }

    fn mounted(&self) -> Option<BoxFuture<'static, Arc<dyn RenderSurface>>> {
        let delay = self.mount_delay?;
        let mounted = self.mounted.clone();
        let surface: Arc<dyn RenderSurface> = self.surface.clone();
        Some(
            async move {
                tokio::time::sleep(delay).await;
                mounted.store(true, Ordering::SeqCst);
                surface
            }
            .boxed(),
        )
    }
}

/// Validation client returning scripted results.
pub(crate) struct MockValidator {
    results: Mutex<VecDeque<Result<ValidationVerdict, ValidationError>>>,
    submitted: Mutex<Vec<String>>,
}

impl MockValidator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn respond(&self, result: Result<ValidationVerdict, ValidationError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub(crate) fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ValidationClient for MockValidator {
    async fn submit_code(&self, code: &str) -> Result<ValidationVerdict, ValidationError> {
        self.submitted.lock().unwrap().push(code.to_string());
        self.results.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(ValidationVerdict {
                record: serde_json::Value::Null,
                is_valid: true,
                message: "ok".to_string(),
            })
        })
    }
}
