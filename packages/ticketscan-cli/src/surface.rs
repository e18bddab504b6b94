//! Headless render surface
//!
//! The CLI has no window to draw into. This surface accepts a stream, reports
//! metadata as soon as it is attached and treats playback as always allowed,
//! which is enough to drive the session through to `Streaming`.

use std::sync::{Arc, Mutex};
use ticketscan_core::capture::{MediaStream, ReadyState, RenderSurface, SurfaceProvider};
use ticketscan_core::subscription::{Subscribers, Subscription};

#[derive(Default)]
struct State {
    attached: Option<MediaStream>,
    playing: bool,
}

#[derive(Default)]
pub struct HeadlessSurface {
    state: Mutex<State>,
    metadata: Subscribers<()>,
}

impl HeadlessSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The stream currently playing, if any.
    pub fn playing(&self) -> Option<MediaStream> {
        let state = self.state.lock().ok()?;
        if state.playing { state.attached.clone() } else { None }
    }
}

impl RenderSurface for HeadlessSurface {
    fn attach(&self, stream: &MediaStream) {
        if let Ok(mut state) = self.state.lock() {
            state.attached = Some(stream.clone());
            state.playing = false;
        }
        tracing::debug!(
            "Headless surface attached to {} ({}x{})",
            stream.device_id,
            stream.settings.width,
            stream.settings.height
        );
        self.metadata.notify(());
    }

    fn detach(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.attached = None;
            state.playing = false;
        }
    }

    fn ready_state(&self) -> ReadyState {
        match self.state.lock() {
            Ok(state) if state.attached.is_some() => ReadyState::Metadata,
            _ => ReadyState::Nothing,
        }
    }

    fn on_metadata_ready(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.metadata.subscribe(move |_| callback())
    }

    fn play(&self) -> Result<(), String> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;
        if state.attached.is_none() {
            return Err("nothing attached".to_string());
        }
        state.playing = true;
        Ok(())
    }
}

/// Always-mounted provider for a [`HeadlessSurface`].
pub struct HeadlessProvider(pub Arc<HeadlessSurface>);

impl SurfaceProvider for HeadlessProvider {
    fn current(&self) -> Option<Arc<dyn RenderSurface>> {
        Some(self.0.clone())
    }
}
