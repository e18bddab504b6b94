//! Camera permission probing and change notifications
//!
//! Not every platform can introspect camera permission. When it cannot, the
//! monitor reports the last state learned from an acquisition outcome, which
//! starts out as `Unknown`.

use std::sync::{Arc, Mutex};

use super::{CameraBackend, PermissionState};
use crate::subscription::{Subscribers, Subscription};

pub struct PermissionMonitor {
    backend: Arc<dyn CameraBackend>,
    last_observed: Arc<Mutex<PermissionState>>,
    subscribers: Subscribers<PermissionState>,
    platform_watch: Mutex<Option<Subscription>>,
}

impl PermissionMonitor {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        let last_observed = Arc::new(Mutex::new(PermissionState::Unknown));
        let subscribers = Subscribers::new();

        let watch = {
            let last_observed = last_observed.clone();
            let subscribers = subscribers.clone();
            backend.watch_permission(Box::new(move |state| {
                record(&last_observed, &subscribers, state);
            }))
        };
        if watch.is_none() {
            tracing::debug!("Platform does not report camera permission changes");
        }

        Self {
            backend,
            last_observed,
            subscribers,
            platform_watch: Mutex::new(watch),
        }
    }

    /// Query the platform, degrading to the last observed state when the
    /// platform cannot answer.
    pub async fn probe(&self) -> PermissionState {
        match self.backend.query_permission().await {
            Some(state) => {
                record(&self.last_observed, &self.subscribers, state);
                state
            }
            None => self.last_observed(),
        }
    }

    /// Record a state learned outside the platform query, e.g. a denied
    /// acquisition.
    pub fn observe(&self, state: PermissionState) {
        record(&self.last_observed, &self.subscribers, state);
    }

    pub fn last_observed(&self) -> PermissionState {
        self.last_observed
            .lock()
            .map(|state| *state)
            .unwrap_or(PermissionState::Unknown)
    }

    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(PermissionState) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(on_change)
    }

    /// Stop listening to the platform. Later probes still work.
    pub fn close(&self) {
        let watch = self.platform_watch.lock().ok().and_then(|mut w| w.take());
        if let Some(watch) = watch {
            watch.unsubscribe();
            tracing::debug!("Released platform permission watch");
        }
    }
}

impl Drop for PermissionMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

fn record(
    last_observed: &Mutex<PermissionState>,
    subscribers: &Subscribers<PermissionState>,
    state: PermissionState,
) {
    let changed = match last_observed.lock() {
        Ok(mut current) => {
            let changed = *current != state;
            *current = state;
            changed
        }
        Err(_) => false,
    };

    if changed {
        tracing::info!("Camera permission is now {}", state);
        subscribers.notify(state);
    }
}
