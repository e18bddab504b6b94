//! Binding a live stream to a render surface
//!
//! The surface is owned by the host UI and may not be mounted when binding
//! starts. The binder waits for it (readiness future first, bounded polling
//! as the fallback), attaches the stream, waits for metadata and starts
//! playback. Every failure path releases the stream.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{MediaStream, StreamSlot};
use crate::error::CaptureError;
use crate::subscription::Subscription;

/// Media readiness of a surface, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Nothing,
    Metadata,
    CurrentData,
    FutureData,
    EnoughData,
}

/// A host-owned render target. The binder never owns or frees it.
pub trait RenderSurface: Send + Sync {
    fn attach(&self, stream: &MediaStream);
    fn detach(&self);
    fn ready_state(&self) -> ReadyState;
    /// Fire `callback` when stream metadata has loaded.
    fn on_metadata_ready(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription;
    fn play(&self) -> Result<(), String>;
}

/// Access to the surface the host is (or will be) rendering into.
pub trait SurfaceProvider: Send + Sync {
    /// The surface if it is mounted right now.
    fn current(&self) -> Option<Arc<dyn RenderSurface>>;

    /// Resolves once the surface mounts, for hosts that can announce it.
    fn mounted(&self) -> Option<BoxFuture<'static, Arc<dyn RenderSurface>>> {
        None
    }
}

impl<F> SurfaceProvider for F
where
    F: Fn() -> Option<Arc<dyn RenderSurface>> + Send + Sync,
{
    fn current(&self) -> Option<Arc<dyn RenderSurface>> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOptions {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub metadata_timeout: Duration,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(300),
            max_poll_attempts: 10,
            metadata_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SurfaceBinder {
    options: BindOptions,
}

impl SurfaceBinder {
    pub fn new(options: BindOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BindOptions {
        &self.options
    }

    /// Bind the stream held in `slot` to the provider's surface.
    ///
    /// On any failure, including cancellation, the slot is released before
    /// the error is returned.
    pub async fn bind(
        &self,
        slot: &StreamSlot,
        provider: &dyn SurfaceProvider,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn RenderSurface>, CaptureError> {
        let result = self.bind_inner(slot, provider, cancel).await;
        if let Err(ref err) = result {
            let stopped = slot.release();
            tracing::debug!("Bind failed ({}); released {} track(s)", err, stopped);
        }
        result
    }

    async fn bind_inner(
        &self,
        slot: &StreamSlot,
        provider: &dyn SurfaceProvider,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn RenderSurface>, CaptureError> {
        if cancel.is_cancelled() {
            return Err(CaptureError::Aborted);
        }
        let stream = slot.stream().ok_or(CaptureError::Aborted)?;

        let surface = self.wait_for_surface(provider, cancel).await?;

        if let Err(err) = self.attach_and_wait(&surface, &stream, cancel).await {
            surface.detach();
            return Err(err);
        }

        if let Err(message) = surface.play() {
            surface.detach();
            return Err(CaptureError::Playback(message));
        }

        tracing::info!("Stream {} is playing", stream.id);
        Ok(surface)
    }

    async fn wait_for_surface(
        &self,
        provider: &dyn SurfaceProvider,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn RenderSurface>, CaptureError> {
        let attempts = self.options.max_poll_attempts.max(1);

        if let Some(mounted) = provider.mounted() {
            if let Some(surface) = provider.current() {
                return Ok(surface);
            }
            let budget = self.options.poll_interval.checked_mul(attempts).unwrap_or(Duration::MAX);
            tracing::debug!("Waiting up to {:?} for render surface to mount", budget);
            return tokio::select! {
                _ = cancel.cancelled() => Err(CaptureError::Aborted),
                result = tokio::time::timeout(budget, mounted) => result.map_err(|_| {
                    CaptureError::SurfaceTimeout(format!("render surface not mounted within {:?}", budget))
                }),
            };
        }

        for attempt in 1..=attempts {
            if let Some(surface) = provider.current() {
                if attempt > 1 {
                    tracing::debug!("Render surface found on attempt {}", attempt);
                }
                return Ok(surface);
            }
            tracing::debug!("Render surface not mounted (attempt {}/{})", attempt, attempts);

            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CaptureError::Aborted),
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }

        tracing::warn!("Render surface never mounted after {} attempts", attempts);
        Err(CaptureError::SurfaceTimeout(format!(
            "render surface not mounted after {} attempts",
            attempts
        )))
    }

    async fn attach_and_wait(
        &self,
        surface: &Arc<dyn RenderSurface>,
        stream: &MediaStream,
        cancel: &CancellationToken,
    ) -> Result<(), CaptureError> {
        let ready = Arc::new(Notify::new());
        let subscription = {
            let ready = ready.clone();
            surface.on_metadata_ready(Box::new(move || ready.notify_one()))
        };

        surface.attach(stream);

        let outcome = if surface.ready_state() >= ReadyState::Metadata {
            Ok(())
        } else {
            tokio::select! {
                _ = cancel.cancelled() => Err(CaptureError::Aborted),
                _ = ready.notified() => Ok(()),
                _ = tokio::time::sleep(self.options.metadata_timeout) => {
                    let state = surface.ready_state();
                    if state >= ReadyState::CurrentData {
                        tracing::warn!(
                            "Metadata signal missing after {:?} but surface has data ({:?}); starting playback",
                            self.options.metadata_timeout,
                            state
                        );
                        Ok(())
                    } else {
                        Err(CaptureError::SurfaceTimeout(format!(
                            "stream metadata not ready within {:?}",
                            self.options.metadata_timeout
                        )))
                    }
                }
            }
        };

        subscription.unsubscribe();
        outcome
    }
}
