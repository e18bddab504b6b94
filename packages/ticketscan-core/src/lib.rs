//! Ticketscan Core Library
//!
//! This crate provides the core functionality for ticket scanning stations:
//! - Camera enumeration, permission probing and stream acquisition
//! - Binding a live stream to a host-owned render surface
//! - The scan session state machine tying the above together
//! - Passing decoded codes to a validation service
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ticketscan_core::capture::{platform_backend, RenderSurface};
//! use ticketscan_core::{config, HttpValidationClient, ScanSession, SessionState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_scan_config();
//!     let surface = || -> Option<Arc<dyn RenderSurface>> { None };
//!
//!     let session = ScanSession::new(
//!         platform_backend(),
//!         Arc::new(surface),
//!         Arc::new(HttpValidationClient::new(&config.validation)),
//!         config.constraints,
//!         config.session,
//!     );
//!
//!     if session.start(None).await? == SessionState::Streaming {
//!         let attempt = session.submit_code("NEBULA-1-abc").await?;
//!         println!("valid: {}", attempt.outcome.is_valid);
//!     }
//!
//!     session.teardown();
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod session;
pub mod subscription;
pub mod validation;

#[cfg(test)]
pub(crate) mod mock;

// Re-export commonly used types
pub use capture::{CameraDevice, Constraints, PermissionState};
pub use config::{ConfigSource, ScanConfig, ValidationEndpointConfig};
pub use error::{CaptureError, SessionError, ValidationError};
pub use session::{ScanAttempt, ScanSession, SessionEvent, SessionOptions, SessionSnapshot, SessionState};
pub use subscription::Subscription;
pub use validation::{HttpValidationClient, ValidationClient, ValidationVerdict};
