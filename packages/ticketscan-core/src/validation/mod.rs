//! Code validation.
//!
//! The session hands decoded codes to a [`ValidationClient`] and passes its
//! verdict (or error) back to the caller unchanged.

mod client;

pub use client::HttpValidationClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The validation service's answer for one code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    /// Whatever record the service associates with the code; opaque to the core
    #[serde(default)]
    pub record: serde_json::Value,
    pub is_valid: bool,
    #[serde(default)]
    pub message: String,
}

#[async_trait]
pub trait ValidationClient: Send + Sync {
    async fn submit_code(&self, code: &str) -> Result<ValidationVerdict, ValidationError>;
}
