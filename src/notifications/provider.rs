//! Notification provider abstraction.
//!
//! A provider delivers one message over one channel. Job notifications are
//! routed to a provider through [`ProviderNotifier`](super::ProviderNotifier).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// Message to be sent via notification provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Message title/subject (optional for some providers)
    pub title: Option<String>,
    /// Message body/content (required)
    pub body: String,
    /// Additional metadata for provider-specific data
    pub metadata: HashMap<String, String>,
}

impl NotificationMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            title: None,
            body: body.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a notification send attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationResult {
    /// Whether send was successful
    pub success: bool,
    /// HTTP status code or provider-specific status
    pub status_code: Option<u16>,
    /// Response body or error message
    pub response: Option<String>,
    /// Time taken for the operation in milliseconds
    pub duration_ms: u64,
}

/// Trait for notification providers (webhook, email, ...)
///
/// All providers must be Send + Sync for use in async contexts.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Sends a notification message
    ///
    /// Delivery failures are reported in the returned [`NotificationResult`];
    /// an `Err` means the provider itself is misconfigured.
    async fn send(&self, message: &NotificationMessage) -> AppResult<NotificationResult>;

    /// Returns the provider name for logging/debugging
    fn name(&self) -> &'static str;

    /// Validates provider configuration (optional, default no-op)
    async fn validate_config(&self) -> AppResult<()> {
        Ok(())
    }
}
