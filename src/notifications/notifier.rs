use std::sync::Arc;

use async_trait::async_trait;

use super::provider::{NotificationMessage, NotificationProvider};
use crate::error::AppResult;

/// Receives job progress messages and error reports
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job_id: &str, message: &str, is_final: bool) -> AppResult<()>;

    async fn send_error_notification(&self, subject: &str, cause: &str) -> AppResult<()>;
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job_id: &str, message: &str, is_final: bool) -> AppResult<()> {
        if is_final {
            tracing::info!(job_id = %job_id, "{message}");
        } else {
            tracing::debug!(job_id = %job_id, "{message}");
        }
        Ok(())
    }

    async fn send_error_notification(&self, subject: &str, cause: &str) -> AppResult<()> {
        tracing::error!(subject = %subject, cause = %cause, "Job error notification");
        Ok(())
    }
}

/// Forwards final messages and error reports to a notification provider;
/// intermediate progress only goes to the log
pub struct ProviderNotifier {
    provider: Arc<dyn NotificationProvider>,
}

impl ProviderNotifier {
    pub fn new(provider: Arc<dyn NotificationProvider>) -> Self {
        Self { provider }
    }

    async fn deliver(&self, message: NotificationMessage) -> AppResult<()> {
        let result = self.provider.send(&message).await?;
        if result.success {
            tracing::debug!(
                provider = self.provider.name(),
                duration_ms = result.duration_ms,
                "Notification delivered"
            );
        } else {
            tracing::warn!(
                provider = self.provider.name(),
                status_code = ?result.status_code,
                response = ?result.response,
                "Notification delivery failed"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for ProviderNotifier {
    async fn notify(&self, job_id: &str, message: &str, is_final: bool) -> AppResult<()> {
        LogNotifier.notify(job_id, message, is_final).await?;
        if !is_final {
            return Ok(());
        }
        self.deliver(NotificationMessage::new(message).with_metadata("job_id", job_id))
            .await
    }

    async fn send_error_notification(&self, subject: &str, cause: &str) -> AppResult<()> {
        LogNotifier.send_error_notification(subject, cause).await?;
        self.deliver(
            NotificationMessage::new(cause)
                .with_title(subject)
                .with_metadata("kind", "error"),
        )
        .await
    }
}
