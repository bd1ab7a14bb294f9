//! Ordered, fire-and-forget delivery of job notifications
//!
//! Progress reporting is synchronous, so reporters only enqueue events here.
//! A single consumer task hands them to the [`Notifier`] in order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::notifier::Notifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Progress {
        job_id: String,
        message: String,
        is_final: bool,
    },
    Error {
        subject: String,
        cause: String,
    },
}

/// Cheap handle used by reporters to enqueue notifications
#[derive(Debug, Clone, Default)]
pub struct NotificationSender {
    tx: Option<mpsc::UnboundedSender<NotificationEvent>>,
}

impl NotificationSender {
    /// A sender that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A sender plus the raw receiving end, for callers that consume events
    /// themselves
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Start the consumer task delivering events to `notifier`
    ///
    /// The task stops once every sender is dropped or `shutdown` is
    /// cancelled; events already queued at that point are still delivered.
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, mut rx) = Self::channel();
        tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = shutdown.cancelled() => {
                        rx.close();
                        rx.recv().await
                    }
                };
                match event {
                    Some(event) => deliver(notifier.as_ref(), event).await,
                    None => break,
                }
            }
            tracing::debug!("Notification dispatcher stopped");
        });
        sender
    }

    pub fn notify(&self, job_id: &str, message: &str, is_final: bool) {
        self.send(NotificationEvent::Progress {
            job_id: job_id.to_string(),
            message: message.to_string(),
            is_final,
        });
    }

    pub fn error(&self, subject: &str, cause: &str) {
        self.send(NotificationEvent::Error {
            subject: subject.to_string(),
            cause: cause.to_string(),
        });
    }

    fn send(&self, event: NotificationEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            tracing::debug!("Notification dropped, dispatcher is gone");
        }
    }
}

async fn deliver(notifier: &dyn Notifier, event: NotificationEvent) {
    let result = match &event {
        NotificationEvent::Progress {
            job_id,
            message,
            is_final,
        } => notifier.notify(job_id, message, *is_final).await,
        NotificationEvent::Error { subject, cause } => {
            notifier.send_error_notification(subject, cause).await
        }
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, ?event, "Failed to send notification");
    }
}
