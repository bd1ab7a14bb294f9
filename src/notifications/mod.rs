//! Job notifications with pluggable delivery channels.
//!
//! Reporters enqueue events through a [`NotificationSender`]; a dispatcher
//! task hands them to a [`Notifier`]. The default notifier only logs, the
//! provider-backed one forwards final messages and errors to a webhook.

mod dispatch;
mod notifier;
mod provider;
mod webhook;

pub use dispatch::{NotificationEvent, NotificationSender};
pub use notifier::{LogNotifier, Notifier, ProviderNotifier};
pub use provider::{NotificationMessage, NotificationProvider, NotificationResult};
pub use webhook::WebhookProvider;
