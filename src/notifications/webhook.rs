//! Webhook notification provider implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::json;

use super::provider::{NotificationMessage, NotificationProvider, NotificationResult};
use crate::config::WebhookConfig;
use crate::error::{AppError, AppResult};

/// Webhook notification provider
///
/// Sends the message as a JSON body to the configured URL.
///
/// # Example
/// ```ignore
/// let provider = WebhookProvider::new(settings.notifications.webhook.clone())?;
/// let result = provider.send(&NotificationMessage::new("done")).await?;
/// ```
pub struct WebhookProvider {
    config: WebhookConfig,
    client: Client,
}

impl WebhookProvider {
    pub fn new(config: WebhookConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AppError::Configuration {
                key: "notifications.webhook".to_string(),
                source: anyhow::Error::from(e),
            })?;
        Ok(Self { config, client })
    }

    /// Parses HTTP method string into reqwest Method
    fn parse_method(&self) -> Result<Method, AppError> {
        self.config
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| AppError::Validation {
                field: "notifications.webhook.method".to_string(),
                reason: format!("Invalid HTTP method: {}", self.config.method),
            })
    }
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    async fn send(&self, message: &NotificationMessage) -> AppResult<NotificationResult> {
        let start = Instant::now();

        let method = self.parse_method()?;
        let mut request = self.client.request(method, &self.config.url).json(&json!({
            "title": message.title,
            "body": message.body,
            "metadata": message.metadata,
        }));

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.send().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                let success = resp.status().is_success();
                let response_text = resp.text().await.ok();

                Ok(NotificationResult {
                    success,
                    status_code: Some(status_code),
                    response: response_text,
                    duration_ms,
                })
            }
            // Transport errors are a failed delivery, not a provider error
            Err(e) => Ok(NotificationResult {
                success: false,
                status_code: None,
                response: Some(e.to_string()),
                duration_ms,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }

    /// Checks the URL parses with an http(s) scheme and the method is valid
    async fn validate_config(&self) -> AppResult<()> {
        let url = Url::parse(&self.config.url).map_err(|_| AppError::Validation {
            field: "notifications.webhook.url".to_string(),
            reason: "Invalid URL format".to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Validation {
                field: "notifications.webhook.url".to_string(),
                reason: "Only HTTP(S) URLs are allowed".to_string(),
            });
        }

        self.parse_method()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(url: &str, method: &str) -> WebhookProvider {
        WebhookProvider::new(WebhookConfig {
            url: url.to_string(),
            method: method.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_validate_config_accepts_http_and_https() {
        assert!(provider("https://hooks.example.com/a", "POST").validate_config().await.is_ok());
        assert!(provider("http://localhost:9000/hook", "put").validate_config().await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_config_rejects_bad_url_and_scheme() {
        assert!(provider("not a url", "POST").validate_config().await.is_err());
        assert!(provider("ftp://example.com/x", "POST").validate_config().await.is_err());
    }

    #[tokio::test]
    async fn test_validate_config_rejects_bad_method() {
        let err = provider("https://example.com", "NOT A METHOD")
            .validate_config()
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_send_to_unreachable_host_reports_failure() {
        let result = provider("http://127.0.0.1:1/hook", "POST")
            .send(&NotificationMessage::new("hello"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.status_code.is_none());
    }
}
