//! Delivery of email side effects.

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::config::EmailSettings;
use crate::error::{AppError, Result};
use crate::observability::mask_email;

/// Executes one email delivery. Implementations do not retry internally;
/// retries are the dispatcher's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        text_body: &str,
        html_body: &str,
    ) -> Result<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html_body: &'a str,
    text_body: &'a str,
}

/// Sends email through a JSON HTTP API.
pub struct HttpEmailSender {
    client: Client,
    base_url: String,
    sender: String,
    authorization_token: String,
}

impl HttpEmailSender {
    pub fn new(settings: &EmailSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(anyhow!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            sender: settings.sender.clone(),
            authorization_token: settings.authorization_token.clone(),
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        text_body: &str,
        html_body: &str,
    ) -> Result<()> {
        let url = format!("{}/email", self.base_url);
        let request = SendEmailRequest {
            from: &self.sender,
            to: recipient,
            subject,
            html_body,
            text_body,
        };

        debug!(url = %url, recipient = %mask_email(recipient), "Sending email");

        let response = self
            .client
            .post(&url)
            .header("X-Server-Token", &self.authorization_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::SendFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::SendFailure(format!("HTTP {}: {}", status, body)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EmailSettings {
        EmailSettings {
            api_base_url: "http://localhost:8025/".to_string(),
            sender: "newsletter@example.com".to_string(),
            authorization_token: "token".to_string(),
            timeout_ms: 200,
        }
    }

    #[test]
    fn test_request_uses_pascal_case_fields() {
        let request = SendEmailRequest {
            from: "a@example.com",
            to: "b@example.com",
            subject: "Hi",
            html_body: "<p>Hi</p>",
            text_body: "Hi",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["From"], "a@example.com");
        assert_eq!(json["HtmlBody"], "<p>Hi</p>");
        assert_eq!(json["TextBody"], "Hi");
    }

    #[test]
    fn test_base_url_is_normalized() {
        let sender = HttpEmailSender::new(&settings()).unwrap();
        assert_eq!(sender.base_url, "http://localhost:8025");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_send_failure() {
        let mut settings = settings();
        settings.api_base_url = "http://127.0.0.1:9".to_string();
        let sender = HttpEmailSender::new(&settings).unwrap();

        let err = sender
            .send("reader@example.com", "Hi", "text", "<p>html</p>")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SendFailure(_)));
    }
}
