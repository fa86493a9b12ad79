//! Mail gateway seam and its Resend HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use courier_common::config::AppConfig;
use courier_common::error::AppError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mail gateway unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail gateway rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

/// Sends one email. Implementations must tolerate concurrent calls up to the
/// worker pool size.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

/// Delivers plain-text email through the Resend API.
#[derive(Debug, Clone)]
pub struct ResendTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
    subject: String,
}

impl ResendTransport {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let api_key = config
            .resend_api_key
            .clone()
            .ok_or_else(|| AppError::Config("RESEND_API_KEY is required for email delivery".into()))?;
        let from = config
            .email_from
            .clone()
            .ok_or_else(|| AppError::Config("EMAIL_FROM is required for email delivery".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.resend_api_url.clone(),
            api_key,
            from,
            subject: config.email_subject.clone(),
        })
    }
}

#[async_trait]
impl MailTransport for ResendTransport {
    async fn send(&self, to: &str, body: &str) -> Result<(), TransportError> {
        let email = ResendEmail {
            from: &self.from,
            to: [to],
            subject: &self.subject,
            text: body,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&email)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(to, "Email accepted by mail gateway");
        Ok(())
    }
}
