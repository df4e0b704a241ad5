//! Webhook Module
//!
//! This module delivers notification text to a chat webhook (Slack-compatible
//! `{"text": ...}` payload). A single attempt is made per message; retrying is left to
//! whatever invoked the pipeline.
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;

use crate::error::{DmarcError, Result};
use crate::notifier::MessageSender;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// WebhookSender posts messages to a configured webhook URL.
#[derive(Debug)]
pub struct WebhookSender {
    client: Client,
    url: Option<Url>,
}

impl WebhookSender {
    /// Creates a new WebhookSender.
    ///
    /// A missing or blank URL is accepted here and reported on every send, so the
    /// rest of the pipeline still runs and logs its results.
    pub fn new(url: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let url = match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(raw) => Some(Url::parse(raw).context("Invalid webhook URL")?),
            None => None,
        };
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, url })
    }

    /// Creates a sender from the webhook settings in the configuration.
    pub fn from_config(config: &crate::config::Config) -> anyhow::Result<Self> {
        Self::new(
            config.webhook_url.as_deref(),
            Duration::from_secs(config.webhook_timeout),
        )
    }
}

#[async_trait]
impl MessageSender for WebhookSender {
    async fn send_message(&self, text: &str) -> Result<()> {
        let url = self.url.clone().ok_or_else(|| {
            DmarcError::NotificationDelivery("no webhook URL configured".to_string())
        })?;
        let response = self
            .client
            .post(url)
            .json(&WebhookPayload { text })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DmarcError::NotificationDelivery("timeout".to_string())
                } else {
                    DmarcError::NotificationDelivery(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or("unknown status");
            log::warn!("Webhook responded with HTTP {}", status);
            return Err(DmarcError::NotificationDelivery(format!(
                "Error sending webhook message: {}",
                status_text
            )));
        }
        log::info!("Successfully sent webhook message");
        Ok(())
    }
}
