//! Webhook notification channel.
//!
//! Endpoint: POST {url} with the EventRecord as JSON body
//! Auth: optional Bearer token

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::EventRecord;
use crate::notify::{ChannelError, NotificationChannel};

/// Delivers events to an HTTP endpoint
pub struct WebhookChannel {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a channel posting to `url`
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            url: url.into(),
            token: None,
            client,
        })
    }

    /// Authenticate with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &EventRecord) -> Result<(), ChannelError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("X-Event-Id", event.id.to_string())
            .json(event);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Delivery(format!("POST {} failed: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(ChannelError::Delivery(format!(
                "POST {} answered {}",
                self.url,
                response.status()
            )));
        }

        Ok(())
    }
}
