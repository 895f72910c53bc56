//! Messenger Send API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use sdk::{EngineError, MessageSender};

#[derive(Serialize, Debug)]
struct Recipient<'a> {
    id: &'a str,
}

#[derive(Serialize, Debug)]
struct TextMessage<'a> {
    text: &'a str,
}

#[derive(Serialize, Debug)]
struct SendRequest<'a> {
    recipient: Recipient<'a>,
    message: TextMessage<'a>,
}

/// Sends text replies through the Messenger platform
#[derive(Clone)]
pub struct MessengerClient {
    client: Client,
    api_base_url: String,
    api_version: String,
    page_access_token: String,
}

impl std::fmt::Debug for MessengerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerClient")
            .field("api_base_url", &self.api_base_url)
            .field("api_version", &self.api_version)
            .field("page_access_token", &"<redacted>")
            .finish()
    }
}

impl MessengerClient {
    pub fn new(
        api_base_url: impl Into<String>,
        api_version: impl Into<String>,
        page_access_token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            page_access_token: page_access_token.into(),
        }
    }

    fn send_url(&self) -> String {
        format!("{}/{}/me/messages", self.api_base_url, self.api_version)
    }
}

#[async_trait]
impl MessageSender for MessengerClient {
    async fn send_text(&self, user_external_id: &str, text: &str) -> Result<(), EngineError> {
        let body = SendRequest {
            recipient: Recipient {
                id: user_external_id,
            },
            message: TextMessage { text },
        };

        let response = self
            .client
            .post(self.send_url())
            .query(&[("access_token", self.page_access_token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("Send API request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(recipient = %user_external_id, %status, "Send API rejected message");
            return Err(EngineError::Network(format!(
                "Send API returned {}: {}",
                status, detail
            )));
        }

        debug!(recipient = %user_external_id, "Message sent");
        Ok(())
    }
}

/// Logs outgoing messages instead of sending them
#[derive(Debug, Default, Clone)]
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
    async fn send_text(&self, user_external_id: &str, text: &str) -> Result<(), EngineError> {
        info!(recipient = %user_external_id, "Reply: {}", text);
        Ok(())
    }
}
