use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Out-of-band delivery for users who are not connected.
/// Fire-and-forget: implementations never block the caller and never fail
/// the operation that triggered them.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, destination: Uuid, text: &str);
}

/// Logs notifications instead of delivering them.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, destination: Uuid, text: &str) {
        info!("Notification for {}: {}", destination, text);
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    destination: Uuid,
    text: &'a str,
}

/// POSTs `{destination, text}` as JSON to a webhook from a detached task.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url })
    }
}

impl NotificationSink for WebhookSink {
    fn notify(&self, destination: Uuid, text: &str) {
        let request = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { destination, text });

        tokio::spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => debug!("Webhook notification delivered for {}", destination),
                Err(e) => warn!("Webhook notification for {} failed: {}", destination, e),
            }
        });
    }
}
