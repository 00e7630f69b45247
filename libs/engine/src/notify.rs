//! Outbound webhook notifier
//!
//! Runs created with a `notify_url` get a POST when they reach a terminal
//! state. Fire-and-forget: failures are logged, never surfaced to the
//! scheduler path that triggered them.

use std::time::Duration;

use crate::events::EventEnvelope;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook client shared across the scheduler and reaper
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Post the event to the URL on a detached task.
    pub fn notify(&self, url: &str, event: &EventEnvelope) {
        let client = self.client.clone();
        let url = url.to_string();
        let body = serde_json::to_value(event).unwrap_or_default();

        tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(NOTIFY_TIMEOUT)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(url = %url, status = %response.status(), "webhook notify rejected");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "webhook notify failed");
                }
            }
        });
    }
}
