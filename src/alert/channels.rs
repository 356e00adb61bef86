//! Notification channels

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{Alert, Level};

/// Fixed timeout for network-bound channel sends
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// A delivery target for alerts
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// OS-native desktop notifications
pub struct DesktopChannel;

#[async_trait]
impl Channel for DesktopChannel {
    fn name(&self) -> &str {
        "desktop"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let title = alert.title.clone();
        let message = alert.message.clone();
        // notify-rust blocks on the notification daemon
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .body(&message)
                .show()
                .map(|_| ())
        })
        .await
        .context("Notification task failed")?
        .context("Failed to show desktop notification")?;
        Ok(())
    }
}

fn webhook_client() -> Client {
    Client::builder()
        .timeout(SEND_TIMEOUT)
        .build()
        .expect("Failed to create HTTP client")
}

/// Slack incoming-webhook notifications
pub struct SlackChannel {
    webhook_url: String,
    channel: String,
    client: Client,
}

impl SlackChannel {
    pub fn new(webhook_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            channel: channel.into(),
            client: webhook_client(),
        }
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let color = match alert.level {
            Level::Info => "#2196F3",
            Level::Warning => "#FF9800",
            Level::Error => "#F44336",
            Level::Success => "#4CAF50",
        };

        let mut attachment = json!({
            "color": color,
            "title": alert.title,
            "text": alert.message,
            "footer": "AUTO",
            "ts": alert.timestamp.timestamp(),
        });

        if let Some(agent) = &alert.agent {
            attachment["fields"] = json!([
                { "title": "Agent", "value": agent.name(), "short": true },
                { "title": "Status", "value": agent.status().as_str(), "short": true },
            ]);
        }

        let payload = json!({
            "channel": self.channel,
            "attachments": [attachment],
        });

        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("Slack webhook request failed")?;

        if resp.status().as_u16() >= 400 {
            anyhow::bail!("Slack webhook returned status {}", resp.status());
        }

        Ok(())
    }
}

/// Discord webhook notifications
pub struct DiscordChannel {
    webhook_url: String,
    client: Client,
}

impl DiscordChannel {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: webhook_client(),
        }
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let color = match alert.level {
            Level::Info => 2201331,
            Level::Warning => 16750592,
            Level::Error => 15158332,
            Level::Success => 3066993,
        };

        let mut embed = json!({
            "title": alert.title,
            "description": alert.message,
            "color": color,
            "timestamp": alert.timestamp.to_rfc3339(),
            "footer": { "text": "AUTO" },
        });

        if let Some(agent) = &alert.agent {
            embed["fields"] = json!([
                { "name": "Agent", "value": agent.name(), "inline": true },
                { "name": "Status", "value": agent.status().as_str(), "inline": true },
            ]);
        }

        let payload = json!({ "embeds": [embed] });

        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("Discord webhook request failed")?;

        if resp.status().as_u16() >= 400 {
            anyhow::bail!("Discord webhook returned status {}", resp.status());
        }

        Ok(())
    }
}
