//! Event classification and multi-channel alerting

pub mod channels;

pub use channels::{Channel, DesktopChannel, DiscordChannel, SlackChannel};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::{Agent, Event, EventKind};
use crate::config::AlertsConfig;
use crate::store::{AlertRecord, Store};

/// Most recent alerts kept in memory; the store retains the rest
pub const RING_CAPACITY: usize = 1000;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
    Success,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Success => "success",
        }
    }
}

/// An alert message
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: String,
    pub level: Level,
    pub title: String,
    pub message: String,
    pub agent_id: Option<String>,
    /// Live agent reference for channel context fields
    pub agent: Option<Agent>,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl Alert {
    pub fn new(level: Level, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            level,
            title: title.into(),
            message: message.into(),
            agent_id: None,
            agent: None,
            timestamp: Utc::now(),
            read: false,
        }
    }
}

type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

/// Manages the alert ring, persistence, and channel fan-out
pub struct Manager {
    channels: Vec<Arc<dyn Channel>>,
    store: Option<Store>,
    ring: RwLock<Vec<Alert>>,
    seq: AtomicU64,
    on_alert: RwLock<Option<AlertCallback>>,
}

impl Manager {
    /// Build a manager with channels enabled by the config
    pub fn new(cfg: &AlertsConfig, store: Option<Store>) -> Self {
        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();

        if cfg.desktop_notifications {
            channels.push(Arc::new(DesktopChannel));
        }
        if cfg.slack_enabled && !cfg.slack_webhook_url.is_empty() {
            channels.push(Arc::new(SlackChannel::new(
                cfg.slack_webhook_url.clone(),
                cfg.slack_channel.clone(),
            )));
        }
        if cfg.discord_enabled && !cfg.discord_webhook_url.is_empty() {
            channels.push(Arc::new(DiscordChannel::new(
                cfg.discord_webhook_url.clone(),
            )));
        }

        Self {
            channels,
            store,
            ring: RwLock::new(Vec::new()),
            seq: AtomicU64::new(1),
            on_alert: RwLock::new(None),
        }
    }

    /// Set the callback invoked for every new alert (for the UI)
    pub fn set_on_alert<F>(&self, f: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        *self.on_alert.write().unwrap() = Some(Box::new(f));
    }

    /// Send an alert: record it, then deliver to every channel in
    /// sequence. Channel failures are isolated; the last error is
    /// returned.
    pub async fn send(&self, alert: Alert) -> Result<()> {
        let alert = self.record(alert).await;
        self.dispatch(&alert).await
    }

    /// Convert an agent event into an alert, if it is one of the
    /// alerting kinds. Channel delivery runs in a short-lived task so
    /// the reconciliation loop never stalls on a webhook.
    pub async fn send_agent_event(&self, event: &Event) {
        let Some(mut alert) = classify(event) else {
            return;
        };
        alert.agent_id = Some(event.agent_id.clone());
        alert.agent = event.agent.clone();
        alert.timestamp = event.timestamp;

        let alert = self.record(alert).await;
        let channels = self.channels.clone();
        tokio::spawn(async move {
            for channel in &channels {
                if let Err(e) = channel.send(&alert).await {
                    warn!("Channel {} failed: {}", channel.name(), e);
                }
            }
        });
    }

    /// Assign identity, push into the ring, persist, fire the callback
    async fn record(&self, mut alert: Alert) -> Alert {
        if alert.id.is_empty() {
            let n = self.seq.fetch_add(1, Ordering::Relaxed);
            alert.id = format!("alert-{n}");
        }

        {
            let mut ring = self.ring.write().unwrap();
            ring.push(alert.clone());
            if ring.len() > RING_CAPACITY {
                let excess = ring.len() - RING_CAPACITY;
                ring.drain(..excess);
            }
        }

        if let Some(store) = &self.store {
            let rec = AlertRecord {
                id: alert.id.clone(),
                agent_id: alert.agent_id.clone(),
                level: alert.level.as_str().to_string(),
                message: format!("{}: {}", alert.title, alert.message),
                timestamp: alert.timestamp,
                read: false,
                metadata: None,
            };
            if let Err(e) = store.alerts().save(&rec).await {
                warn!("Failed to persist alert: {}", e);
            }
        }

        if let Some(callback) = self.on_alert.read().unwrap().as_ref() {
            callback(&alert);
        }

        alert
    }

    async fn dispatch(&self, alert: &Alert) -> Result<()> {
        let mut last_err = None;
        for channel in &self.channels {
            if let Err(e) = channel.send(alert).await {
                warn!("Channel {} failed: {}", channel.name(), e);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Most recent alerts first; limit 0 means all buffered
    pub fn list(&self, limit: usize, unread_only: bool) -> Vec<Alert> {
        let ring = self.ring.read().unwrap();
        let mut result = Vec::new();
        for alert in ring.iter().rev() {
            if limit > 0 && result.len() >= limit {
                break;
            }
            if unread_only && alert.read {
                continue;
            }
            result.push(alert.clone());
        }
        result
    }

    /// Mark one alert as read
    pub async fn mark_read(&self, id: &str) {
        {
            let mut ring = self.ring.write().unwrap();
            if let Some(alert) = ring.iter_mut().find(|a| a.id == id) {
                alert.read = true;
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.alerts().mark_read(id).await {
                warn!("Failed to mark alert read: {}", e);
            }
        }
    }

    /// Mark every alert as read
    pub async fn mark_all_read(&self) {
        {
            let mut ring = self.ring.write().unwrap();
            for alert in ring.iter_mut() {
                alert.read = true;
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.alerts().mark_all_read().await {
                warn!("Failed to mark alerts read: {}", e);
            }
        }
    }

    /// Number of buffered unread alerts
    pub fn unread_count(&self) -> usize {
        self.ring.read().unwrap().iter().filter(|a| !a.read).count()
    }
}

/// Classification policy: only errored, completed, and context_limit
/// events produce alerts.
pub fn classify(event: &Event) -> Option<Alert> {
    let name = event
        .agent
        .as_ref()
        .map(|a| a.name())
        .unwrap_or_else(|| event.agent_id.clone());

    match event.kind {
        EventKind::Errored => {
            let mut message = format!("{name} encountered an error");
            if let Some(err) = event.agent.as_ref().and_then(|a| a.last_error()) {
                message.push_str(": ");
                message.push_str(&err);
            } else if let Some(err) = &event.error {
                message.push_str(": ");
                message.push_str(err);
            }
            Some(Alert::new(Level::Error, "Agent Error", message))
        }
        EventKind::Completed => Some(Alert::new(
            Level::Success,
            "Agent Completed",
            format!("{name} completed its task"),
        )),
        EventKind::ContextLimit => Some(Alert::new(
            Level::Warning,
            "Context Limit Warning",
            format!("{name} is approaching context limit"),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    fn event(kind: EventKind) -> Event {
        let agent = Agent::new("ses_A", "opencode", Utc::now());
        agent.set_name("frontend-dev");
        Event::new(kind, &agent)
    }

    #[test]
    fn classification_table() {
        let errored = classify(&event(EventKind::Errored)).unwrap();
        assert_eq!(errored.level, Level::Error);
        assert_eq!(errored.title, "Agent Error");
        assert_eq!(errored.message, "frontend-dev encountered an error");

        let completed = classify(&event(EventKind::Completed)).unwrap();
        assert_eq!(completed.level, Level::Success);
        assert_eq!(completed.title, "Agent Completed");
        assert_eq!(completed.message, "frontend-dev completed its task");

        let limit = classify(&event(EventKind::ContextLimit)).unwrap();
        assert_eq!(limit.level, Level::Warning);
        assert_eq!(limit.title, "Context Limit Warning");
    }

    #[test]
    fn other_events_do_not_alert() {
        for kind in [
            EventKind::Discovered,
            EventKind::Updated,
            EventKind::Started,
            EventKind::Terminated,
            EventKind::Input,
            EventKind::Output,
        ] {
            assert!(classify(&event(kind)).is_none(), "{kind:?}");
        }
    }

    #[test]
    fn errored_message_includes_last_error() {
        let agent = Agent::new("ses_A", "opencode", Utc::now());
        agent.set_name("backend-api");
        agent.set_last_error(Some("tool bash failed".to_string()));
        let alert = classify(&Event::new(EventKind::Errored, &agent)).unwrap();
        assert_eq!(
            alert.message,
            "backend-api encountered an error: tool bash failed"
        );
    }
}
