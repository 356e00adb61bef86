//! CLI-list provider for opencode sessions
//!
//! Polls `opencode session list --format json -n <N>` and diffs the
//! snapshot against the previous pass. The list carries no message
//! detail, so status collapses to the time-window rule.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{Agent, Event, EventKind, SpawnConfig, Status};
use crate::provider::registry::EVENT_BUFFER;
use crate::provider::{Provider, ProviderError};

use super::runner::{RunConfig, Runner};
use super::status_from_activity;

/// One row of `opencode session list --format json`
#[derive(Debug, Clone, Deserialize)]
pub struct CliSession {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub updated: i64,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub created: i64,
    #[serde(rename = "projectId", default)]
    pub project_id: String,
    #[serde(default)]
    pub directory: String,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Provider backed by the opencode CLI
#[derive(Clone)]
pub struct CliProvider {
    binary: PathBuf,
    list_limit: u32,
    watch_interval: StdDuration,
    max_age: StdDuration,
    /// Default working directory for spawned sessions
    work_dir: PathBuf,
    agents: Arc<RwLock<HashMap<String, Agent>>>,
}

impl CliProvider {
    pub fn new(list_limit: u32, watch_interval: StdDuration, max_age: StdDuration) -> Self {
        let binary = which::which("opencode").unwrap_or_else(|_| PathBuf::from("opencode"));
        Self {
            binary,
            list_limit,
            watch_interval,
            max_age,
            work_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Run the list command and parse its JSON output
    async fn list_sessions(&self) -> Result<Vec<CliSession>> {
        let output = tokio::process::Command::new(&self.binary)
            .args([
                "session",
                "list",
                "--format",
                "json",
                "-n",
                &self.list_limit.to_string(),
            ])
            .output()
            .await
            .context("Failed to run opencode session list")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("opencode session list exited with {}: {}", output.status, stderr.trim());
        }

        serde_json::from_slice(&output.stdout).context("Failed to parse session list output")
    }

    /// Upsert the agent for a listed session, preserving identity
    fn upsert(&self, row: &CliSession, now: DateTime<Utc>) -> Agent {
        let existing = self.agents.read().unwrap().get(&row.id).cloned();
        let agent = match existing {
            Some(agent) => agent,
            None => {
                let agent = Agent::new(row.id.clone(), "opencode-cli", from_millis(row.created));
                self.agents
                    .write()
                    .unwrap()
                    .insert(row.id.clone(), agent.clone());
                agent
            }
        };

        agent.set_name(row.title.clone());
        agent.set_directory(row.directory.clone());
        agent.set_project_id(row.project_id.clone());
        agent.set_last_activity(from_millis(row.updated));
        agent.set_status(status_from_activity(from_millis(row.updated), now));
        agent
    }

    fn too_old(&self, updated: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.max_age.is_zero() {
            return false;
        }
        (now - updated)
            .to_std()
            .map(|age| age > self.max_age)
            .unwrap_or(false)
    }

    /// One poll pass: diff the listing against the index
    async fn poll(&self) -> Vec<Event> {
        let rows = match self.list_sessions().await {
            Ok(rows) => rows,
            Err(e) => {
                // Transient; retried on the next tick
                debug!("Session list failed: {}", e);
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut events = Vec::new();

        for row in &rows {
            if self.too_old(from_millis(row.updated), now) {
                continue;
            }

            let known = self.agents.read().unwrap().get(&row.id).cloned();
            match known {
                None => {
                    let agent = self.upsert(row, now);
                    events.push(Event::new(EventKind::Discovered, &agent));
                }
                Some(agent) => {
                    let old_status = agent.status();
                    let old_activity = agent.last_activity();
                    let agent = self.upsert(row, now);

                    let new_status = agent.status();
                    if new_status != old_status {
                        let kind = match new_status {
                            Status::Running => EventKind::Started,
                            Status::Completed => EventKind::Completed,
                            _ => EventKind::Updated,
                        };
                        events.push(Event::new(kind, &agent));
                    } else if agent.last_activity() != old_activity {
                        events.push(Event::new(EventKind::Updated, &agent));
                    }
                }
            }
        }

        events
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn name(&self) -> &str {
        "OpenCode CLI"
    }

    fn kind(&self) -> &str {
        "opencode-cli"
    }

    async fn discover(&self) -> Result<Vec<Agent>> {
        let rows = self.list_sessions().await?;
        let now = Utc::now();

        let mut agents = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for row in &rows {
            if self.too_old(from_millis(row.updated), now) {
                continue;
            }
            seen.insert(row.id.clone());
            agents.push(self.upsert(row, now));
        }

        self.agents
            .write()
            .unwrap()
            .retain(|id, _| seen.contains(id));

        Ok(agents)
    }

    async fn watch(&self, scope: CancellationToken) -> Result<mpsc::Receiver<Event>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let provider = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(provider.watch_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = ticker.tick() => {
                        for event in provider.poll().await {
                            tokio::select! {
                                _ = scope.cancelled() => return,
                                sent = tx.send(event) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<Agent, ProviderError> {
        let directory = if config.directory.is_empty() {
            self.work_dir.clone()
        } else {
            PathBuf::from(&config.directory)
        };

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.current_dir(&directory);
        cmd.envs(&config.env);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        cmd.spawn()
            .map_err(|e| ProviderError::SpawnFailed(e.to_string()))?;

        tokio::time::sleep(StdDuration::from_millis(500)).await;

        let agents = self
            .discover()
            .await
            .map_err(|e| ProviderError::SpawnFailed(e.to_string()))?;

        agents
            .into_iter()
            .max_by_key(|a| a.start_time())
            .ok_or_else(|| ProviderError::SpawnFailed("no session appeared".to_string()))
    }

    fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().unwrap().get(id).cloned()
    }

    fn list(&self) -> Vec<Agent> {
        self.agents.read().unwrap().values().cloned().collect()
    }

    async fn terminate(&self, id: &str) -> Result<(), ProviderError> {
        let agent = self
            .get(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        // The CLI cannot kill a remote session; latch locally
        agent.mark_cancelled();
        Ok(())
    }

    async fn send_input(&self, id: &str, input: &str) -> Result<(), ProviderError> {
        if input.is_empty() {
            return Err(ProviderError::InvalidInput);
        }
        let agent = self
            .get(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;

        let mut runner = Runner::spawn(
            &self.binary,
            RunConfig {
                session_id: id.to_string(),
                directory: agent.directory(),
                message: input.to_string(),
                ..RunConfig::default()
            },
        )
        .map_err(|e| ProviderError::InputFailed(e.to_string()))?;

        // Stream the response into the agent's output buffer. The
        // runner lives in the drain task; the stream closes at EOF.
        let events = runner.take_events();
        let streaming = agent.clone();
        tokio::spawn(async move {
            if let Some(mut events) = events {
                while let Some(event) = events.recv().await {
                    match event.kind.as_str() {
                        "text" if !event.text.is_empty() => {
                            streaming.append_output(event.text.as_bytes());
                            streaming.append_output(b"\n");
                            streaming.touch();
                        }
                        "error" => {
                            streaming.set_last_error(Some(if event.error.is_empty() {
                                "run failed".to_string()
                            } else {
                                event.error
                            }));
                        }
                        "stderr" => {
                            warn!("opencode run stderr: {}", event.text);
                        }
                        _ => {}
                    }
                }
            }
            if let Err(e) = runner.wait().await {
                warn!("opencode run did not exit cleanly: {}", e);
            }
        });

        agent.touch();
        Ok(())
    }
}
