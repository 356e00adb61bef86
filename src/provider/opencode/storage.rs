//! Storage-tree provider for opencode sessions
//!
//! Sessions live in a storage tree written by the opencode runtime:
//!
//! ```text
//! storage/
//!   session/<project_id>/<session_id>.json
//!   message/<session_id>/<message_id>.json
//!   part/<message_id>/<part_id>.json
//! ```
//!
//! Watching polls the tree on `watch_interval`; polling doubles as the
//! safety net for missed change notifications on network filesystems.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{Agent, Event, EventKind, Metrics, RefreshState, SpawnConfig, Status};
use crate::provider::registry::EVENT_BUFFER;
use crate::provider::{Provider, ProviderError};

use super::{
    status_from_activity, TokenCosts, BYTES_PER_TOKEN, CONTEXT_WINDOW_TOKENS, ERROR_WINDOW,
};

/// Session metadata file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionData {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "projectID", default)]
    pub project_id: String,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "parentID", default)]
    pub parent_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time: SessionTime,
    #[serde(default)]
    pub summary: SessionSummary,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SessionTime {
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub created: i64,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub updated: i64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SessionSummary {
    #[serde(default)]
    pub additions: i64,
    #[serde(default)]
    pub deletions: i64,
    #[serde(default)]
    pub files: i64,
}

/// A message in the session
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageData {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(default)]
    pub summary: MessageSummary,
    #[serde(default)]
    pub agent: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageSummary {
    #[serde(default)]
    pub title: String,
}

/// A message part (content, tool calls, etc.)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartData {
    pub id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    /// "text", "tool-invocation", etc.
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "toolName", default)]
    pub tool_name: String,
    #[serde(rename = "toolCallId", default)]
    pub tool_call_id: String,
    /// "running", "success", "error"
    #[serde(default)]
    pub state: String,
}

/// A session plus its full message/part history, ordered by creation time
struct LoadedSession {
    session: SessionData,
    messages: Vec<MessageData>,
    /// (role of owning message, part), ordered by part creation time
    parts: Vec<(String, PartData)>,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Provider over an opencode storage tree
#[derive(Clone)]
pub struct StorageProvider {
    storage_path: PathBuf,
    watch_interval: StdDuration,
    max_age: StdDuration,
    context_limit_pct: u8,
    costs: TokenCosts,
    opencode_bin: PathBuf,
    agents: Arc<RwLock<HashMap<String, Agent>>>,
}

impl StorageProvider {
    pub fn new(
        storage_path: impl Into<PathBuf>,
        watch_interval: StdDuration,
        max_age: StdDuration,
    ) -> Self {
        let opencode_bin = which::which("opencode").unwrap_or_else(|_| PathBuf::from("opencode"));
        Self {
            storage_path: storage_path.into(),
            watch_interval,
            max_age,
            context_limit_pct: 90,
            costs: TokenCosts::default(),
            opencode_bin,
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_pricing(mut self, costs: TokenCosts) -> Self {
        self.costs = costs;
        self
    }

    /// Context utilization percentage above which sessions are flagged
    /// (0 disables the flag)
    pub fn with_context_limit(mut self, pct: u8) -> Self {
        self.context_limit_pct = pct;
        self
    }

    /// Read a session file and its message/part history
    fn load_session(&self, session_file: &Path) -> Result<LoadedSession> {
        let raw = std::fs::read(session_file)
            .with_context(|| format!("Failed to read session file {:?}", session_file))?;
        let session: SessionData =
            serde_json::from_slice(&raw).context("Failed to parse session file")?;

        let mut messages = Vec::new();
        let messages_path = self.storage_path.join("message").join(&session.id);
        if let Ok(entries) = std::fs::read_dir(&messages_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(raw) = std::fs::read(&path) else {
                    continue;
                };
                let Ok(msg) = serde_json::from_slice::<MessageData>(&raw) else {
                    continue;
                };
                messages.push(msg);
            }
        }
        messages.sort_by_key(|m| m.time.created);

        let mut parts = Vec::new();
        for msg in &messages {
            let parts_path = self.storage_path.join("part").join(&msg.id);
            let Ok(entries) = std::fs::read_dir(&parts_path) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(raw) = std::fs::read(&path) else {
                    continue;
                };
                let Ok(part) = serde_json::from_slice::<PartData>(&raw) else {
                    continue;
                };
                parts.push((msg.role.clone(), part));
            }
        }
        parts.sort_by_key(|(_, p)| p.time.created);

        Ok(LoadedSession {
            session,
            messages,
            parts,
        })
    }

    /// Load or refresh the agent for a session file, preserving the
    /// handle for ids seen before
    fn load_agent(&self, session_file: &Path, now: DateTime<Utc>) -> Result<Agent> {
        let loaded = self.load_session(session_file)?;
        let refresh = derive(&loaded, now, self.costs, self.context_limit_pct);

        let existing = self.agents.read().unwrap().get(&loaded.session.id).cloned();
        let agent = match existing {
            Some(agent) => agent,
            None => {
                let agent = Agent::new(
                    loaded.session.id.clone(),
                    "opencode",
                    from_millis(loaded.session.time.created),
                );
                self.agents
                    .write()
                    .unwrap()
                    .insert(loaded.session.id.clone(), agent.clone());
                agent
            }
        };
        agent.apply_refresh(refresh);
        Ok(agent)
    }

    /// Paths of every session file under the tree
    fn session_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let session_base = self.storage_path.join("session");
        let Ok(project_dirs) = std::fs::read_dir(&session_base) else {
            return files;
        };
        for project_dir in project_dirs.flatten() {
            let project_path = project_dir.path();
            if !project_path.is_dir() {
                continue;
            }
            let Ok(entries) = std::fs::read_dir(&project_path) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    files.push(path);
                }
            }
        }
        files
    }

    fn too_old(&self, agent: &Agent, now: DateTime<Utc>) -> bool {
        if self.max_age.is_zero() {
            return false;
        }
        let age = now - agent.last_activity();
        age.to_std().map(|age| age > self.max_age).unwrap_or(false)
    }

    /// One watch tick: rescan the tree and emit events for anything
    /// that appeared or changed
    fn scan(&self) -> Vec<Event> {
        let now = Utc::now();
        let mut events = Vec::new();

        for session_file in self.session_files() {
            let id = match session_file.file_stem().and_then(|s| s.to_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };

            let known = self.agents.read().unwrap().get(&id).cloned();
            match known {
                None => {
                    let agent = match self.load_agent(&session_file, now) {
                        Ok(agent) => agent,
                        Err(e) => {
                            debug!("Skipping invalid session file {:?}: {}", session_file, e);
                            continue;
                        }
                    };
                    if self.too_old(&agent, now) {
                        self.agents.write().unwrap().remove(&id);
                        continue;
                    }
                    events.push(Event::new(EventKind::Discovered, &agent));
                }
                Some(agent) => {
                    let old_status = agent.status();
                    let old_activity = agent.last_activity();
                    let old_output = agent.output_total();

                    if let Err(e) = self.load_agent(&session_file, now) {
                        debug!("Refresh failed for {}: {}", id, e);
                        continue;
                    }

                    let new_status = agent.status();
                    if new_status != old_status {
                        let kind = transition_event(new_status);
                        events.push(Event::new(kind, &agent));
                    } else if agent.output_total() != old_output {
                        events.push(Event::new(EventKind::Output, &agent));
                    } else if agent.last_activity() != old_activity {
                        events.push(Event::new(EventKind::Updated, &agent));
                    }
                }
            }
        }

        events
    }
}

/// Event kind for a status transition observed during refresh
fn transition_event(status: Status) -> EventKind {
    match status {
        Status::Running => EventKind::Started,
        Status::Completed => EventKind::Completed,
        Status::Errored => EventKind::Errored,
        Status::ContextLimit => EventKind::ContextLimit,
        _ => EventKind::Updated,
    }
}

/// Re-derive the full agent state from a loaded session
fn derive(
    loaded: &LoadedSession,
    now: DateTime<Utc>,
    costs: TokenCosts,
    context_limit_pct: u8,
) -> RefreshState {
    let session = &loaded.session;
    let mut last_error = None;

    let (mut status, last_activity) = if loaded.messages.is_empty() {
        (Status::Pending, from_millis(session.time.updated))
    } else {
        let last_msg_time = from_millis(
            loaded
                .messages
                .last()
                .map(|m| m.time.created)
                .unwrap_or(session.time.updated),
        );
        let since_last = now - last_msg_time;

        let running = loaded.parts.iter().find(|(_, p)| p.state == "running");
        let errored = loaded.parts.iter().find(|(_, p)| p.state == "error");

        if running.is_some() {
            (Status::Running, now)
        } else if let Some((_, part)) = errored.filter(|_| since_last < ERROR_WINDOW) {
            last_error = Some(if part.text.is_empty() {
                format!("tool {} failed", part.tool_name)
            } else {
                part.text.clone()
            });
            (Status::Errored, from_millis(part.time.created))
        } else {
            (status_from_activity(last_msg_time, now), last_msg_time)
        }
    };

    let metrics = derive_metrics(loaded, costs);
    if context_limit_pct > 0
        && metrics.context_utilization >= f64::from(context_limit_pct) / 100.0
        && matches!(status, Status::Running | Status::Idle)
    {
        status = Status::ContextLimit;
    }

    RefreshState {
        name: session.title.clone(),
        directory: session.directory.clone(),
        project_id: session.project_id.clone(),
        parent_id: session.parent_id.clone(),
        status,
        last_activity,
        current_task: derive_task(loaded),
        last_error,
        metrics,
        output: render_output(loaded),
    }
}

/// The current task is the most recent user message
fn derive_task(loaded: &LoadedSession) -> String {
    for msg in loaded.messages.iter().rev() {
        if msg.role == "user" {
            let mut task = msg.summary.title.trim().to_string();
            if task.is_empty() {
                task = "Working...".to_string();
            }
            if task.len() > 100 {
                task.truncate(100);
                task.push_str("...");
            }
            return task;
        }
    }
    String::new()
}

fn derive_metrics(loaded: &LoadedSession, costs: TokenCosts) -> Metrics {
    let mut metrics = Metrics::default();

    for (role, part) in &loaded.parts {
        if part.part_type == "tool-invocation" {
            metrics.tool_calls += 1;
        }
        if part.state == "error" {
            metrics.error_count += 1;
        }
        if part.part_type == "text" && !part.text.is_empty() {
            // The storage format carries no token counts; estimate
            // from text size
            let tokens = (part.text.len() as u64).div_ceil(BYTES_PER_TOKEN);
            if role == "assistant" {
                metrics.tokens_out += tokens;
            } else {
                metrics.tokens_in += tokens;
            }
        }
    }

    // Assistant turns count as completed tasks unless a part errored
    for msg in &loaded.messages {
        if msg.role != "assistant" {
            continue;
        }
        let parts: Vec<_> = loaded
            .parts
            .iter()
            .filter(|(_, p)| p.message_id == msg.id)
            .collect();
        if parts.is_empty() {
            continue;
        }
        if parts.iter().any(|(_, p)| p.state == "error") {
            metrics.tasks_failed += 1;
        } else {
            metrics.tasks_completed += 1;
        }
    }

    // Split the session span into active and idle time by message gaps
    for pair in loaded.messages.windows(2) {
        let gap = from_millis(pair[1].time.created) - from_millis(pair[0].time.created);
        if let Ok(gap) = gap.to_std() {
            if gap <= StdDuration::from_secs(300) {
                metrics.active_time += gap;
            } else {
                metrics.idle_time += gap;
            }
        }
    }

    metrics.estimated_cost = metrics.tokens_in as f64 / 1000.0 * costs.input
        + metrics.tokens_out as f64 / 1000.0 * costs.output;
    metrics.context_utilization =
        ((metrics.tokens_in + metrics.tokens_out) as f64 / CONTEXT_WINDOW_TOKENS as f64).min(1.0);

    metrics
}

/// Concatenate text parts in creation order
fn render_output(loaded: &LoadedSession) -> String {
    let mut out = String::new();
    for (_, part) in &loaded.parts {
        if part.part_type == "text" && !part.text.is_empty() {
            out.push_str(&part.text);
            out.push('\n');
        }
    }
    out
}

#[async_trait]
impl Provider for StorageProvider {
    fn name(&self) -> &str {
        "OpenCode"
    }

    fn kind(&self) -> &str {
        "opencode"
    }

    async fn discover(&self) -> Result<Vec<Agent>> {
        let now = Utc::now();
        let mut agents = Vec::new();
        let mut seen = HashSet::new();

        let session_base = self.storage_path.join("session");
        if !session_base.exists() {
            // No sessions yet
            self.agents.write().unwrap().clear();
            return Ok(agents);
        }

        for session_file in self.session_files() {
            let agent = match self.load_agent(&session_file, now) {
                Ok(agent) => agent,
                Err(e) => {
                    debug!("Skipping invalid session file {:?}: {}", session_file, e);
                    continue;
                }
            };
            if self.too_old(&agent, now) {
                self.agents.write().unwrap().remove(agent.id());
                continue;
            }
            seen.insert(agent.id().to_string());
            agents.push(agent);
        }

        // Drop index entries whose session files vanished
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
                        for event in provider.scan() {
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
        let mut cmd = tokio::process::Command::new(&self.opencode_bin);
        if !config.directory.is_empty() {
            cmd.current_dir(&config.directory);
        }
        cmd.envs(&config.env);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        cmd.spawn()
            .map_err(|e| ProviderError::SpawnFailed(e.to_string()))?;

        // Give the runtime a moment to create the session on disk
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
        // The storage runtime has no remote kill; latch locally
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

        let mut cmd = tokio::process::Command::new(&self.opencode_bin);
        cmd.args(["run", "-s", id, input]);
        let directory = agent.directory();
        if !directory.is_empty() {
            cmd.current_dir(&directory);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| ProviderError::InputFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                format!("opencode run exited with {}", output.status)
            } else {
                stderr.trim().to_string()
            };
            return Err(ProviderError::InputFailed(detail));
        }

        agent.touch();
        Ok(())
    }
}
