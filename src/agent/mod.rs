//! Core agent model: status, metrics, events, and the shared agent handle

pub mod output;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use output::OutputBuffer;

/// Current state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Idle,
    Completed,
    Errored,
    ContextLimit,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Idle => "idle",
            Status::Completed => "completed",
            Status::Errored => "errored",
            Status::ContextLimit => "context_limit",
            Status::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "idle" => Ok(Status::Idle),
            "completed" => Ok(Status::Completed),
            "errored" => Ok(Status::Errored),
            "context_limit" => Ok(Status::ContextLimit),
            "cancelled" => Ok(Status::Cancelled),
            _ => anyhow::bail!("Unknown status: {}", s),
        }
    }

    /// Icon used by list renderings
    pub fn icon(&self) -> &'static str {
        match self {
            Status::Pending => "○",
            Status::Running => "●",
            Status::Idle => "◌",
            Status::Completed => "✓",
            Status::Errored => "✗",
            Status::ContextLimit => "⚠",
            Status::Cancelled => "⊘",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent performance metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub estimated_cost: f64,
    pub tool_calls: u64,
    pub error_count: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    #[serde(with = "duration_secs")]
    pub active_time: Duration,
    #[serde(with = "duration_secs")]
    pub idle_time: Duration,
    /// 0.0 - 1.0
    pub context_utilization: f64,
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Type of agent lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Discovered,
    Updated,
    Started,
    Completed,
    Errored,
    ContextLimit,
    Terminated,
    Paused,
    Resumed,
    Input,
    Output,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Discovered => "discovered",
            EventKind::Updated => "updated",
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Errored => "errored",
            EventKind::ContextLimit => "context_limit",
            EventKind::Terminated => "terminated",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Input => "input",
            EventKind::Output => "output",
        }
    }
}

/// An agent lifecycle event emitted by a provider
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub agent_id: String,
    pub agent: Option<Agent>,
    pub timestamp: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, agent: &Agent) -> Self {
        Self {
            kind,
            agent_id: agent.id().to_string(),
            agent: Some(agent.clone()),
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }
}

/// Configuration for spawning a new agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub directory: String,
    pub prompt: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Point-in-time copy of an agent's observable state
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub directory: String,
    pub project_id: String,
    pub parent_id: String,
    pub status: Status,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub current_task: String,
    pub last_error: Option<String>,
    pub metrics: Metrics,
}

/// Mutable agent state guarded by the handle's lock
struct AgentState {
    name: String,
    directory: String,
    project_id: String,
    parent_id: String,
    status: Status,
    last_activity: DateTime<Utc>,
    current_task: String,
    last_error: Option<String>,
    metrics: Metrics,
    output: OutputBuffer,
}

struct AgentInner {
    id: String,
    kind: String,
    start_time: DateTime<Utc>,
    state: RwLock<AgentState>,
}

/// A single upstream AI coding session as observed by the core.
///
/// Cheaply cloneable shared handle; all clones observe the same state.
/// Accessors take a point-in-time view under a read lock, mutators a
/// write lock, so callers never see a torn mix of fields. Once an
/// agent is cancelled its status never changes again.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                id: id.into(),
                kind: kind.into(),
                start_time,
                state: RwLock::new(AgentState {
                    name: String::new(),
                    directory: String::new(),
                    project_id: String::new(),
                    parent_id: String::new(),
                    status: Status::Pending,
                    last_activity: start_time,
                    current_task: String::new(),
                    last_error: None,
                    metrics: Metrics::default(),
                    output: OutputBuffer::default(),
                }),
            }),
        }
    }

    // Identity

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.start_time
    }

    /// Display name; falls back to a shortened id
    pub fn name(&self) -> String {
        let state = self.read();
        if state.name.is_empty() {
            let id = &self.inner.id;
            if id.len() > 8 {
                id[..8].to_string()
            } else {
                id.clone()
            }
        } else {
            state.name.clone()
        }
    }

    pub fn directory(&self) -> String {
        self.read().directory.clone()
    }

    pub fn project_id(&self) -> String {
        self.read().project_id.clone()
    }

    pub fn parent_id(&self) -> String {
        self.read().parent_id.clone()
    }

    /// True for child/background agents spawned by another agent
    pub fn is_background(&self) -> bool {
        !self.read().parent_id.is_empty()
    }

    // Status

    pub fn status(&self) -> Status {
        self.read().status
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.read().last_activity
    }

    pub fn current_task(&self) -> String {
        self.read().current_task.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.read().last_error.clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.read().metrics.clone()
    }

    /// Point-in-time copy of the output buffer
    pub fn output(&self) -> Vec<u8> {
        self.read().output.contents()
    }

    /// Total bytes ever appended to the output buffer
    pub fn output_total(&self) -> u64 {
        self.read().output.total_written()
    }

    /// Output bytes appended after `offset` that are still buffered
    pub fn output_since(&self, offset: u64) -> Vec<u8> {
        self.read().output.since(offset)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let state = self.read();
        let name = if state.name.is_empty() {
            let id = &self.inner.id;
            if id.len() > 8 {
                id[..8].to_string()
            } else {
                id.clone()
            }
        } else {
            state.name.clone()
        };
        AgentSnapshot {
            id: self.inner.id.clone(),
            kind: self.inner.kind.clone(),
            name,
            directory: state.directory.clone(),
            project_id: state.project_id.clone(),
            parent_id: state.parent_id.clone(),
            status: state.status,
            start_time: self.inner.start_time,
            last_activity: state.last_activity,
            current_task: state.current_task.clone(),
            last_error: state.last_error.clone(),
            metrics: state.metrics.clone(),
        }
    }

    // Mutators

    pub fn set_name(&self, name: impl Into<String>) {
        self.write().name = name.into();
    }

    pub fn set_directory(&self, directory: impl Into<String>) {
        self.write().directory = directory.into();
    }

    pub fn set_project_id(&self, project_id: impl Into<String>) {
        self.write().project_id = project_id.into();
    }

    /// Parent references are only set at ingestion from upstream
    /// metadata; self-references are rejected to keep the parent
    /// relation acyclic at the root.
    pub fn set_parent_id(&self, parent_id: impl Into<String>) {
        let parent_id = parent_id.into();
        if parent_id == self.inner.id {
            return;
        }
        self.write().parent_id = parent_id;
    }

    pub fn set_current_task(&self, task: impl Into<String>) {
        self.write().current_task = task.into();
    }

    pub fn set_last_error(&self, err: Option<String>) {
        self.write().last_error = err;
    }

    /// Apply a status transition. Cancelled is terminal: once latched,
    /// every later transition is ignored.
    pub fn set_status(&self, status: Status) {
        let mut state = self.write();
        if state.status == Status::Cancelled {
            return;
        }
        state.status = status;
    }

    /// Latch the terminal cancelled state
    pub fn mark_cancelled(&self) {
        self.write().status = Status::Cancelled;
    }

    /// Advance last_activity; never moves backwards past start_time
    pub fn set_last_activity(&self, at: DateTime<Utc>) {
        let mut state = self.write();
        state.last_activity = at.max(self.inner.start_time);
    }

    /// Record activity now and move Idle/Errored/Completed agents back
    /// to Running
    pub fn touch(&self) {
        let mut state = self.write();
        state.last_activity = Utc::now().max(self.inner.start_time);
        match state.status {
            Status::Pending | Status::Idle | Status::Errored | Status::Completed => {
                state.status = Status::Running;
            }
            _ => {}
        }
    }

    /// Replace metrics. Token counters never decrease within the
    /// agent's lifetime; a re-derivation that would lower them keeps
    /// the previous value.
    pub fn set_metrics(&self, metrics: Metrics) {
        let mut state = self.write();
        let mut metrics = metrics;
        metrics.tokens_in = metrics.tokens_in.max(state.metrics.tokens_in);
        metrics.tokens_out = metrics.tokens_out.max(state.metrics.tokens_out);
        state.metrics = metrics;
    }

    pub fn append_output(&self, chunk: &[u8]) {
        self.write().output.append(chunk);
    }

    /// Atomically replace derived state from a refresh pass. Observers
    /// see either the pre- or post-refresh view, never a mix; the
    /// output reset happens inside the same critical section.
    pub fn apply_refresh(&self, refresh: RefreshState) {
        let mut state = self.write();
        state.name = refresh.name;
        state.directory = refresh.directory;
        state.project_id = refresh.project_id;
        if refresh.parent_id != self.inner.id {
            state.parent_id = refresh.parent_id;
        }
        state.last_activity = refresh.last_activity.max(self.inner.start_time);
        if state.status != Status::Cancelled {
            state.status = refresh.status;
        }
        state.current_task = refresh.current_task;
        state.last_error = refresh.last_error;
        let mut metrics = refresh.metrics;
        metrics.tokens_in = metrics.tokens_in.max(state.metrics.tokens_in);
        metrics.tokens_out = metrics.tokens_out.max(state.metrics.tokens_out);
        state.metrics = metrics;
        state.output.reset();
        state.output.append(refresh.output.as_bytes());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AgentState> {
        self.inner.state.read().unwrap()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AgentState> {
        self.inner.state.write().unwrap()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

/// Fully re-derived state produced by a provider refresh pass
#[derive(Debug, Clone)]
pub struct RefreshState {
    pub name: String,
    pub directory: String,
    pub project_id: String,
    pub parent_id: String,
    pub status: Status,
    pub last_activity: DateTime<Utc>,
    pub current_task: String,
    pub last_error: Option<String>,
    pub metrics: Metrics,
    pub output: String,
}
