//! Session manager: the reconciliation core
//!
//! Owns the authoritative live-agent map, consumes the merged provider
//! event stream, projects agents into the store, forwards events to
//! the alert manager, and mediates user commands.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, Event, EventKind, Status};
use crate::alert::{self, Alert, Level};
use crate::config::Config;
use crate::provider::{ProviderError, Registry};
use crate::store::{MetricRecord, SessionRecord, Store};

/// How agents are grouped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    Flat,
    Kind,
    Project,
    Status,
}

/// A transient named grouping of agents
pub struct Group {
    pub name: String,
    pub agents: Vec<Agent>,
}

/// Aggregate statistics over the live map
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub total: usize,
    pub by_status: HashMap<Status, usize>,
    pub by_kind: HashMap<String, usize>,
    pub by_project: HashMap<String, usize>,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost: f64,
    pub total_tool_calls: u64,
    pub total_errors: u64,
}

/// Live map with stable insertion order
struct LiveMap {
    map: HashMap<String, Agent>,
    order: Vec<String>,
}

impl LiveMap {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn insert(&mut self, agent: Agent) {
        let id = agent.id().to_string();
        if self.map.insert(id.clone(), agent).is_none() {
            self.order.push(id);
        }
    }

    fn remove(&mut self, id: &str) -> Option<Agent> {
        let removed = self.map.remove(id);
        if removed.is_some() {
            self.order.retain(|existing| existing != id);
        }
        removed
    }

    fn get(&self, id: &str) -> Option<&Agent> {
        self.map.get(id)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    /// Agents in insertion order
    fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.order.iter().filter_map(|id| self.map.get(id))
    }

    fn retain(&mut self, keep: &HashSet<String>) {
        self.map.retain(|id, _| keep.contains(id));
        self.order.retain(|id| keep.contains(id));
    }
}

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Coordinates session discovery, monitoring, and lifecycle
pub struct Manager {
    cfg: Config,
    store: Option<Store>,
    registry: Arc<Registry>,
    alerts: Option<Arc<alert::Manager>>,
    agents: RwLock<LiveMap>,
    /// Output bytes already appended to the store's chunk log
    chunk_offsets: RwLock<HashMap<String, u64>>,
    on_event: RwLock<Option<EventCallback>>,
    scope: Mutex<Option<CancellationToken>>,
}

impl Manager {
    pub fn new(
        cfg: Config,
        store: Option<Store>,
        registry: Arc<Registry>,
        alerts: Option<Arc<alert::Manager>>,
    ) -> Self {
        Self {
            cfg,
            store,
            registry,
            alerts,
            agents: RwLock::new(LiveMap::new()),
            chunk_offsets: RwLock::new(HashMap::new()),
            on_event: RwLock::new(None),
            scope: Mutex::new(None),
        }
    }

    /// Set the callback invoked synchronously after each reconciled
    /// event. It must return quickly; a well-behaved UI enqueues to
    /// its own mailbox.
    pub fn set_on_event<F>(&self, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        *self.on_event.write().unwrap() = Some(Box::new(f));
    }

    /// Discover agents, then launch the reconciliation task consuming
    /// the merged watch stream until the scope is cancelled.
    pub async fn start(self: Arc<Self>, scope: &CancellationToken) -> Result<()> {
        let scope = scope.child_token();
        *self.scope.lock().unwrap() = Some(scope.clone());

        // Initial discovery
        let discovered = self.registry.discover_all().await;
        info!("Discovered {} agents", discovered.len());
        {
            let mut agents = self.agents.write().unwrap();
            for agent in &discovered {
                agents.insert(agent.clone());
            }
        }
        for agent in &discovered {
            self.persist(agent).await;
        }

        // Start watching for events
        let mut events = self.registry.watch_all(scope.clone()).await;

        let manager = Arc::clone(&self);
        let event_scope = scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = event_scope.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => manager.handle_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Reconciliation task stopped");
        });

        Self::spawn_long_running_sweep(self, scope);

        Ok(())
    }

    /// Cancel the reconciliation scope. Idempotent.
    pub fn stop(&self) {
        if let Some(scope) = self.scope.lock().unwrap().as_ref() {
            scope.cancel();
        }
    }

    /// Apply one event to the live map, then project, alert, and
    /// notify the UI
    async fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::Terminated => {
                self.agents.write().unwrap().remove(&event.agent_id);
                self.chunk_offsets.write().unwrap().remove(&event.agent_id);
            }
            _ => {
                if let Some(agent) = &event.agent {
                    self.agents.write().unwrap().insert(agent.clone());
                }
            }
        }

        if let Some(agent) = &event.agent {
            self.persist(agent).await;

            if event.kind == EventKind::Output {
                self.append_output_chunk(agent).await;
            }

            // Terminal transitions leave a metric point trail
            if matches!(
                event.kind,
                EventKind::Completed | EventKind::Errored | EventKind::ContextLimit
            ) {
                self.record_metrics(agent).await;
            }
        }

        if let Some(alerts) = &self.alerts {
            alerts.send_agent_event(&event).await;
        }

        if let Some(callback) = self.on_event.read().unwrap().as_ref() {
            callback(&event);
        }
    }

    /// Project an agent into the store. Write failures are logged and
    /// never propagated; the live map is still correct.
    async fn persist(&self, agent: &Agent) {
        let Some(store) = &self.store else {
            return;
        };
        let record = SessionRecord::from_snapshot(&agent.snapshot());
        if let Err(e) = store.sessions().save(&record).await {
            warn!("Failed to persist session {}: {}", agent.id(), e);
        }
    }

    /// Append the output delta since the last persisted offset to the
    /// chunk log
    async fn append_output_chunk(&self, agent: &Agent) {
        let Some(store) = &self.store else {
            return;
        };

        let offset = self
            .chunk_offsets
            .read()
            .unwrap()
            .get(agent.id())
            .copied()
            .unwrap_or(0);
        let delta = agent.output_since(offset);
        if delta.is_empty() {
            return;
        }

        let chunk = String::from_utf8_lossy(&delta).to_string();
        match store.sessions().append_output(agent.id(), &chunk).await {
            Ok(()) => {
                self.chunk_offsets
                    .write()
                    .unwrap()
                    .insert(agent.id().to_string(), agent.output_total());
            }
            Err(e) => {
                // Offset untouched; the delta is retried next time
                warn!("Failed to append output chunk for {}: {}", agent.id(), e);
            }
        }
    }

    /// Save the agent's headline counters as metric points
    async fn record_metrics(&self, agent: &Agent) {
        let Some(store) = &self.store else {
            return;
        };

        let metrics = agent.metrics();
        let now = Utc::now();
        let points = [
            ("tokens_in", metrics.tokens_in as f64),
            ("tokens_out", metrics.tokens_out as f64),
            ("estimated_cost", metrics.estimated_cost),
            ("tool_calls", metrics.tool_calls as f64),
        ];

        for (metric, value) in points {
            let rec = MetricRecord {
                id: uuid::Uuid::new_v4().to_string(),
                agent_id: agent.id().to_string(),
                metric: metric.to_string(),
                value,
                timestamp: now,
            };
            if let Err(e) = store.metrics().save(&rec).await {
                warn!("Failed to save metric for {}: {}", agent.id(), e);
            }
        }
    }

    /// Periodic sweep flagging agents that have been running longer
    /// than the configured threshold
    fn spawn_long_running_sweep(manager: Arc<Self>, scope: CancellationToken) {
        let threshold = manager.cfg.alerts.long_running_threshold;
        let Some(alerts) = manager.alerts.clone() else {
            return;
        };
        if threshold == 0 {
            return;
        }

        tokio::spawn(async move {
            let mut flagged: HashSet<String> = HashSet::new();
            let mut ticker = tokio::time::interval(StdDuration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        for agent in manager.list() {
                            if agent.status() != Status::Running {
                                flagged.remove(agent.id());
                                continue;
                            }
                            let span = (now - agent.start_time())
                                .to_std()
                                .unwrap_or_default();
                            if span.as_secs() > threshold
                                && flagged.insert(agent.id().to_string())
                            {
                                let mut alert = Alert::new(
                                    Level::Warning,
                                    "Long Running Agent",
                                    format!(
                                        "{} has been running for over {} minutes",
                                        agent.name(),
                                        threshold / 60
                                    ),
                                );
                                alert.agent_id = Some(agent.id().to_string());
                                alert.agent = Some(agent.clone());
                                if let Err(e) = alerts.send(alert).await {
                                    warn!("Long-running alert delivery failed: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    // Queries

    /// All agents, in insertion order
    pub fn list(&self) -> Vec<Agent> {
        self.agents.read().unwrap().iter().cloned().collect()
    }

    /// Get an agent by id
    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().unwrap().get(id).cloned()
    }

    /// Agents without a parent
    pub fn list_primary(&self) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.parent_id().is_empty())
            .cloned()
            .collect()
    }

    /// Direct children of the given parent
    pub fn children(&self, parent_id: &str) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.parent_id() == parent_id)
            .cloned()
            .collect()
    }

    /// Number of direct children of the given parent
    pub fn child_count(&self, parent_id: &str) -> usize {
        self.agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.parent_id() == parent_id)
            .count()
    }

    /// Aggregate statistics over the live map
    pub fn stats(&self) -> Stats {
        let agents = self.agents.read().unwrap();
        let mut stats = Stats {
            total: agents.len(),
            ..Stats::default()
        };

        for agent in agents.iter() {
            *stats.by_status.entry(agent.status()).or_default() += 1;
            *stats.by_kind.entry(agent.kind().to_string()).or_default() += 1;
            *stats.by_project.entry(agent.project_id()).or_default() += 1;

            let metrics = agent.metrics();
            stats.total_tokens_in += metrics.tokens_in;
            stats.total_tokens_out += metrics.tokens_out;
            stats.total_cost += metrics.estimated_cost;
            stats.total_tool_calls += metrics.tool_calls;
            stats.total_errors += metrics.error_count;
        }

        stats
    }

    /// Agents grouped by the given mode. Within a group, agents keep
    /// insertion order; callers sort.
    pub fn group_by(&self, mode: GroupMode) -> Vec<Group> {
        let agents = self.agents.read().unwrap();

        let mut names: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Agent>> = HashMap::new();

        for agent in agents.iter() {
            let key = match mode {
                GroupMode::Kind => agent.kind().to_string(),
                GroupMode::Project => agent.project_id(),
                GroupMode::Status => agent.status().as_str().to_string(),
                GroupMode::Flat => "all".to_string(),
            };
            if !groups.contains_key(&key) {
                names.push(key.clone());
            }
            groups.entry(key).or_default().push(agent.clone());
        }

        names
            .into_iter()
            .map(|name| {
                let agents = groups.remove(&name).unwrap_or_default();
                Group { name, agents }
            })
            .collect()
    }

    /// Agents with the given status
    pub fn filter_by_status(&self, status: Status) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.status() == status)
            .cloned()
            .collect()
    }

    /// Agents of the given provider kind
    pub fn filter_by_kind(&self, kind: &str) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.kind() == kind)
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over name, id, directory, and
    /// current task
    pub fn search(&self, query: &str) -> Vec<Agent> {
        let query = query.to_lowercase();
        self.agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| {
                a.name().to_lowercase().contains(&query)
                    || a.id().to_lowercase().contains(&query)
                    || a.directory().to_lowercase().contains(&query)
                    || a.current_task().to_lowercase().contains(&query)
            })
            .cloned()
            .collect()
    }

    /// Number of agents currently running
    pub fn active_count(&self) -> usize {
        self.agents
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.status() == Status::Running)
            .count()
    }

    /// Most recent activity time across the live map
    pub fn last_activity_time(&self) -> Option<DateTime<Utc>> {
        self.agents
            .read()
            .unwrap()
            .iter()
            .map(|a| a.last_activity())
            .max()
    }

    // Commands

    /// Spawn a new agent session. The provider is selected by the
    /// config's type, falling back to the first registered provider.
    pub async fn spawn(&self, config: crate::agent::SpawnConfig) -> Result<Agent, ProviderError> {
        let provider = self
            .registry
            .get(&config.kind)
            .or_else(|| self.registry.first())
            .ok_or_else(|| ProviderError::Unavailable("no providers registered".to_string()))?;

        let agent = provider.spawn(config).await?;

        self.agents.write().unwrap().insert(agent.clone());
        self.persist(&agent).await;

        Ok(agent)
    }

    /// Send input to an agent. Unknown ids are a soft no-op.
    pub async fn send_input(&self, id: &str, input: &str) -> Result<(), ProviderError> {
        let Some(agent) = self.get(id) else {
            return Ok(());
        };

        match self.registry.get(agent.kind()) {
            Some(provider) => provider.send_input(id, input).await,
            None => {
                warn!("No provider registered for kind {}", agent.kind());
                Ok(())
            }
        }
    }

    /// Terminate an agent. Unknown ids are a soft no-op. Termination
    /// does not cascade to children.
    pub async fn terminate(&self, id: &str) -> Result<(), ProviderError> {
        let Some(agent) = self.get(id) else {
            return Ok(());
        };

        match self.registry.get(agent.kind()) {
            Some(provider) => provider.terminate(id).await?,
            None => agent.mark_cancelled(),
        }

        self.persist(&agent).await;
        Ok(())
    }

    /// Force a full rediscovery. Returned agents overwrite the map;
    /// agents no longer observable are evicted.
    pub async fn refresh(&self) -> Result<()> {
        let discovered = self.registry.discover_all().await;

        let mut agents = self.agents.write().unwrap();
        let mut seen = HashSet::new();
        for agent in discovered {
            seen.insert(agent.id().to_string());
            agents.insert(agent);
        }
        agents.retain(&seen);

        Ok(())
    }
}
