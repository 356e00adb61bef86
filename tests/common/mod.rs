//! Shared test fixtures
#![allow(dead_code)]

use std::sync::{Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use auto::agent::{Agent, Event, SpawnConfig, Status};
use auto::provider::{Provider, ProviderError};

/// Provider driven entirely by the test: agents are added by hand and
/// events injected through `send_event`.
pub struct MockProvider {
    kind: String,
    agents: RwLock<Vec<Agent>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Event>>>,
    pub inputs: Mutex<Vec<(String, String)>>,
    pub terminated: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(kind: &str) -> Self {
        let (events_tx, events_rx) = mpsc::channel(100);
        Self {
            kind: kind.to_string(),
            agents: RwLock::new(Vec::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
            inputs: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }

    pub fn add_agent(&self, agent: Agent) {
        self.agents.write().unwrap().push(agent);
    }

    pub async fn send_event(&self, event: Event) {
        self.events_tx.send(event).await.expect("event channel closed");
    }

    /// Best-effort send for tests exercising cancellation, where the
    /// stream may already be closed
    pub fn try_send_event(&self, event: Event) {
        let _ = self.events_tx.try_send(event);
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.kind
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    async fn discover(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.read().unwrap().clone())
    }

    async fn watch(&self, scope: CancellationToken) -> Result<mpsc::Receiver<Event>> {
        let mut inner = match self.events_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                // Second watcher gets an immediately closed stream
                let (_, rx) = mpsc::channel(1);
                return Ok(rx);
            }
        };

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    event = inner.recv() => match event {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<Agent, ProviderError> {
        let agent = Agent::new(format!("{}-id", config.name), self.kind.clone(), Utc::now());
        agent.set_name(config.name.clone());
        agent.set_directory(config.directory.clone());
        agent.set_status(Status::Running);
        self.agents.write().unwrap().push(agent.clone());
        Ok(agent)
    }

    fn get(&self, id: &str) -> Option<Agent> {
        self.agents
            .read()
            .unwrap()
            .iter()
            .find(|a| a.id() == id)
            .cloned()
    }

    fn list(&self) -> Vec<Agent> {
        self.agents.read().unwrap().clone()
    }

    async fn terminate(&self, id: &str) -> Result<(), ProviderError> {
        let agent = self
            .get(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        agent.mark_cancelled();
        self.terminated.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn send_input(&self, id: &str, input: &str) -> Result<(), ProviderError> {
        if input.is_empty() {
            return Err(ProviderError::InvalidInput);
        }
        self.get(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        self.inputs
            .lock()
            .unwrap()
            .push((id.to_string(), input.to_string()));
        Ok(())
    }
}

/// Build an agent with the fields most tests care about
pub fn make_agent(id: &str, name: &str, status: Status) -> Agent {
    let agent = Agent::new(id, "mock", Utc::now());
    agent.set_name(name);
    agent.set_status(status);
    agent
}

/// Poll until the condition holds or the timeout elapses
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    condition()
}
