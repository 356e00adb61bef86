//! Provider registry and event fan-in

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{Agent, Event};

use super::Provider;

/// Capacity of the merged event channel. Providers block when it is
/// full; events are never dropped.
pub const EVENT_BUFFER: usize = 100;

/// Keyed collection of providers with a single merged event stream.
///
/// Registration order is preserved so `spawn` can fall back to the
/// first registered provider. One active provider per kind: a later
/// registration for the same kind replaces the earlier one.
pub struct Registry {
    providers: RwLock<Vec<Arc<dyn Provider>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Add a provider, replacing any existing provider of the same kind
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let mut providers = self.providers.write().unwrap();
        if let Some(existing) = providers
            .iter_mut()
            .find(|p| p.kind() == provider.kind())
        {
            warn!(
                "Replacing already registered provider for kind {}",
                provider.kind()
            );
            *existing = provider;
        } else {
            providers.push(provider);
        }
    }

    /// Get a provider by kind
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .unwrap()
            .iter()
            .find(|p| p.kind() == kind)
            .cloned()
    }

    /// All registered providers, in registration order
    pub fn list(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.read().unwrap().clone()
    }

    /// The first registered provider, if any
    pub fn first(&self) -> Option<Arc<dyn Provider>> {
        self.providers.read().unwrap().first().cloned()
    }

    /// Discover agents from all providers. A failing provider is
    /// skipped and logged; it never fails the whole pass.
    pub async fn discover_all(&self) -> Vec<Agent> {
        let mut all = Vec::new();
        for provider in self.list() {
            match provider.discover().await {
                Ok(agents) => {
                    debug!(
                        "Provider {} discovered {} agents",
                        provider.kind(),
                        agents.len()
                    );
                    all.extend(agents);
                }
                Err(e) => {
                    warn!("Provider {} discovery failed: {}", provider.kind(), e);
                }
            }
        }
        all
    }

    /// Merge every provider's watch stream into one bounded channel.
    ///
    /// Per-provider per-agent order is preserved; interleaving across
    /// providers is arbitrary. When the scope is cancelled, every
    /// upstream closes and the merged receiver yields `None` exactly
    /// once after the remaining events drain.
    pub async fn watch_all(&self, scope: CancellationToken) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        for provider in self.list() {
            match provider.watch(scope.clone()).await {
                Ok(mut events) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("Provider {} watch failed: {}", provider.kind(), e);
                }
            }
        }

        rx
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{EventKind, SpawnConfig};
    use crate::provider::ProviderError;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubProvider {
        kind: String,
        agents: Vec<Agent>,
    }

    impl StubProvider {
        fn new(kind: &str, ids: &[&str]) -> Self {
            Self {
                kind: kind.to_string(),
                agents: ids
                    .iter()
                    .map(|id| Agent::new(*id, kind, Utc::now()))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.kind
        }

        fn kind(&self) -> &str {
            &self.kind
        }

        async fn discover(&self) -> Result<Vec<Agent>> {
            Ok(self.agents.clone())
        }

        async fn watch(&self, scope: CancellationToken) -> Result<mpsc::Receiver<Event>> {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            let agents = self.agents.clone();
            tokio::spawn(async move {
                for agent in &agents {
                    if tx.send(Event::new(EventKind::Discovered, agent)).await.is_err() {
                        return;
                    }
                }
                scope.cancelled().await;
            });
            Ok(rx)
        }

        async fn spawn(&self, _config: SpawnConfig) -> Result<Agent, ProviderError> {
            Err(ProviderError::SpawnFailed("stub".into()))
        }

        fn get(&self, id: &str) -> Option<Agent> {
            self.agents.iter().find(|a| a.id() == id).cloned()
        }

        fn list(&self) -> Vec<Agent> {
            self.agents.clone()
        }

        async fn terminate(&self, _id: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn send_input(&self, _id: &str, _input: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = Registry::new();
        registry.register(Arc::new(StubProvider::new("alpha", &["a1"])));
        registry.register(Arc::new(StubProvider::new("beta", &["b1"])));

        assert!(registry.get("alpha").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.first().unwrap().kind(), "alpha");
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn same_kind_replaces() {
        let registry = Registry::new();
        registry.register(Arc::new(StubProvider::new("alpha", &["a1"])));
        registry.register(Arc::new(StubProvider::new("alpha", &["a2"])));

        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("alpha").unwrap().get("a2").is_some());
    }

    #[tokio::test]
    async fn discover_all_concatenates() {
        let registry = Registry::new();
        registry.register(Arc::new(StubProvider::new("alpha", &["a1", "a2"])));
        registry.register(Arc::new(StubProvider::new("beta", &["b1"])));

        let agents = registry.discover_all().await;
        assert_eq!(agents.len(), 3);
    }

    #[tokio::test]
    async fn watch_all_merges_and_closes_on_cancel() {
        let registry = Registry::new();
        registry.register(Arc::new(StubProvider::new("alpha", &["a1"])));
        registry.register(Arc::new(StubProvider::new("beta", &["b1"])));

        let scope = CancellationToken::new();
        let mut events = registry.watch_all(scope.clone()).await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
                .await
                .expect("timed out")
                .expect("stream closed early");
            seen.push(event.agent_id);
        }
        seen.sort();
        assert_eq!(seen, vec!["a1", "b1"]);

        scope.cancel();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for close");
        assert!(closed.is_none());
    }
}
