//! Agent provider trait

pub mod opencode;
pub mod registry;

pub use registry::Registry;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, Event, SpawnConfig};

/// Errors surfaced by provider control operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("input must not be empty")]
    InvalidInput,

    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    #[error("failed to send input: {0}")]
    InputFailed(String),

    #[error("failed to terminate session: {0}")]
    TerminateFailed(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Adapter for one agent runtime: discovers sessions, watches for
/// changes, and issues control on behalf of the manager.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Type tag; registry key and the `kind` of every agent produced
    fn kind(&self) -> &str;

    /// List agents currently observable. May be expensive; called at
    /// startup and on explicit refresh. Identity is preserved across
    /// calls: an id seen before yields the same agent handle.
    async fn discover(&self) -> Result<Vec<Agent>>;

    /// Lazy infinite event stream. Emits `Discovered` for every newly
    /// observed agent and lifecycle events on transitions; may emit
    /// redundant `Updated`s. The channel closes when the scope is
    /// cancelled. Transient read errors are swallowed and retried on
    /// the next tick.
    async fn watch(&self, scope: CancellationToken) -> Result<mpsc::Receiver<Event>>;

    /// Create a new session via the runtime and return the resulting
    /// agent once observable.
    async fn spawn(&self, config: SpawnConfig) -> Result<Agent, ProviderError>;

    /// Synchronous lookup on the provider index
    fn get(&self, id: &str) -> Option<Agent>;

    /// Synchronous listing of the provider index
    fn list(&self) -> Vec<Agent>;

    /// Ask the runtime to stop the session. Runtimes without remote
    /// termination latch the local agent cancelled instead.
    async fn terminate(&self, id: &str) -> Result<(), ProviderError>;

    /// Forward user text to the runtime
    async fn send_input(&self, id: &str, input: &str) -> Result<(), ProviderError>;
}
