//! Durable projection of sessions, alerts, metrics, and output chunks
//!
//! The store is a follower of live state: the manager projects agents
//! into it after each event, and nothing in the live view reads it
//! back. If the process dies between a live-map mutation and the
//! matching save, the store trails by one event and catches up on the
//! next save for the same agent.

pub mod connection;
pub mod repositories;
pub mod schema;

pub use connection::Database;
pub use repositories::{
    AlertRecord, AlertRepository, MetricRecord, MetricRepository, SessionRecord,
    SessionRepository,
};

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;

/// Facade over the database and its repositories
#[derive(Clone)]
pub struct Store {
    db: Database,
}

/// Aggregate statistics over the stored projection
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_sessions: u32,
    pub sessions_by_status: HashMap<String, u32>,
    pub total_tokens_in: i64,
    pub total_tokens_out: i64,
    pub total_cost: f64,
    pub total_errors: i64,
    pub unread_alerts: u32,
}

impl Store {
    /// Open (or create) the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: Database::new(path)?,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn sessions(&self) -> SessionRepository {
        SessionRepository::new(self.db.clone())
    }

    pub fn alerts(&self) -> AlertRepository {
        AlertRepository::new(self.db.clone())
    }

    pub fn metrics(&self) -> MetricRepository {
        MetricRepository::new(self.db.clone())
    }

    /// Delete ended sessions (with their output chunks), alerts, and
    /// metrics older than the cutoff. Active sessions are untouched.
    pub async fn cleanup(&self, max_age_days: u32) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        self.sessions().delete_ended_before(cutoff).await?;
        self.alerts().delete_before(cutoff).await?;
        self.metrics().delete_before(cutoff).await?;
        Ok(())
    }

    /// Aggregate statistics over the stored projection
    pub async fn stats(&self) -> Result<StoreStats> {
        let conn = self.db.lock().await;
        let mut stats = StoreStats::default();

        stats.total_sessions =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;

        {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM sessions GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                stats.sessions_by_status.insert(status, count);
            }
        }

        let (tokens_in, tokens_out): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(tokens_in), 0), COALESCE(SUM(tokens_out), 0) FROM sessions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.total_tokens_in = tokens_in;
        stats.total_tokens_out = tokens_out;

        stats.total_cost = conn.query_row(
            "SELECT COALESCE(SUM(estimated_cost), 0) FROM sessions",
            [],
            |row| row.get(0),
        )?;

        stats.total_errors = conn.query_row(
            "SELECT COALESCE(SUM(error_count), 0) FROM sessions",
            [],
            |row| row.get(0),
        )?;

        stats.unread_alerts = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE read = FALSE",
            [],
            |row| row.get(0),
        )?;

        Ok(stats)
    }

    /// Export sessions, alerts, and statistics as pretty-printed JSON
    pub async fn export_json(&self) -> Result<String> {
        let sessions = self.sessions().list(0, None).await?;
        let alerts = self.alerts().list(0, false).await?;
        let stats = self.stats().await?;

        let data = serde_json::json!({
            "sessions": sessions,
            "alerts": alerts,
            "statistics": stats,
            "exported": Utc::now(),
        });

        Ok(serde_json::to_string_pretty(&data)?)
    }
}
