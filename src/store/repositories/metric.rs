//! Metric repository

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::store::Database;

/// A stored metric point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    pub agent_id: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct MetricRepository {
    db: Database,
}

impl MetricRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Save a metric point
    pub async fn save(&self, rec: &MetricRecord) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO metrics (id, agent_id, metric, value, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rec.id, rec.agent_id, rec.metric, rec.value, rec.timestamp],
        )
        .context("Failed to save metric")?;
        Ok(())
    }

    /// Metric points for an agent since a point in time, oldest first
    pub async fn get(
        &self,
        agent_id: &str,
        metric: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricRecord>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, metric, value, timestamp
             FROM metrics
             WHERE agent_id = ?1 AND metric = ?2 AND timestamp >= ?3
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![agent_id, metric, since], |row| {
            Ok(MetricRecord {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                metric: row.get(2)?,
                value: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?;

        let mut records = Vec::new();
        for rec in rows {
            records.push(rec?);
        }
        Ok(records)
    }

    /// Delete metric points older than the cutoff
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![cutoff])?;
        Ok(())
    }
}
