//! Alert repository

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::store::Database;

/// A stored alert
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub agent_id: Option<String>,
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub metadata: Option<String>,
}

pub struct AlertRepository {
    db: Database,
}

impl AlertRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Save an alert (insert-only)
    pub async fn save(&self, rec: &AlertRecord) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO alerts (id, agent_id, level, message, timestamp, read, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rec.id,
                rec.agent_id,
                rec.level,
                rec.message,
                rec.timestamp,
                rec.read,
                rec.metadata,
            ],
        )
        .context("Failed to save alert")?;
        Ok(())
    }

    /// List alerts, newest first
    pub async fn list(&self, limit: u32, unread_only: bool) -> Result<Vec<AlertRecord>> {
        let conn = self.db.lock().await;

        let mut query =
            String::from("SELECT id, agent_id, level, message, timestamp, read, metadata FROM alerts");
        if unread_only {
            query.push_str(" WHERE read = FALSE");
        }
        query.push_str(" ORDER BY timestamp DESC");
        if limit > 0 {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            Ok(AlertRecord {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                level: row.get(2)?,
                message: row.get(3)?,
                timestamp: row.get(4)?,
                read: row.get(5)?,
                metadata: row.get(6)?,
            })
        })?;

        let mut records = Vec::new();
        for rec in rows {
            records.push(rec?);
        }
        Ok(records)
    }

    /// Mark one alert as read
    pub async fn mark_read(&self, id: &str) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute("UPDATE alerts SET read = TRUE WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Mark every alert as read
    pub async fn mark_all_read(&self) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute("UPDATE alerts SET read = TRUE", [])?;
        Ok(())
    }

    /// Number of unread alerts
    pub async fn unread_count(&self) -> Result<u32> {
        let conn = self.db.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE read = FALSE",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete alerts older than the cutoff
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM alerts WHERE timestamp < ?1", params![cutoff])?;
        Ok(())
    }
}
