//! Session repository

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::agent::{AgentSnapshot, Status};
use crate::store::Database;

/// A stored session projection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub agent_id: String,
    pub agent_type: String,
    pub agent_name: String,
    pub directory: String,
    pub project_id: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub estimated_cost: f64,
    pub tool_calls: i64,
    pub error_count: i64,
    pub output: Option<String>,
    pub metadata: Option<String>,
}

impl SessionRecord {
    /// Project an agent snapshot into its stored form. Terminal
    /// statuses set end_time so cleanup can age the row out.
    pub fn from_snapshot(snapshot: &AgentSnapshot) -> Self {
        let end_time = match snapshot.status {
            Status::Completed | Status::Errored | Status::Cancelled => {
                Some(snapshot.last_activity)
            }
            _ => None,
        };

        Self {
            id: snapshot.id.clone(),
            agent_id: snapshot.id.clone(),
            agent_type: snapshot.kind.clone(),
            agent_name: snapshot.name.clone(),
            directory: snapshot.directory.clone(),
            project_id: snapshot.project_id.clone(),
            status: snapshot.status.as_str().to_string(),
            start_time: snapshot.start_time,
            end_time,
            last_activity: Some(snapshot.last_activity),
            tokens_in: snapshot.metrics.tokens_in as i64,
            tokens_out: snapshot.metrics.tokens_out as i64,
            estimated_cost: snapshot.metrics.estimated_cost,
            tool_calls: snapshot.metrics.tool_calls as i64,
            error_count: snapshot.metrics.error_count as i64,
            output: None,
            metadata: None,
        }
    }
}

pub struct SessionRepository {
    db: Database,
}

impl SessionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Save or update a session. start_time is immutable after the
    /// first insert; mutable fields are replaced and updated_at bumped.
    pub async fn save(&self, rec: &SessionRecord) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO sessions (
                id, agent_id, agent_type, agent_name, directory, project_id,
                status, start_time, end_time, last_activity,
                tokens_in, tokens_out, estimated_cost, tool_calls, error_count,
                output, metadata, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                agent_name = excluded.agent_name,
                directory = excluded.directory,
                project_id = excluded.project_id,
                status = excluded.status,
                end_time = excluded.end_time,
                last_activity = excluded.last_activity,
                tokens_in = excluded.tokens_in,
                tokens_out = excluded.tokens_out,
                estimated_cost = excluded.estimated_cost,
                tool_calls = excluded.tool_calls,
                error_count = excluded.error_count,
                output = excluded.output,
                metadata = excluded.metadata,
                updated_at = CURRENT_TIMESTAMP",
            params![
                rec.id,
                rec.agent_id,
                rec.agent_type,
                rec.agent_name,
                rec.directory,
                rec.project_id,
                rec.status,
                rec.start_time,
                rec.end_time,
                rec.last_activity,
                rec.tokens_in,
                rec.tokens_out,
                rec.estimated_cost,
                rec.tool_calls,
                rec.error_count,
                rec.output,
                rec.metadata,
            ],
        )
        .context("Failed to save session")?;
        Ok(())
    }

    /// Get a session by id
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, agent_type, agent_name, directory, project_id,
                status, start_time, end_time, last_activity,
                tokens_in, tokens_out, estimated_cost, tool_calls, error_count,
                output, metadata
             FROM sessions WHERE id = ?1",
        )?;

        let mut rows = stmt.query_map(params![id], row_to_record)?;
        match rows.next() {
            Some(rec) => Ok(Some(rec?)),
            None => Ok(None),
        }
    }

    /// List sessions, newest first, optionally filtered by status
    pub async fn list(&self, limit: u32, status: Option<&str>) -> Result<Vec<SessionRecord>> {
        let conn = self.db.lock().await;

        let mut query = String::from(
            "SELECT id, agent_id, agent_type, agent_name, directory, project_id,
                status, start_time, end_time, last_activity,
                tokens_in, tokens_out, estimated_cost, tool_calls, error_count,
                output, metadata
             FROM sessions",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = status {
            query.push_str(" WHERE status = ?1");
            args.push(Box::new(status.to_string()));
        }

        query.push_str(" ORDER BY start_time DESC");

        if limit > 0 {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_record,
        )?;

        let mut records = Vec::new();
        for rec in rows {
            records.push(rec?);
        }
        Ok(records)
    }

    /// Append an output chunk for a session
    pub async fn append_output(&self, session_id: &str, chunk: &str) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO output_chunks (session_id, chunk, timestamp)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)",
            params![session_id, chunk],
        )
        .context("Failed to append output chunk")?;
        Ok(())
    }

    /// Concatenated output for a session, in insertion order
    pub async fn get_output(&self, session_id: &str) -> Result<String> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT chunk FROM output_chunks WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;

        let mut output = String::new();
        for chunk in rows {
            output.push_str(&chunk?);
        }
        Ok(output)
    }

    /// Delete ended sessions older than the cutoff, with their output
    /// chunks. Active sessions (null end_time) are never deleted.
    pub async fn delete_ended_before(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "DELETE FROM output_chunks WHERE session_id IN (
                SELECT id FROM sessions WHERE end_time < ?1 AND end_time IS NOT NULL
            )",
            params![cutoff],
        )?;
        conn.execute(
            "DELETE FROM sessions WHERE end_time < ?1 AND end_time IS NOT NULL",
            params![cutoff],
        )?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        agent_type: row.get(2)?,
        agent_name: row.get(3)?,
        directory: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        project_id: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        status: row.get(6)?,
        start_time: row.get(7)?,
        end_time: row.get(8)?,
        last_activity: row.get(9)?,
        tokens_in: row.get(10)?,
        tokens_out: row.get(11)?,
        estimated_cost: row.get(12)?,
        tool_calls: row.get(13)?,
        error_count: row.get(14)?,
        output: row.get(15)?,
        metadata: row.get(16)?,
    })
}
