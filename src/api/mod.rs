//! HTTP inspection API
//!
//! A small JSON API for out-of-band inspection of the live map. Serves
//! one request per connection over a plain TcpListener; every response
//! carries the `{success, data?, error?}` envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::session::Manager;

/// Standard API response envelope
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<serde_json::Value> {
    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// An agent as rendered by the API
#[derive(Serialize)]
struct AgentView {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    status: String,
    directory: String,
    project_id: String,
    current_task: String,
    start_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    tokens_in: u64,
    tokens_out: u64,
}

impl AgentView {
    fn from_agent(agent: &Agent) -> Self {
        let snapshot = agent.snapshot();
        Self {
            id: snapshot.id,
            name: snapshot.name,
            kind: snapshot.kind,
            status: snapshot.status.as_str().to_string(),
            directory: snapshot.directory,
            project_id: snapshot.project_id,
            current_task: snapshot.current_task,
            start_time: snapshot.start_time,
            last_activity: snapshot.last_activity,
            tokens_in: snapshot.metrics.tokens_in,
            tokens_out: snapshot.metrics.tokens_out,
        }
    }
}

/// The HTTP inspection server
pub struct Server {
    listener: TcpListener,
    manager: Arc<Manager>,
}

impl Server {
    /// Bind the listen address. Use port 0 to pick an ephemeral port.
    pub async fn bind(addr: &str, manager: Arc<Manager>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind API server to {addr}"))?;
        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("No local address")
    }

    /// Accept connections until the scope is cancelled
    pub async fn run(self, scope: CancellationToken) -> Result<()> {
        tracing::info!("API server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!("Accepted connection from {}", addr);

                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, manager).await {
                            warn!("Error handling API connection: {}", e);
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(mut stream: TcpStream, manager: Arc<Manager>) -> Result<()> {
    let mut buffer = vec![0u8; 8192];
    let n = stream.read(&mut buffer).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    let (method, path) = match parse_request_line(&request) {
        Some(parsed) => parsed,
        None => {
            let body = serde_json::to_string(&ApiResponse::err("malformed request"))?;
            return write_response(&mut stream, 400, &body).await;
        }
    };

    let (status, body) = route(&method, &path, &manager).await;
    write_response(&mut stream, status, &body).await
}

/// Extract method and path from the request line
fn parse_request_line(request: &str) -> Option<(String, String)> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

async fn route(method: &str, path: &str, manager: &Arc<Manager>) -> (u16, String) {
    match path {
        "/api/health" => {
            if method != "GET" {
                return method_not_allowed();
            }
            json_ok(serde_json::json!({ "status": "healthy" }))
        }

        "/api/agents" => {
            if method != "GET" {
                return method_not_allowed();
            }
            let views: Vec<AgentView> = manager
                .list()
                .iter()
                .map(AgentView::from_agent)
                .collect();
            json_ok(views)
        }

        "/api/stats" => {
            if method != "GET" {
                return method_not_allowed();
            }
            let stats = manager.stats();
            let by_status: std::collections::HashMap<&str, usize> = stats
                .by_status
                .iter()
                .map(|(status, count)| (status.as_str(), *count))
                .collect();
            json_ok(serde_json::json!({
                "total": stats.total,
                "by_status": by_status,
                "by_type": stats.by_kind,
                "by_project": stats.by_project,
                "total_tokens_in": stats.total_tokens_in,
                "total_errors": stats.total_errors,
            }))
        }

        _ => {
            // /api/agents/{id} and /api/agents/{id}/terminate
            let Some(rest) = path.strip_prefix("/api/agents/") else {
                return not_found("not found");
            };
            if rest.is_empty() {
                return error_response(400, "agent ID required");
            }

            if let Some(id) = rest.strip_suffix("/terminate") {
                if method != "POST" {
                    return method_not_allowed();
                }
                return match manager.terminate(id).await {
                    Ok(()) => json_ok(serde_json::json!({ "status": "terminated" })),
                    Err(e) => error_response(500, &format!("failed to terminate: {e}")),
                };
            }

            if method != "GET" {
                return method_not_allowed();
            }
            match manager.get(rest) {
                Some(agent) => json_ok(AgentView::from_agent(&agent)),
                None => not_found("agent not found"),
            }
        }
    }
}

fn json_ok<T: Serialize>(data: T) -> (u16, String) {
    let body = serde_json::to_string(&ApiResponse::ok(data))
        .unwrap_or_else(|e| format!(r#"{{"success":false,"error":"{e}"}}"#));
    (200, body)
}

fn error_response(status: u16, message: &str) -> (u16, String) {
    let body = serde_json::to_string(&ApiResponse::err(message))
        .unwrap_or_else(|e| format!(r#"{{"success":false,"error":"{e}"}}"#));
    (status, body)
}

fn not_found(message: &str) -> (u16, String) {
    error_response(404, message)
}

fn method_not_allowed() -> (u16, String) {
    error_response(405, "method not allowed")
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(())
}
