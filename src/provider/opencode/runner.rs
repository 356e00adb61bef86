//! Streaming runner for `opencode run --format json`
//!
//! The runtime streams newline-delimited JSON events to stdout; stderr
//! lines are surfaced as synthesized `stderr` events and unparsable
//! stdout lines as `raw` events.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

/// Maximum stdout line length; longer lines are truncated
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A single streamed event from the runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamEvent {
    /// "text", "tool-start", "tool-end", "done", "error", plus the
    /// synthesized "stderr" and "raw"
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "partID", default)]
    pub part_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "toolName", default)]
    pub tool_name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub error: String,
}

/// Arguments for one `opencode run` invocation
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub session_id: String,
    pub directory: String,
    pub message: String,
    pub model: String,
    pub agent: String,
    pub title: String,
}

/// A running `opencode run` process with its event stream
pub struct Runner {
    child: Child,
    events: Option<mpsc::Receiver<StreamEvent>>,
    session_id: Arc<Mutex<String>>,
}

impl Runner {
    /// Spawn the process and start streaming its output
    pub fn spawn(binary: &Path, cfg: RunConfig) -> Result<Self> {
        let mut args: Vec<String> = vec!["run".into(), "--format".into(), "json".into()];

        if !cfg.session_id.is_empty() {
            args.push("-s".into());
            args.push(cfg.session_id.clone());
        }
        if !cfg.model.is_empty() {
            args.push("-m".into());
            args.push(cfg.model.clone());
        }
        if !cfg.agent.is_empty() {
            args.push("--agent".into());
            args.push(cfg.agent.clone());
        }
        if !cfg.title.is_empty() {
            args.push("--title".into());
            args.push(cfg.title.clone());
        }
        if !cfg.message.is_empty() {
            args.push(cfg.message.clone());
        }

        let mut cmd = Command::new(binary);
        cmd.args(&args);
        if !cfg.directory.is_empty() {
            cmd.current_dir(&cfg.directory);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("Failed to start opencode")?;

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;

        let (tx, rx) = mpsc::channel(100);
        let session_id = Arc::new(Mutex::new(cfg.session_id));

        let out_tx = tx.clone();
        let out_session = Arc::clone(&session_id);
        tokio::spawn(async move {
            let mut reader = BufReader::with_capacity(64 * 1024, stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("stdout read error: {}", e);
                        break;
                    }
                }
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                line.truncate(MAX_LINE_BYTES);

                let event = match serde_json::from_slice::<StreamEvent>(&line) {
                    Ok(event) => event,
                    Err(_) => StreamEvent {
                        kind: "raw".into(),
                        text: String::from_utf8_lossy(&line).to_string(),
                        ..StreamEvent::default()
                    },
                };

                if !event.session_id.is_empty() {
                    let mut id = out_session.lock().unwrap();
                    if id.is_empty() {
                        *id = event.session_id.clone();
                    }
                }

                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                let event = StreamEvent {
                    kind: "stderr".into(),
                    text: line,
                    ..StreamEvent::default()
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            child,
            events: Some(rx),
            session_id,
        })
    }

    /// Take the event receiver; the channel closes when both pipes
    /// reach EOF
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events.take()
    }

    /// Session id, once observed on the stream (or as configured)
    pub fn session_id(&self) -> String {
        self.session_id.lock().unwrap().clone()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the process
    pub fn stop(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.context("opencode run failed")
    }
}
