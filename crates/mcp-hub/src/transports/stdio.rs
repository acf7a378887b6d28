use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ProcessConfig;
use crate::error::{McpError, Result, SpawnErrorKind};
use crate::protocol::client::McpTransport;
use crate::transports::process::{ChildProcess, ProcessHandle};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Newline-delimited JSON-RPC over a child's stdin/stdout.
pub struct StdioTransport {
    server: String,
    config: ProcessConfig,
    process: Option<Arc<ChildProcess>>,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    lines: Option<Mutex<mpsc::Receiver<String>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(server: impl Into<String>, config: ProcessConfig) -> Self {
        Self {
            server: server.into(),
            config,
            process: None,
            stdin: None,
            lines: None,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> Result<()> {
        info!(
            "Starting MCP server process '{}': {} {:?}",
            self.server, self.config.command, self.config.args
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        if !self.config.env.is_empty() {
            cmd.envs(&self.config.env);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn MCP server process '{}': {}", self.server, e);
            McpError::SpawnFailed {
                server: self.server.clone(),
                kind: SpawnErrorKind::from_io(e.kind()),
                message: e.to_string(),
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdout".to_string()))?;

        // Lines are pumped by a task so a receive timeout never loses half a line.
        let (line_tx, line_rx) = mpsc::channel(100);
        let server = self.server.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if line_tx.send(line.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("MCP server '{}' stdout closed (EOF)", server);
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to read from MCP server '{}': {}", server, e);
                        break;
                    }
                }
            }
        }));

        if let Some(stderr) = child.stderr.take() {
            let server = self.server.clone();
            self.tasks.push(tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "[MCP server stderr] {}", line);
                }
            }));
        }

        let process = Arc::new(ChildProcess::new(child));
        info!(
            "MCP server process '{}' started (pid {:?})",
            self.server,
            process.pid()
        );

        self.process = Some(process);
        self.stdin = Some(Arc::new(Mutex::new(stdin)));
        self.lines = Some(Mutex::new(line_rx));

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        info!("Disconnecting MCP server process '{}'", self.server);

        // Closing stdin is the polite way to ask a stdio server to exit.
        self.stdin = None;
        self.lines = None;

        if let Some(process) = self.process.take() {
            process.shutdown(SHUTDOWN_GRACE).await;
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }

        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        let stdin = self.stdin.as_ref().ok_or(McpError::Disconnected)?;

        let mut stdin = stdin.lock().await;
        let message_with_newline = format!("{}\n", message);
        stdin
            .write_all(message_with_newline.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("Failed to write: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("Failed to flush: {}", e)))?;

        debug!("Sent: {}", message);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        let lines = self.lines.as_ref().ok_or(McpError::Disconnected)?;
        let mut rx = lines.lock().await;

        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(line)) => {
                debug!("Received: {}", line);
                Ok(Some(line))
            }
            Ok(None) => Err(McpError::Disconnected),
            Err(_) => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        // Exit is noticed through EOF on stdout, not here.
        self.process.is_some()
    }

    fn process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.process
            .clone()
            .map(|process| process as Arc<dyn ProcessHandle>)
    }
}
