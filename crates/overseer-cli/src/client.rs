//! Line-protocol client for the one-shot subcommands.
//!
//! `overseer delegate` and friends spawn the daemon (`overseer serve`)
//! as a child and speak the same line-framed JSON-RPC the daemon serves
//! to any client.  Closing the child's stdin triggers the daemon's
//! clean shutdown.

use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// A connected daemon child process.
pub struct DaemonClient {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl DaemonClient {
    /// Spawn `overseer serve` and run the initialize handshake.
    pub async fn spawn() -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate the overseer binary")?;
        let mut child = Command::new(exe)
            .arg("serve")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn the overseer daemon")?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("daemon stdin missing"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("daemon stdout missing"))?;

        let mut client = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        };
        client
            .request("initialize", json!({ "clientInfo": { "name": "overseer-cli" } }))
            .await
            .context("initialize handshake failed")?;
        Ok(client)
    }

    /// Call one tool and return its result value.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        self.request(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    /// Send one request frame and await its matching response.
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let frame = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        debug!(method, id, "sending request");
        self.stdin.write_all(frame.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        loop {
            let line = self
                .stdout
                .next_line()
                .await?
                .ok_or_else(|| anyhow!("daemon closed stdout mid-request"))?;
            let response: Value = serde_json::from_str(&line)
                .with_context(|| format!("bad frame from daemon: {line}"))?;

            if response.get("id").and_then(Value::as_u64) != Some(id) {
                debug!("skipping frame with foreign id");
                continue;
            }
            if let Some(error) = response.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                let kind = error
                    .pointer("/data/kind")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if kind.is_empty() {
                    bail!("{message}");
                }
                bail!("{kind}: {message}");
            }
            return response
                .get("result")
                .cloned()
                .ok_or_else(|| anyhow!("response without result or error"));
        }
    }

    /// Close stdin so the daemon shuts down, then wait for it.
    pub async fn shutdown(mut self) -> Result<()> {
        drop(self.stdin);
        let status = self.child.wait().await?;
        debug!(code = ?status.code(), "daemon exited");
        Ok(())
    }
}
