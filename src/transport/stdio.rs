//! Stdio transport: the local endpoint
//!
//! The proxy is spawned by a stdio MCP client; the client writes JSON-RPC
//! messages to our stdin (one JSON object per line) and reads responses
//! from our stdout. This transport wraps the process's OWN standard
//! streams, which is why everything else the proxy prints must go to
//! stderr.
//!
//! End-of-stdin means the client has gone away: the receive stream ends
//! and the router shuts the remote side down.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::{McpRemoteError, Result};
use crate::transport::{channel_stream, Transport};

/// Transport over this process's stdin/stdout, newline-delimited JSON.
#[derive(Debug)]
pub struct StdioTransport {
    /// Sender feeding the stdout writer task; `None` after close.
    out_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Shared receiver of stdin lines.
    in_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Reader/writer task handles, aborted on close.
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Wires up stdin and stdout and starts the pump tasks.
    ///
    /// Two background tasks are spawned: a writer draining the outbound
    /// channel onto stdout (flushing after every message so the client
    /// never waits on a buffer), and a reader pushing stdin lines into the
    /// inbound channel. When stdin reaches end-of-file the inbound channel
    /// closes and [`Transport::receive`] ends.
    pub fn new() -> Self {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(message) = out_rx.recv().await {
                let line = format!("{message}\n");
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.flush().await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if in_tx.send(line).is_err() {
                    break;
                }
            }
            // in_tx drops here; the receive stream ends.
        });

        Self {
            out_tx: Mutex::new(Some(out_tx)),
            in_rx: Arc::new(tokio::sync::Mutex::new(in_rx)),
            tasks: Mutex::new(vec![writer, reader]),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    /// Enqueue a message for the stdout writer task.
    async fn send(&self, message: String) -> Result<()> {
        let guard = self.out_tx.lock().expect("out_tx mutex");
        match guard.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| McpRemoteError::Transport("stdout writer has exited".into()).into()),
            None => Err(McpRemoteError::Transport("stdio transport is closed".into()).into()),
        }
    }

    /// Stream of stdin lines; ends at end-of-stdin or after `close`.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        channel_stream(Arc::clone(&self.in_rx))
    }

    /// Stdio has no diagnostic side channel; the stream never yields.
    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        Box::pin(futures::stream::pending())
    }

    /// Stops both pump tasks and drops the outbound channel.
    async fn close(&self) {
        self.out_tx.lock().expect("out_tx mutex").take();
        for task in self.tasks.lock().expect("tasks mutex").drain(..) {
            task.abort();
        }
    }
}
