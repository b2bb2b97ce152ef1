//! mcp-remote-client - standalone client driver
//!
//! Connects to the remote with the same authorization and transport
//! machinery as the proxy, but instead of bridging stdio it acts as the
//! MCP client itself: initialize, list the remote's tools to stderr, then
//! stream server messages until interrupted. Useful for verifying a
//! server's OAuth setup without wiring up a real client.

use std::time::Duration;

use futures::StreamExt as _;
use serde_json::Value;

use mcp_remote::cli::Cli;
use mcp_remote::config::Settings;
use mcp_remote::driver::{establish, init_tracing};
use mcp_remote::error::{McpRemoteError, Result};
use mcp_remote::transport::Transport;

/// How long to wait for each of the two startup responses.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);

    let settings = match Settings::from_cli(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e:#}");
            eprintln!("Usage: mcp-remote-client <server-url> [callback-port] [options]");
            std::process::exit(1);
        }
    };

    match run(settings).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let mut connection = establish(&settings).await?;
    let remote = connection.remote.clone();

    let initialize = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "mcp-remote-client", "version": mcp_remote::VERSION},
        },
    });
    remote.send(initialize.to_string()).await?;
    let init_result = wait_for_response(&remote, 0).await?;
    let server_name = init_result
        .pointer("/result/serverInfo/name")
        .and_then(Value::as_str)
        .unwrap_or("(unnamed)");
    eprintln!("Connected to {server_name}");

    remote
        .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string())
        .await?;

    remote
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#.to_string())
        .await?;
    let tools_result = wait_for_response(&remote, 1).await?;
    let names: Vec<&str> = tools_result
        .pointer("/result/tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    eprintln!("Tools ({}): {}", names.len(), names.join(", "));

    // Stay connected and surface server-initiated traffic until Ctrl-C.
    let mut rx = remote.receive();
    loop {
        tokio::select! {
            message = rx.next() => match message {
                Some(raw) => eprintln!("<- {raw}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt; shutting down");
                break;
            }
        }
    }

    connection.cleanup().await;
    Ok(())
}

/// Drains the receive stream until the response with the given id shows
/// up, surfacing other traffic to stderr along the way.
async fn wait_for_response(
    remote: &std::sync::Arc<dyn mcp_remote::transport::Transport>,
    id: i64,
) -> Result<Value> {
    let mut rx = remote.receive();
    let deadline = tokio::time::Instant::now() + REQUEST_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let next = tokio::time::timeout(remaining, rx.next()).await.map_err(|_| {
            McpRemoteError::Transport(format!("timed out waiting for response {id}"))
        })?;
        let Some(raw) = next else {
            return Err(
                McpRemoteError::Transport("remote closed during startup".to_string()).into(),
            );
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(message) if message.get("id") == Some(&Value::from(id)) => return Ok(message),
            Ok(_) | Err(_) => eprintln!("<- {raw}"),
        }
    }
}
