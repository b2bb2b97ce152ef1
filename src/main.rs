//! mcp-remote - proxy driver
//!
//! Bridges the stdio MCP client that spawned this process to the remote
//! OAuth-protected server: establish (coordinating and authorizing as
//! needed), then route messages until either side closes or SIGINT
//! arrives. Exit code 0 on clean shutdown, 1 on fatal error.

use std::sync::Arc;

use mcp_remote::cli::Cli;
use mcp_remote::config::Settings;
use mcp_remote::driver::{establish, init_tracing};
use mcp_remote::error::Result;
use mcp_remote::proxy::filter::ToolFilter;
use mcp_remote::proxy::router::ProxyRouter;
use mcp_remote::transport::stdio::StdioTransport;
use mcp_remote::transport::Transport;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);

    let settings = match Settings::from_cli(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e:#}");
            eprintln!(
                "Usage: mcp-remote <server-url> [callback-port] [--header \"Name: Value\"]... \
                 [--transport STRATEGY] [--ignore-tool PATTERN]... [--auth-timeout SECONDS] \
                 [--allow-http] [--debug]"
            );
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
    let filter = ToolFilter::new(&settings.ignore_tools)?;
    let mut connection = establish(&settings).await?;
    connection.debug_log.log("remote connected; starting router");

    let local: Arc<dyn Transport> = Arc::new(StdioTransport::new());
    let router = ProxyRouter::new(Arc::clone(&local), Arc::clone(&connection.remote), filter);

    tokio::select! {
        result = router.run() => {
            connection.debug_log.log("session ended; cleaning up");
            local.close().await;
            connection.cleanup().await;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt; shutting down");
            connection.debug_log.log("interrupt received; cleaning up");
            local.close().await;
            connection.cleanup().await;
            Ok(())
        }
    }
}
