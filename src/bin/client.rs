//! Standalone test client: runs the same authorization and connection path
//! as the proxy, then performs `initialize` and `tools/list` against the
//! remote and prints the result. Useful for exercising the OAuth flow
//! outside an MCP host.

use std::time::Duration;

use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, error};

use mcp_remote::{
    args::Cli,
    driver::{self, Session},
    jsonrpc::{JSONRPCMessage, JSONRPCNotification, JSONRPCRequest, RequestId},
    logging,
    transport::TransportStream,
    Error, Result,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("mcp-remote-client: {e}");
            1
        }
    });
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config()?;
    logging::init(config.debug, driver::debug_log_path(&config)?)?;

    let Session {
        mut remote,
        coordination,
    } = driver::establish(&config).await?;

    let outcome = exercise(&mut remote).await;
    let _ = remote.close().await;
    coordination.cleanup();
    outcome
}

async fn exercise(remote: &mut Box<dyn TransportStream>) -> Result<()> {
    let init = request(
        remote,
        1,
        "initialize",
        json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-remote-client",
                "version": env!("CARGO_PKG_VERSION"),
            }
        }),
    )
    .await?;
    println!(
        "Connected to {} {}",
        init["serverInfo"]["name"].as_str().unwrap_or("<unnamed>"),
        init["serverInfo"]["version"].as_str().unwrap_or("")
    );

    remote
        .send(JSONRPCMessage::Notification(JSONRPCNotification {
            jsonrpc: "2.0".into(),
            method: "notifications/initialized".into(),
            params: None,
        }))
        .await?;

    let tools = request(remote, 2, "tools/list", json!({})).await?;
    let empty = Vec::new();
    let tools = tools["tools"].as_array().unwrap_or(&empty);
    println!("{} tool(s) available:", tools.len());
    for tool in tools {
        println!(
            "  - {}: {}",
            tool["name"].as_str().unwrap_or("<unnamed>"),
            tool["description"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

async fn request(
    remote: &mut Box<dyn TransportStream>,
    id: i64,
    method: &str,
    params: Value,
) -> Result<Value> {
    let id = RequestId::Number(id);
    remote
        .send(JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: "2.0".into(),
            id: id.clone(),
            method: method.into(),
            params: Some(params),
        }))
        .await?;

    loop {
        let next = tokio::time::timeout(REQUEST_TIMEOUT, remote.next())
            .await
            .map_err(|_| Error::Transport(format!("timed out waiting for {method} response")))?;
        match next {
            Some(Ok(JSONRPCMessage::Response(response))) if response.id == id => {
                return Ok(response.result)
            }
            Some(Ok(JSONRPCMessage::Error(err))) if err.id == id => {
                return Err(Error::Transport(format!(
                    "{method} failed: {} (code {})",
                    err.error.message, err.error.code
                )))
            }
            Some(Ok(other)) => debug!("ignoring interleaved message: {other:?}"),
            Some(Err(e)) => return Err(e),
            None => return Err(Error::ConnectionClosed),
        }
    }
}
