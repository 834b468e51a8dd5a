use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use crate::{
    error::Result,
    filter::ToolFilter,
    jsonrpc::{error_response, JSONRPCMessage, JSONRPCRequest, RequestId, INTERNAL_ERROR},
    transport::TransportStream,
};

/// What to do with a message arriving from the local client.
#[derive(Debug)]
enum ClientAction {
    Forward(JSONRPCMessage),
    /// Policy rejection: answer the client directly, nothing reaches the
    /// remote.
    Reject(JSONRPCMessage),
}

/// Forward messages between the local stdio endpoint and the remote until
/// either side closes. The pending-request table lives entirely in this
/// task, so request/response correlation needs no locking.
pub async fn run(
    client: Box<dyn TransportStream>,
    server: Box<dyn TransportStream>,
    filter: ToolFilter,
) -> Result<()> {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut server_tx, mut server_rx) = server.split();

    let mut pending: HashMap<RequestId, JSONRPCRequest> = HashMap::new();
    let mut client_closed = false;
    let mut server_closed = false;

    while !client_closed && !server_closed {
        tokio::select! {
            incoming = client_rx.next() => match incoming {
                Some(Ok(message)) => match process_client_message(message, &filter, &mut pending) {
                    ClientAction::Forward(message) => {
                        if let Err(e) = server_tx.send(message).await {
                            error!("failed to forward message to remote: {e}");
                        }
                    }
                    ClientAction::Reject(reply) => {
                        if let Err(e) = client_tx.send(reply).await {
                            error!("failed to answer client: {e}");
                        }
                    }
                },
                Some(Err(e)) => error!("error reading from client: {e}"),
                None => client_closed = true,
            },
            incoming = server_rx.next() => match incoming {
                Some(Ok(message)) => {
                    let message = process_server_message(message, &filter, &mut pending);
                    if let Err(e) = client_tx.send(message).await {
                        error!("failed to forward message to client: {e}");
                    }
                }
                Some(Err(e)) => error!("error reading from remote: {e}"),
                None => server_closed = true,
            },
        }
    }

    // Whichever side went down first takes the other with it, exactly once.
    if client_closed && !server_closed {
        info!("local client closed; shutting down remote side");
        let _ = server_tx.close().await;
    }
    if server_closed && !client_closed {
        info!("remote closed; shutting down client side");
        let _ = client_tx.close().await;
    }

    debug!("proxy session ended ({} requests still pending)", pending.len());
    Ok(())
}

/// Client → server leg: record requests for response correlation, block
/// filtered `tools/call` invocations, and tag `initialize` with this proxy's
/// identity. Everything else passes through untouched.
fn process_client_message(
    message: JSONRPCMessage,
    filter: &ToolFilter,
    pending: &mut HashMap<RequestId, JSONRPCRequest>,
) -> ClientAction {
    let JSONRPCMessage::Request(mut request) = message else {
        return ClientAction::Forward(message);
    };

    if request.method == "tools/call" {
        let tool = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str());
        if let Some(name) = tool {
            if !filter.should_include(name) {
                info!("blocking tools/call for filtered tool {name:?}");
                return ClientAction::Reject(error_response(
                    request.id,
                    INTERNAL_ERROR,
                    format!("Tool \"{name}\" is not available"),
                ));
            }
        }
    }

    if request.method == "initialize" {
        tag_client_info(&mut request);
    }

    pending.insert(request.id.clone(), request.clone());
    ClientAction::Forward(JSONRPCMessage::Request(request))
}

/// Server → client leg: correlate responses with the recorded request and
/// filter `tools/list` results.
fn process_server_message(
    message: JSONRPCMessage,
    filter: &ToolFilter,
    pending: &mut HashMap<RequestId, JSONRPCRequest>,
) -> JSONRPCMessage {
    match message {
        JSONRPCMessage::Response(mut response) => {
            let original = pending.remove(&response.id);
            if original.map(|r| r.method == "tools/list").unwrap_or(false) {
                filter_tools_result(&mut response.result, filter);
            }
            JSONRPCMessage::Response(response)
        }
        JSONRPCMessage::Error(err) => {
            pending.remove(&err.id);
            JSONRPCMessage::Error(err)
        }
        other => other,
    }
}

fn tag_client_info(request: &mut JSONRPCRequest) {
    let name = request
        .params
        .as_mut()
        .and_then(|p| p.get_mut("clientInfo"))
        .and_then(|c| c.get_mut("name"));
    if let Some(name) = name {
        if let Some(current) = name.as_str() {
            *name = serde_json::Value::String(format!(
                "{current} (via mcp-remote {})",
                env!("CARGO_PKG_VERSION")
            ));
        }
    }
}

fn filter_tools_result(result: &mut serde_json::Value, filter: &ToolFilter) {
    if let Some(tools) = result.get_mut("tools").and_then(|t| t.as_array_mut()) {
        tools.retain(|tool| {
            tool.get("name")
                .and_then(|n| n.as_str())
                .map(|name| filter.should_include(name))
                .unwrap_or(true)
        });
    }
}
