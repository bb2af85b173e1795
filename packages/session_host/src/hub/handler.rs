//! WebSocket handler for session endpoints.

use axum::{
    Router,
    extract::{
        MatchedPath, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{sink::SinkExt, stream::SplitSink, stream::StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::connections::SessionHub;
use crate::config::{HostOptions, HubOptions};
use crate::endpoint::validate_endpoint;
use crate::error::SessionError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::ServiceProvider;
use crate::session::{ConnectionHandle, Session};

const DEFAULT_BASE_URI: &str = "http://localhost/";

#[derive(Clone)]
struct HubState {
    hub: Arc<SessionHub>,
    options: Arc<HubOptions>,
}

/// Location the client reports when it opens the socket
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectQuery {
    #[serde(default = "default_base_uri")]
    pub base_uri: String,
    /// Current URI, absolute or relative to `base_uri`
    #[serde(default)]
    pub uri: Option<String>,
}

fn default_base_uri() -> String {
    DEFAULT_BASE_URI.to_string()
}

/// Build a router serving a session WebSocket on every bound endpoint and on
/// the configured default endpoint.
pub fn router(provider: &ServiceProvider) -> Result<Router, SessionError> {
    let hub = provider.get::<SessionHub>()?;
    let options = provider.get::<HubOptions>()?;
    let host = provider.get::<HostOptions>()?;

    let mut endpoints: BTreeSet<String> = provider
        .endpoints()
        .endpoints()
        .map(str::to_string)
        .collect();
    endpoints.insert(host.endpoint.clone());

    let mut router: Router<HubState> = Router::new();
    for endpoint in &endpoints {
        validate_endpoint(endpoint)?;
        debug!(endpoint = %endpoint, "Serving session endpoint");
        router = router.route(endpoint, get(session_ws_handler));
    }
    Ok(router.with_state(HubState { hub, options }))
}

async fn session_ws_handler(
    State(state): State<HubState>,
    matched: MatchedPath,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let endpoint = matched.as_str().to_string();
    ws.on_upgrade(move |socket| handle_session_ws(socket, state, endpoint, query))
}

async fn handle_session_ws(socket: WebSocket, state: HubState, endpoint: String, query: ConnectQuery) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let uri = query.uri.unwrap_or_else(|| query.base_uri.clone());
    info!(conn_id = %connection_id, endpoint = %endpoint, "New session connection");

    let (connection, mut outbound) = ConnectionHandle::new(
        connection_id.clone(),
        query.base_uri,
        uri,
        state.options.outbound_capacity,
    );
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let session = match state.hub.on_connect(&endpoint, connection.clone()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(conn_id = %connection_id, endpoint = %endpoint, "Session rejected: {e:#}");
            let _ = send_json(&mut ws_sender, &ServerMessage::Error((&e).into())).await;
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = session.id();

    let connected = ServerMessage::Connected {
        session_id: session_id.to_string(),
        components: session.root_components().to_vec(),
    };
    if connection.send(connected).await.is_err() {
        warn!(conn_id = %connection_id, "Failed to queue connected message - connection closed");
    }

    // Outbound messages drain before the close token is observed, so an error
    // queued ahead of a close still reaches the client.
    let close = connection.close_token();
    let sender_task = async move {
        loop {
            tokio::select! {
                biased;
                msg = outbound.recv() => match msg {
                    Some(msg) => {
                        if send_json(&mut ws_sender, &msg).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = close.cancelled() => break,
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    };

    // Invocation results are completed as they arrive. Events and location
    // changes go through `ordered` to a forwarder that waits for room on the
    // session's queue, so a busy session slows the reader down instead of
    // losing messages, while an operation waiting on the client can still
    // receive its result.
    let (ordered_tx, ordered_rx) = mpsc::channel(state.options.outbound_capacity.max(1));
    let forward_task = forward_ordered(session.clone(), ordered_rx);

    let input_session = session.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::InvocationResult {
                        call_id,
                        result,
                        error,
                    }) => complete_invocation(&input_session, call_id, result, error),
                    Ok(client_msg) => {
                        if ordered_tx.send(client_msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(session_id = %input_session.id(), "Invalid client message: {e}"),
                },
                Ok(Message::Close(_)) => {
                    debug!(session_id = %input_session.id(), "Client closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(session_id = %input_session.id(), "WebSocket error: {e}");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(session_id = %session_id, "Sender task ended"),
        _ = input_task => debug!(session_id = %session_id, "Input task ended"),
        _ = forward_task => debug!(session_id = %session_id, "Forwarder ended"),
    }

    state.hub.on_disconnect(session_id).await;
    info!(conn_id = %connection_id, session_id = %session_id, "Session connection closed");
}

async fn forward_ordered(session: Arc<Session>, mut ordered: mpsc::Receiver<ClientMessage>) {
    while let Some(msg) = ordered.recv().await {
        route_client_message(&session, msg).await;
        if session.is_terminated() {
            break;
        }
    }
}

fn complete_invocation(
    session: &Session,
    call_id: u64,
    result: Option<Value>,
    error: Option<String>,
) {
    let outcome = match error {
        Some(message) => Err(message),
        None => Ok(result.unwrap_or(Value::Null)),
    };
    if !session.complete_invocation(call_id, outcome) {
        debug!(session_id = %session.id(), call_id, "Result for unknown or expired call");
    }
}

/// Route one client message, waiting for room on the session's queue.
async fn route_client_message(session: &Arc<Session>, msg: ClientMessage) {
    match msg {
        ClientMessage::InvocationResult {
            call_id,
            result,
            error,
        } => complete_invocation(session, call_id, result, error),
        ClientMessage::Event { name, payload } => match session.dispatch_event(&name, payload).await {
            Ok(done) => {
                tokio::spawn(watch_event(session.clone(), name, done));
            }
            Err(e) => warn!(session_id = %session.id(), event = %name, "Event not dispatched: {e}"),
        },
        ClientMessage::LocationChanged { uri } => {
            let queued = session
                .enqueue(move |scope| async move {
                    scope.navigation()?.notify_location_changed(&uri)
                })
                .await;
            if let Err(e) = queued {
                warn!(session_id = %session.id(), "Location change not dispatched: {e}");
            }
        }
    }
}

/// A failed event handler leaves the session unusable: report and terminate.
async fn watch_event(
    session: Arc<Session>,
    name: String,
    done: oneshot::Receiver<Result<(), SessionError>>,
) {
    // A dropped receiver means the session terminated first.
    let Ok(Err(e)) = done.await else {
        return;
    };
    error!(session_id = %session.id(), event = %name, "Event handler failed: {e:#}");
    let _ = session
        .connection()
        .send(ServerMessage::Error((&e).into()))
        .await;
    session.abort();
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}
