//! Connection handlers for the Courier server.
//!
//! This module owns the transport side of the contract: it authenticates
//! the handshake, registers the connection with the engine, pumps outbound
//! events onto the socket, and feeds decoded inbound frames into the
//! ingest pipeline.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::{ConnectionHandle, Engine, EngineConfig, MemoryStore};
use courier_protocol::{codec, ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

type WsSink = futures_util::stream::SplitSink<WebSocket, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocket>;

/// Shared server state.
pub struct AppState {
    /// The fanout engine.
    pub engine: Engine,
    /// The in-memory identity/persistence backend.
    pub store: Arc<MemoryStore>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Build the state, seeding the store from configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());

        let mut ids = HashMap::new();
        for user in &config.users {
            let id = store.add_user(&user.username, &user.token);
            ids.insert(user.username.clone(), id);
        }
        for group in &config.groups {
            let members: Vec<_> = group
                .members
                .iter()
                .filter_map(|name| ids.get(name).copied())
                .collect();
            store.create_group(&group.name, &members);
        }
        if !config.users.is_empty() {
            info!(
                users = config.users.len(),
                groups = config.groups.len(),
                "Seeded in-memory store"
            );
        }

        let engine_config = EngineConfig {
            channel_capacity: config.engine.channel_capacity,
            send_timeout: Duration::from_millis(config.engine.send_timeout_ms),
        };
        let engine = Engine::with_config(
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
            engine_config,
        );

        Self {
            engine,
            store,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let ws_path = config.ws_path.clone();
    let state = Arc::new(AppState::new(config));

    let app = Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Drive one WebSocket connection from handshake to cleanup.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut sink, mut stream) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    let Some(mut handle) = handshake(&mut sink, &mut stream, &mut read_buffer, &state).await
    else {
        return;
    };

    let connection_id = handle.connection_id;
    debug!(
        connection = connection_id,
        user = handle.user_id,
        "Connection authenticated"
    );
    if handle.went_online {
        metrics::record_presence_transition(true);
    }

    let connected = ServerFrame::Connected {
        connection_id,
        user_id: handle.user_id,
        heartbeat: state.config.heartbeat.interval_ms as u32,
    };
    if send_frame(&mut sink, &connected).await.is_err() {
        let _ = state.engine.disconnect(connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            biased;

            // deliveries from the engine, in order
            event = handle.events.recv() => {
                match event {
                    Some(event) => {
                        let frame = ServerFrame::from(&*event);
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    // engine side dropped the channel
                    None => break,
                }
            }

            // inbound traffic from the client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);
                        if process_buffer(&mut read_buffer, connection_id, &state, &mut sink)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Text(_))) => {
                        let frame = ServerFrame::protocol_error("binary frames only");
                        let _ = send_frame(&mut sink, &frame).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!(connection = connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let went_offline = state.engine.disconnect(connection_id).await;
    if went_offline {
        metrics::record_presence_transition(false);
    }
    debug!(connection = connection_id, "Connection closed");
}

/// Wait for the `Connect` frame and authenticate it.
///
/// Returns `None` (after sending the rejection) if the client breaks
/// protocol, fails authentication, or goes away.
async fn handshake(
    sink: &mut WsSink,
    stream: &mut WsStream,
    read_buffer: &mut BytesMut,
    state: &Arc<AppState>,
) -> Option<ConnectionHandle> {
    loop {
        match codec::decode_from::<ClientFrame>(read_buffer) {
            Ok(Some(ClientFrame::Connect { token })) => {
                return match state.engine.connect(&token).await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(error = %e, "Handshake rejected");
                        let _ = send_frame(sink, &ServerFrame::auth_rejection(&e)).await;
                        None
                    }
                };
            }
            Ok(Some(frame)) => {
                warn!(frame = frame.kind(), "Frame before handshake");
                let frame = ServerFrame::protocol_error("expected connect frame");
                let _ = send_frame(sink, &frame).await;
                return None;
            }
            Ok(None) => {}
            Err(e) => {
                let frame = ServerFrame::protocol_error(e.to_string());
                let _ = send_frame(sink, &frame).await;
                return None;
            }
        }

        match stream.next().await {
            Some(Ok(Message::Binary(data))) => read_buffer.extend_from_slice(&data),
            Some(Ok(Message::Ping(data))) => {
                if sink.send(Message::Pong(data)).await.is_err() {
                    return None;
                }
            }
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => {}
            Some(Err(_)) => return None,
        }
    }
}

/// Decode and handle every complete frame currently in the read buffer.
async fn process_buffer(
    read_buffer: &mut BytesMut,
    connection_id: u64,
    state: &Arc<AppState>,
    sink: &mut WsSink,
) -> Result<()> {
    loop {
        match codec::decode_from::<ClientFrame>(read_buffer) {
            Ok(Some(frame)) => handle_frame(frame, connection_id, state, sink).await?,
            Ok(None) => return Ok(()),
            Err(e) => {
                // a client we cannot parse is a client we cannot keep
                warn!(connection = connection_id, error = %e, "Protocol error");
                let frame = ServerFrame::protocol_error(e.to_string());
                let _ = send_frame(sink, &frame).await;
                anyhow::bail!("protocol error");
            }
        }
    }
}

/// Handle one decoded client frame.
async fn handle_frame(
    frame: ClientFrame,
    connection_id: u64,
    state: &Arc<AppState>,
    sink: &mut WsSink,
) -> Result<()> {
    match frame {
        ClientFrame::Ping { timestamp } => {
            send_frame(sink, &ServerFrame::Pong { timestamp }).await?;
        }
        ClientFrame::Connect { .. } => {
            debug!(connection = connection_id, "Duplicate connect frame ignored");
        }
        frame => {
            let kind = frame.kind();
            metrics::record_event(kind);

            // kind() covered the non-event frames above
            let Some(event) = frame.into_event() else {
                return Ok(());
            };

            let response = match state.engine.submit(connection_id, event).await {
                Ok(report) => {
                    metrics::record_deliveries(report.delivered, report.failed);
                    ServerFrame::Ack
                }
                Err(e) => {
                    debug!(connection = connection_id, kind, error = %e, "Event rejected");
                    let frame = ServerFrame::rejection(&e);
                    if let ServerFrame::Error { code, .. } = &frame {
                        metrics::record_rejection(*code);
                    }
                    frame
                }
            };
            send_frame(sink, &response).await?;
        }
    }

    Ok(())
}

/// Encode and send one frame.
async fn send_frame(sink: &mut WsSink, frame: &ServerFrame) -> Result<()> {
    let data = codec::encode(frame)?;
    sink.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
