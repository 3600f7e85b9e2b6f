//! Connection handlers for the Huddle server.
//!
//! This module owns the shared state, builds the HTTP router and runs one
//! task per WebSocket connection.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{
    ChatFanout, MemoryStore, NotificationAggregator, RegistryConfig, RegistryError, Relay,
    RelayError, RoomRegistry,
};
use huddle_protocol::{codec, error_codes, ClientEvent, ProtocolError, ServerEvent, WireFormat};
use huddle_transport::{ChannelSink, ConnectionId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The signaling relay, which owns the room registry.
    pub relay: Arc<Relay>,
    /// Collaborator records.
    pub store: Arc<MemoryStore>,
    /// Friend requests and unread conversations.
    pub notifications: NotificationAggregator,
    /// Persist-then-relay chat.
    pub chat: ChatFanout,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(RoomRegistry::with_config(RegistryConfig {
            max_rooms_per_connection: config.limits.max_rooms_per_connection,
        }));
        let relay = Arc::new(Relay::new(registry));
        let store = Arc::new(MemoryStore::new());

        Self {
            notifications: NotificationAggregator::new(store.clone())
                .with_relay(Arc::clone(&relay)),
            chat: ChatFanout::new(store.clone(), Arc::clone(&relay)),
            config,
            relay,
            store,
        }
    }

    fn update_room_gauge(&self) {
        metrics::set_active_rooms(self.relay.registry().stats().room_count);
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::new(config));
    let websocket_path = state.config.transport.websocket_path.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, websocket_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.registry().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.relay.connection_count(),
        "rooms": stats.room_count,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    format: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.relay.connection_count() >= state.config.limits.max_connections {
        warn!("Connection limit reached, rejecting upgrade");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let format = WireFormat::from_name(params.format.as_deref());
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, format))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, format: WireFormat) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = ConnectionId::generate();
    let (sink, mut outbound) = ChannelSink::pair();
    state.relay.attach(connection.clone(), Arc::new(sink));

    debug!(connection = %connection, format = format.name(), "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat_ms = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = ServerEvent::connected(connection.as_str(), heartbeat_ms);
    if let Err(e) = send_event(&mut sender, format, &connected).await {
        error!(connection = %connection, error = %e, "Failed to send Connected event");
        state.relay.disconnect(&connection);
        return;
    }

    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut heartbeat = tokio::time::interval(state.config.heartbeat.interval());
    heartbeat.tick().await;
    let timeout = state.config.heartbeat.timeout();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events queued by the relay, in order
            Some(event) = outbound.recv() => {
                if let Err(e) = send_event(&mut sender, format, &event).await {
                    debug!(connection = %connection, error = %e, "Outbound send failed");
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    warn!(connection = %connection, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(_))) if format == WireFormat::MessagePack => {
                        let error = ProtocolError::UnexpectedFormat("text");
                        reject_malformed(&state, &connection, &error);
                    }
                    Some(Ok(Message::Binary(_))) if format == WireFormat::Json => {
                        let error = ProtocolError::UnexpectedFormat("binary");
                        reject_malformed(&state, &connection, &error);
                    }
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_frame(text.len(), "inbound");
                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => dispatch(&state, &connection, event),
                            Err(e) => reject_malformed(&state, &connection, &e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => dispatch(&state, &connection, event),
                                Ok(None) => break,
                                Err(e) => {
                                    reject_malformed(&state, &connection, &e);
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let delivery = state.relay.disconnect(&connection);
    metrics::record_delivery(delivery);
    state.update_room_gauge();

    debug!(connection = %connection, "WebSocket disconnected");
}

/// Apply one inbound event.
fn dispatch(state: &AppState, connection: &ConnectionId, event: ClientEvent) {
    let start = Instant::now();
    let kind = event.kind();
    metrics::record_event(kind.as_str(), "inbound");

    match state.relay.handle(connection, event) {
        Ok(delivery) => metrics::record_delivery(delivery),
        Err(RelayError::Registry(e)) => {
            warn!(connection = %connection, kind = %kind, error = %e, "Event rejected");
            let code = match e {
                RegistryError::InvalidRoom(_) => error_codes::INVALID_ROOM,
                RegistryError::LimitReached => error_codes::LIMIT_REACHED,
            };
            state
                .relay
                .send_to_connection(connection, ServerEvent::error(code, e.to_string()));
        }
    }

    state.update_room_gauge();
    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Answer an undecodable frame without closing the connection.
fn reject_malformed(state: &AppState, connection: &ConnectionId, error: &ProtocolError) {
    debug!(connection = %connection, error = %error, "Malformed frame");
    metrics::record_error("malformed");
    state.relay.send_to_connection(
        connection,
        ServerEvent::error(error_codes::MALFORMED, error.to_string()),
    );
}

/// Send an event in the connection's wire format.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    format: WireFormat,
    event: &ServerEvent,
) -> Result<()> {
    let message = match format {
        WireFormat::Json => Message::Text(codec::encode_json(event)?),
        WireFormat::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
    };
    let bytes = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    sender.send(message).await?;

    metrics::record_frame(bytes, "outbound");
    metrics::record_event(event.kind().as_str(), "outbound");
    Ok(())
}
