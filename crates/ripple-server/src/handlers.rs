//! Connection handlers for the Ripple gateway.
//!
//! This module owns the WebSocket edge: admission handshake, the
//! per-connection event loop, and teardown. Each connection's inbound
//! events are handled sequentially, which gives the per-sender ordering
//! guarantee for free.

use crate::config::Config;
use crate::http;
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
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ripple_core::{
    CallRegistry, ConnectionHandle, ConnectionId, MemoryStore, MessageArchive, NoopArchive,
    OfflineQueue, OfflineStore, Registry, Relay, Topics, TopicsConfig,
};
use ripple_protocol::{codec, codes, Event};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state: the explicitly-owned state objects every handler
/// works through.
pub struct AppState {
    /// The chat event relay.
    pub relay: Relay,
    /// The call signaling registry.
    pub calls: CallRegistry,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state with the in-memory offline store and no archive.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_parts(config, Arc::new(MemoryStore::new()), Arc::new(NoopArchive))
    }

    /// Create app state over an injected offline store and message
    /// archive.
    #[must_use]
    pub fn with_parts(
        config: Config,
        store: Arc<dyn OfflineStore>,
        archive: Arc<dyn MessageArchive>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let topics = Arc::new(Topics::with_config(TopicsConfig {
            max_topics: config.limits.max_topics,
            max_memberships_per_user: config.limits.max_memberships_per_user,
            auto_delete_empty: true,
        }));
        let offline = OfflineQueue::with_ttl(store, config.offline.ttl_seconds);
        let relay = Relay::new(
            registry.clone(),
            topics.clone(),
            offline,
            archive,
            config.heartbeat.interval_ms as u32,
        );
        let calls = CallRegistry::new(registry, topics);

        Self {
            relay,
            calls,
            config,
        }
    }
}

/// Build the gateway's HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(http::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Auto-fail calls that ring past the configured deadline
    if let Some(ring_timeout_ms) = config.calls.ring_timeout_ms {
        let sweep_state = state.clone();
        tokio::spawn(async move {
            let timeout = std::time::Duration::from_millis(ring_timeout_ms);
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let expired = sweep_state.calls.expire_unanswered(timeout);
                if !expired.is_empty() {
                    info!(count = expired.len(), "Expired unanswered calls");
                }
                metrics::set_active_calls(sweep_state.calls.active_count());
            }
        });
    }

    let app = build_app(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Ripple gateway listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

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

/// Handle a WebSocket connection end to end.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let handle = ConnectionHandle::new(connection_id.clone(), tx);

    let mut read_buffer = BytesMut::with_capacity(4096);

    // Admission: the first decodable event must be Connect. Anything else,
    // or a failed admission, is fatal to this connection.
    let user_id = match await_connect(&mut receiver, &mut read_buffer).await {
        Some(Event::Connect { token, user_id }) => {
            let backlog_len = state.relay.offline().len(&user_id).await.unwrap_or(0);
            match state
                .relay
                .connect(token.as_deref(), &user_id, handle.clone())
                .await
            {
                Ok(()) => {
                    if backlog_len > 0 {
                        metrics::record_offline_drained(backlog_len);
                    }
                    user_id
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Admission rejected");
                    metrics::record_error("admission");
                    let reject = Event::error(codes::UNAUTHENTICATED, e.to_string());
                    send_event(&mut sender, &reject).await.ok();
                    return;
                }
            }
        }
        _ => {
            warn!(connection = %connection_id, "No Connect handshake; closing");
            metrics::record_error("handshake");
            let reject = Event::error(codes::BAD_EVENT, "Expected connect handshake");
            send_event(&mut sender, &reject).await.ok();
            return;
        }
    };

    // Event loop: outbound events from the relay race inbound frames.
    loop {
        tokio::select! {
            biased;

            Some(event) = rx.recv() => {
                let superseded = matches!(
                    &event,
                    Event::Error { code, .. } if *code == codes::SUPERSEDED
                );
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
                if superseded {
                    debug!(connection = %connection_id, "Connection superseded; closing");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > state.config.limits.max_message_size {
                            warn!(connection = %connection_id, bytes = data.len(), "Oversized frame dropped");
                            metrics::record_error("oversized");
                            continue;
                        }
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);
                        metrics::record_event(data.len(), "inbound");

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    handle_event(event, &user_id, &state, &handle).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    // Malformed payloads cost one frame, never
                                    // the connection
                                    warn!(connection = %connection_id, error = %e, "Dropped malformed event");
                                    metrics::record_error("decode");
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Text(_))) => {
                        warn!(connection = %connection_id, "Text frame dropped; protocol is binary");
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.relay.disconnect(&connection_id);
    metrics::set_active_topics(state.relay.topics().stats().topic_count);
    metrics::set_active_calls(state.calls.active_count());

    debug!(connection = %connection_id, user = %user_id, "WebSocket disconnected");
}

/// Read frames until the first decodable event, which starts the
/// handshake. Returns `None` if the stream ends or a frame is malformed
/// before an identity was established.
async fn await_connect(
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Option<Event> {
    loop {
        match receiver.next().await? {
            Ok(Message::Binary(data)) => {
                read_buffer.extend_from_slice(&data);
                match codec::decode_from(read_buffer) {
                    Ok(Some(event)) => return Some(event),
                    Ok(None) => continue,
                    Err(_) => return None,
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(Message::Text(_)) => return None,
        }
    }
}

/// Handle one decoded client event.
///
/// Precondition failures are reported back on the sender's own
/// connection; they never mutate state.
async fn handle_event(event: Event, user_id: &str, state: &Arc<AppState>, handle: &ConnectionHandle) {
    debug!(user = %user_id, event = event.kind(), "Handling event");

    match event {
        Event::Join { conversation_id } => {
            if let Err(e) = state.relay.join(user_id, &conversation_id) {
                handle.send(Event::error(codes::PRECONDITION, e.to_string()));
            }
            metrics::set_active_topics(state.relay.topics().stats().topic_count);
        }

        Event::Leave { conversation_id } => {
            state.relay.leave(user_id, &conversation_id);
            metrics::set_active_topics(state.relay.topics().stats().topic_count);
        }

        Event::SendMessage {
            conversation_id,
            message_type,
            content,
            media_refs,
            reply_to_id,
        } => {
            match state
                .relay
                .send_message(
                    user_id,
                    &conversation_id,
                    message_type,
                    content,
                    media_refs,
                    reply_to_id,
                )
                .await
            {
                Ok(message) => {
                    let queued = state
                        .relay
                        .topics()
                        .members(&message.conversation_id)
                        .iter()
                        .filter(|m| m.as_str() != user_id && !state.relay.registry().is_online(m))
                        .count();
                    if queued > 0 {
                        metrics::record_offline_enqueued(queued);
                    }
                }
                Err(e) => {
                    metrics::record_error("send_message");
                    handle.send(Event::error(codes::PRECONDITION, e.to_string()));
                }
            }
        }

        Event::TypingStart { conversation_id } => {
            if let Err(e) = state.relay.typing(user_id, &conversation_id, true) {
                handle.send(Event::error(codes::PRECONDITION, e.to_string()));
            }
        }

        Event::TypingStop { conversation_id } => {
            if let Err(e) = state.relay.typing(user_id, &conversation_id, false) {
                handle.send(Event::error(codes::PRECONDITION, e.to_string()));
            }
        }

        Event::MarkAsRead {
            conversation_id,
            message_id,
        } => {
            if let Err(e) = state.relay.mark_as_read(user_id, &conversation_id, &message_id) {
                handle.send(Event::error(codes::PRECONDITION, e.to_string()));
            }
        }

        Event::CallInitiate {
            callee_id,
            conversation_id,
            media_kind,
            offer_sdp,
        } => {
            match state
                .calls
                .initiate(user_id, &callee_id, &conversation_id, media_kind, offer_sdp)
            {
                Ok(session) => {
                    metrics::record_call_started();
                    metrics::set_active_calls(state.calls.active_count());
                    handle.send(Event::CallStatus {
                        call_id: session.call_id,
                        conversation_id: session.conversation_id,
                        phase: session.phase,
                    });
                }
                Err(e) => {
                    metrics::record_error("call");
                    handle.send(Event::error(codes::PRECONDITION, e.to_string()));
                }
            }
        }

        Event::CallAnswer { call_id, answer_sdp } => {
            if let Err(e) = state.calls.answer(user_id, &call_id, answer_sdp) {
                metrics::record_error("call");
                handle.send(Event::error(codes::PRECONDITION, e.to_string()));
            }
        }

        Event::CallDeclined { call_id } => {
            if let Err(e) = state.calls.decline(user_id, &call_id) {
                metrics::record_error("call");
                handle.send(Event::error(codes::PRECONDITION, e.to_string()));
            }
            metrics::set_active_calls(state.calls.active_count());
        }

        Event::CallHangup { call_id, reason } => {
            if let Err(e) = state.calls.end(&call_id, Some(user_id), reason) {
                metrics::record_error("call");
                handle.send(Event::error(codes::PRECONDITION, e.to_string()));
            }
            metrics::set_active_calls(state.calls.active_count());
        }

        Event::IceCandidate { call_id, candidate } => {
            if let Err(e) = state.calls.relay_ice_candidate(&call_id, user_id, candidate) {
                metrics::record_error("call");
                handle.send(Event::error(codes::PRECONDITION, e.to_string()));
            }
        }

        Event::Ping { timestamp } => {
            handle.send(Event::pong(timestamp));
        }

        Event::Connect { .. } => {
            debug!(user = %user_id, "Connect after handshake; ignored");
        }

        other => {
            // Gateway-to-client events arriving from a client are dropped
            warn!(user = %user_id, event = other.kind(), "Unexpected event from client");
            metrics::record_error("unexpected_event");
        }
    }
}

/// Encode and send an event over the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &Event,
) -> Result<()> {
    let data = codec::encode(event)?;
    metrics::record_event(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
