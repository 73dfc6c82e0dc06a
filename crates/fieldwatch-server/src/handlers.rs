//! Connection handlers for the fieldwatch server.
//!
//! This module handles the connection lifecycle and event processing. Each
//! WebSocket runs in its own task, which processes that client's frames in
//! arrival order and drains the client's outbound queue from the hub.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use fieldwatch_core::{ConnectionId, Hub, HubConfig};
use fieldwatch_protocol::{codec, ClientEvent, EventKind, ProtocolError, ServerEvent, WireFormat};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{interval_at, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The broadcast hub.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub_config = HubConfig {
            max_connections: config.limits.max_connections,
            max_projects: config.limits.max_projects,
            outbound_capacity: config.limits.outbound_buffer,
        };

        Self {
            hub: Hub::with_config(hub_config),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/projects/:project_id/sessions", get(sessions_handler))
        .route(&ws_path, get(ws_handler))
        .layer(cors)
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

    let app = app(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Telemetry hub listening on {}", addr);
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
        "status": "Telemetry Hub is Running",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Hub statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(state.hub.stats())
}

/// Live enumerator sessions of one project, oldest join first.
async fn sessions_handler(
    Path(project_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    axum::Json(state.hub.registry().sessions_in(&project_id))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_message_size = state.config.limits.max_message_size + codec::LENGTH_PREFIX_SIZE;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let mut outbound = match state.hub.connect(connection_id.clone()) {
        Ok(rx) => rx,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Connection refused");
            metrics::record_error("connect");
            return;
        }
    };

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies use the encoding of the client's most recent frame.
    let mut format = WireFormat::Json;

    let greeting = ServerEvent::connected(connection_id.as_str());
    if let Err(e) = send_event(&mut sender, &greeting, format).await {
        error!(connection = %connection_id, error = %e, "Failed to send greeting");
        state.hub.disconnect(&connection_id);
        return;
    }

    // Read buffer for binary frames split across messages
    let mut read_buffer = BytesMut::with_capacity(4096);
    let max_message_size = state.config.limits.max_message_size;

    let heartbeat_interval = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let heartbeat_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events fanned out to this connection by the hub
            Some(event) = outbound.recv() => {
                if let Err(e) = send_event(&mut sender, &event, format).await {
                    debug!(connection = %connection_id, error = %e, "Send failed");
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        format = WireFormat::Json;
                        metrics::record_message(text.len(), "inbound");

                        if text.len() > max_message_size {
                            drop_malformed(&connection_id, &ProtocolError::FrameTooLarge(text.len()));
                            continue;
                        }

                        match codec::decode_client_text(&text) {
                            Ok(event) => dispatch_event(&state, &connection_id, event),
                            Err(e) => drop_malformed(&connection_id, &e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        format = WireFormat::MessagePack;
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            // Reject an oversized frame before its payload arrives.
                            if let Some(len) = codec::frame_len(&read_buffer) {
                                if len > max_message_size {
                                    drop_malformed(&connection_id, &ProtocolError::FrameTooLarge(len));
                                    read_buffer.clear();
                                    break;
                                }
                            }

                            match codec::decode_client_from(&mut read_buffer) {
                                Ok(Some(event)) => dispatch_event(&state, &connection_id, event),
                                Ok(None) => break,
                                Err(e @ ProtocolError::FrameTooLarge(_)) => {
                                    drop_malformed(&connection_id, &e);
                                    read_buffer.clear();
                                    break;
                                }
                                // The bad frame has been consumed; keep going.
                                Err(e) => drop_malformed(&connection_id, &e),
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

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(departure) = state.hub.disconnect(&connection_id) {
        metrics::record_fanout(&departure.report);
    }
    metrics::set_hub_stats(&state.hub.stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Hand a decoded event to the hub.
///
/// Rejected events are dropped here; the client is never told.
fn dispatch_event(state: &AppState, connection_id: &ConnectionId, event: ClientEvent) {
    let start = Instant::now();
    let event_kind = event.kind();
    let kind = event_kind.as_str();
    let project = event.project_id().to_string();

    match state.hub.handle(connection_id, event) {
        Ok(report) => {
            metrics::record_event(kind);
            metrics::record_fanout(&report);
            debug!(
                connection = %connection_id,
                event = kind,
                project = %project,
                delivered = report.delivered,
                dropped = report.dropped,
                "Event handled"
            );
        }
        Err(e) => {
            metrics::record_dropped_event("rejected");
            debug!(
                connection = %connection_id,
                event = kind,
                project = %project,
                error = %e,
                "Dropping event"
            );
        }
    }

    // Only joins change the session and project counts.
    if event_kind == EventKind::Join {
        metrics::set_hub_stats(&state.hub.stats());
    }
    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Log and count a frame that could not be decoded.
fn drop_malformed(connection_id: &ConnectionId, error: &ProtocolError) {
    metrics::record_dropped_event("malformed");
    debug!(connection = %connection_id, error = %error, "Dropping malformed frame");
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    format: WireFormat,
) -> Result<()> {
    let message = match format {
        WireFormat::Json => Message::Text(codec::to_json(event)?),
        WireFormat::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
    };

    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_message(len, "outbound");

    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use fieldwatch_protocol::{Location, Role};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    const STEP: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr) -> (Client, String) {
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        match next_json(&mut ws).await {
            ServerEvent::Connected { connection_id, .. } => (ws, connection_id),
            other => panic!("Expected connected greeting, got {:?}", other),
        }
    }

    async fn next_message(ws: &mut Client) -> WsMessage {
        loop {
            let msg = tokio::time::timeout(STEP, ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .unwrap();
            if !matches!(msg, WsMessage::Ping(_) | WsMessage::Pong(_)) {
                return msg;
            }
        }
    }

    async fn next_json(ws: &mut Client) -> ServerEvent {
        match next_message(ws).await {
            WsMessage::Text(text) => codec::from_json(&text).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    async fn send_json(ws: &mut Client, event: &ClientEvent) {
        let text = codec::to_json(event).unwrap();
        ws.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(STEP, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = Arc::new(AppState::new(test_config()));
        let response = app(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "Telemetry Hub is Running");
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let state = Arc::new(AppState::new(test_config()));
        let response = app(state)
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({"connectionCount": 0, "projectCount": 0, "sessionCount": 0}));
    }

    #[tokio::test]
    async fn test_enumerator_session_over_websocket() {
        let (addr, state) = spawn_server(test_config()).await;

        let (mut supervisor, _) = connect(addr).await;
        send_json(&mut supervisor, &ClientEvent::join("S1", "P1", Role::Supervisor)).await;
        wait_until(|| state.hub.member_count("P1") == 1).await;

        let (mut enumerator, _) = connect(addr).await;
        send_json(&mut enumerator, &ClientEvent::join("E1", "P1", Role::Enumerator)).await;

        assert_eq!(next_json(&mut enumerator).await, ServerEvent::enumerator_online("E1"));
        assert_eq!(next_json(&mut supervisor).await, ServerEvent::enumerator_online("E1"));

        send_json(&mut enumerator, &ClientEvent::telemetry("P1", "E1", json!("x"))).await;
        match next_json(&mut supervisor).await {
            ServerEvent::LiveUpdate {
                enumerator_id,
                data,
                timestamp,
            } => {
                assert_eq!(enumerator_id, "E1");
                assert_eq!(data, json!("x"));
                assert!(timestamp > 0);
            }
            other => panic!("Expected live_update, got {:?}", other),
        }

        let loc = Location::new(-1.29, 36.82);
        send_json(&mut enumerator, &ClientEvent::location_ping("P1", "E1", loc)).await;
        assert_eq!(
            next_json(&mut supervisor).await,
            ServerEvent::LocationUpdate {
                enumerator_id: "E1".to_string(),
                location: loc,
            }
        );
        assert_eq!(state.hub.registry().get("E1").unwrap().location, Some(loc));

        enumerator.close(None).await.unwrap();
        assert_eq!(next_json(&mut supervisor).await, ServerEvent::enumerator_offline("E1"));
        wait_until(|| !state.hub.registry().contains("E1")).await;
    }

    #[tokio::test]
    async fn test_malformed_frames_are_ignored() {
        let (addr, state) = spawn_server(test_config()).await;

        let (mut supervisor, _) = connect(addr).await;
        send_json(&mut supervisor, &ClientEvent::join("S1", "P1", Role::Supervisor)).await;
        wait_until(|| state.hub.member_count("P1") == 1).await;

        let (mut enumerator, _) = connect(addr).await;
        enumerator
            .send(WsMessage::Text("{not json".to_string()))
            .await
            .unwrap();
        enumerator
            .send(WsMessage::Text(
                r#"{"event":"join","data":{"enumeratorId":"E1","role":"enumerator"}}"#.to_string(),
            ))
            .await
            .unwrap();
        enumerator
            .send(WsMessage::Binary(vec![0, 0, 0, 2, 0xc1, 0xc1]))
            .await
            .unwrap();

        // The connection survives and a valid join still works afterwards.
        send_json(&mut enumerator, &ClientEvent::join("E1", "P1", Role::Enumerator)).await;
        assert_eq!(next_json(&mut enumerator).await, ServerEvent::enumerator_online("E1"));
        assert_eq!(next_json(&mut supervisor).await, ServerEvent::enumerator_online("E1"));
        assert_eq!(state.hub.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_binary_client_gets_binary_replies() {
        let (addr, state) = spawn_server(test_config()).await;
        let (mut enumerator, connection_id) = connect(addr).await;

        let join = codec::encode(&ClientEvent::join("E1", "P1", Role::Enumerator)).unwrap();
        enumerator
            .send(WsMessage::Binary(join.to_vec()))
            .await
            .unwrap();

        match next_message(&mut enumerator).await {
            WsMessage::Binary(data) => {
                let event: ServerEvent = codec::decode(&data).unwrap();
                assert_eq!(event, ServerEvent::enumerator_online("E1"));
            }
            other => panic!("Expected binary frame, got {:?}", other),
        }

        let session = state.hub.registry().get("E1").unwrap();
        assert_eq!(session.connection_id.as_str(), connection_id);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_disconnects() {
        let mut config = test_config();
        config.heartbeat.interval_ms = 200;
        config.heartbeat.timeout_ms = 0;
        let (addr, state) = spawn_server(config).await;

        let (mut enumerator, _) = connect(addr).await;
        send_json(&mut enumerator, &ClientEvent::join("E1", "P1", Role::Enumerator)).await;
        assert_eq!(next_json(&mut enumerator).await, ServerEvent::enumerator_online("E1"));

        // The client stays silent, so the first tick closes the connection
        // and the session is cleaned up.
        wait_until(|| state.hub.registry().is_empty()).await;
        wait_until(|| state.hub.stats().connection_count == 0).await;
    }

    #[tokio::test]
    async fn test_project_sessions_endpoint() {
        let state = Arc::new(AppState::new(test_config()));
        let conn = ConnectionId::from("c1");
        let _rx = state.hub.connect(conn.clone()).unwrap();
        state
            .hub
            .join(&conn, Some("E1"), "P1", Role::Enumerator)
            .unwrap();

        let response = app(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .uri("/projects/P1/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        let sessions = value.as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["enumeratorId"], "E1");
        assert_eq!(sessions[0]["connectionId"], "c1");
        assert_eq!(sessions[0]["status"], "active");

        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/projects/P2/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_frames_split_across_messages_are_all_delivered() {
        let mut config = test_config();
        config.limits.max_message_size = 256;
        let (addr, state) = spawn_server(config).await;

        let (mut supervisor, _) = connect(addr).await;
        send_json(&mut supervisor, &ClientEvent::join("S1", "P1", Role::Supervisor)).await;
        wait_until(|| state.hub.member_count("P1") == 1).await;

        let (mut enumerator, _) = connect(addr).await;
        let join = codec::encode(&ClientEvent::join("E1", "P1", Role::Enumerator)).unwrap();
        enumerator.send(WsMessage::Binary(join.to_vec())).await.unwrap();
        assert_eq!(next_json(&mut supervisor).await, ServerEvent::enumerator_online("E1"));

        let first = codec::encode(&ClientEvent::telemetry("P1", "E1", json!("a".repeat(120)))).unwrap();
        let second = codec::encode(&ClientEvent::telemetry("P1", "E1", json!("b".repeat(120)))).unwrap();
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        // Both messages fit the limit, but the buffered bytes together do not.
        let split = first.len() - 20;
        let (head, tail) = stream.split_at(split);
        assert!(first.len() - codec::LENGTH_PREFIX_SIZE <= 256);
        assert!(tail.len() <= 256 + codec::LENGTH_PREFIX_SIZE);
        assert!(stream.len() > 256 + codec::LENGTH_PREFIX_SIZE);

        enumerator.send(WsMessage::Binary(head.to_vec())).await.unwrap();
        enumerator.send(WsMessage::Binary(tail.to_vec())).await.unwrap();

        for expected in [json!("a".repeat(120)), json!("b".repeat(120))] {
            match next_json(&mut supervisor).await {
                ServerEvent::LiveUpdate { data, .. } => assert_eq!(data, expected),
                other => panic!("Expected live_update, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_is_dropped() {
        let mut config = test_config();
        config.limits.max_message_size = 256;
        let (addr, state) = spawn_server(config).await;

        let (mut enumerator, _) = connect(addr).await;

        // Declares a 1000 byte payload; only the prefix is sent.
        enumerator
            .send(WsMessage::Binary(vec![0, 0, 0x03, 0xe8]))
            .await
            .unwrap();

        // The buffer was cleared, so the next frame decodes cleanly.
        let join = codec::encode(&ClientEvent::join("E1", "P1", Role::Enumerator)).unwrap();
        enumerator.send(WsMessage::Binary(join.to_vec())).await.unwrap();
        match next_message(&mut enumerator).await {
            WsMessage::Binary(data) => {
                let event: ServerEvent = codec::decode(&data).unwrap();
                assert_eq!(event, ServerEvent::enumerator_online("E1"));
            }
            other => panic!("Expected binary frame, got {:?}", other),
        }
        assert!(state.hub.registry().contains("E1"));
    }

    #[tokio::test]
    async fn test_message_over_transport_limit_closes_connection() {
        let mut config = test_config();
        config.limits.max_message_size = 256;
        let (addr, state) = spawn_server(config).await;

        let (mut enumerator, _) = connect(addr).await;
        wait_until(|| state.hub.stats().connection_count == 1).await;

        // Rejected by the WebSocket layer before it is buffered.
        let _ = enumerator.send(WsMessage::Binary(vec![0; 4096])).await;
        wait_until(|| state.hub.stats().connection_count == 0).await;
    }
}
