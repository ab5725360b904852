//! HTTP surface: signaling WebSocket and health endpoint

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use livecast_sfu::{ConnectionId, Notification, RelayStats, SfuManager, SignalingHandler};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn, Instrument};

use crate::logging::connection_span;

/// Signaling frames are small JSON documents
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<SfuManager>,
    pub signaling: SignalingHandler,
}

impl AppState {
    #[must_use]
    pub fn new(relay: Arc<SfuManager>) -> Self {
        Self {
            signaling: SignalingHandler::new(Arc::clone(&relay)),
            relay,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until Ctrl+C or SIGTERM
pub async fn serve(address: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {address}: {e}"))?;
    info!("HTTP server listening on {}", address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server shut down gracefully");
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<RelayStats> {
    Json(state.relay.stats())
}

async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE).on_upgrade(move |socket| {
        let connection_id = ConnectionId::random();
        let span = connection_span(&connection_id);
        handle_socket(socket, state, connection_id).instrument(span)
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, connection_id: ConnectionId) {
    let capacity = state.relay.config().push_channel_capacity;
    info!("Signaling connection established");

    let (push_tx, push_rx) = mpsc::channel::<Notification>(capacity);
    let (response_tx, response_rx) = mpsc::channel::<String>(capacity);
    state.relay.register_push(&connection_id, push_tx);

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, response_rx, push_rx).in_current_span());

    // Requests of one connection are handled strictly in arrival order
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let response = state.signaling.handle_text(&connection_id, text.as_str()).await;
                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => debug!("Ignoring binary frame"),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    state.relay.unregister_push(&connection_id);
    state.relay.destroy_session(&connection_id);
    drop(response_tx);
    writer.abort();

    info!("Signaling connection closed");
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut responses: mpsc::Receiver<String>,
    mut pushes: mpsc::Receiver<Notification>,
) {
    loop {
        let text = tokio::select! {
            Some(response) = responses.recv() => response,
            Some(notification) = pushes.recv() => match serde_json::to_string(&notification) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to encode notification");
                    continue;
                }
            },
            else => break,
        };

        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!(error = %e, "Failed to send WebSocket message");
            break;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_sfu::{LocalEngine, SfuConfig, Supervisor, TransportRole};
    use tokio::time::{sleep, Duration};
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    fn state() -> (AppState, Supervisor) {
        let (engine, events) = LocalEngine::new();
        let supervisor = Supervisor::initialize(
            SfuConfig::default(),
            Arc::new(engine),
            events,
            Arc::new(|_: &str| {}),
        )
        .unwrap();
        (AppState::new(Arc::clone(supervisor.relay())), supervisor)
    }

    #[tokio::test]
    async fn test_healthz_reports_stats() {
        let (state, _supervisor) = state();
        let conn = ConnectionId::from("alice");
        state
            .relay
            .create_transport(&conn, TransportRole::Producing)
            .await
            .unwrap();

        let Json(stats) = healthz(State(state)).await;
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.transports, 1);
        assert_eq!(stats.ports_in_use, 1);
    }

    #[tokio::test]
    async fn test_disconnect_destroys_session() {
        let (state, _supervisor) = state();
        let relay = Arc::clone(&state.relay);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, router(state)).await });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{address}/ws"))
            .await
            .unwrap();
        socket
            .send(ClientMessage::Text(
                r#"{"id":1,"method":"createTransport","data":{"isProducer":true}}"#.into(),
            ))
            .await
            .unwrap();

        let reply = loop {
            match socket.next().await.unwrap().unwrap() {
                ClientMessage::Text(text) => break text,
                _ => continue,
            }
        };
        let reply: serde_json::Value = serde_json::from_str(reply.as_str()).unwrap();
        assert_eq!(reply["id"], 1);
        assert!(reply["response"]["id"].is_string());
        assert!(reply.get("error").is_none());
        assert_eq!(relay.stats().sessions, 1);
        assert_eq!(relay.stats().ports_in_use, 1);

        socket.close(None).await.unwrap();
        let mut stats = relay.stats();
        for _ in 0..200 {
            if stats.sessions == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
            stats = relay.stats();
        }
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.transports, 0);
        assert_eq!(stats.ports_in_use, 0);

        server.abort();
    }
}
