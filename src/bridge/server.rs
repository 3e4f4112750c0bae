//! Loopback-only WebSocket listener
//!
//! Exposes the v2 protocol. Binding refuses non-loopback hosts; a peer
//! that still reaches the socket from a non-loopback address gets one
//! formatted auth error and an immediate close — no command is ever
//! dispatched for it. Per-connection limits: 20 in-flight commands,
//! 2 MB of buffered outbound bytes (excess events are dropped and
//! counted), 256 KB per command frame.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Semaphore};

use super::protocol::{parse_command, ErrorCode, Event, ProtocolError};
use super::session::BridgeSession;
use crate::config::BridgeConfig;
use crate::Result;

/// Max concurrently executing commands per connection
pub const MAX_INFLIGHT_COMMANDS: usize = 20;

/// Max buffered outbound bytes per connection
pub const MAX_OUTBOUND_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// Shared server state
pub struct ServerState {
    session: Arc<BridgeSession>,
    token: String,
    /// Connected client count
    pub clients: AtomicUsize,
    /// Events dropped across clients due to buffer pressure
    pub dropped_events: AtomicU64,
}

/// Bridge WebSocket server
pub struct BridgeServer {
    state: Arc<ServerState>,
    config: BridgeConfig,
}

impl BridgeServer {
    /// Create a server for one session
    ///
    /// # Errors
    ///
    /// Returns error when the bridge config is invalid (empty token or
    /// non-loopback host)
    pub fn new(config: BridgeConfig, session: Arc<BridgeSession>) -> Result<Self> {
        config.validate()?;
        let token = config.token.clone();
        Ok(Self {
            state: Arc::new(ServerState {
                session,
                token,
                clients: AtomicUsize::new(0),
                dropped_events: AtomicU64::new(0),
            }),
            config,
        })
    }

    /// Bind and serve until the task is aborted
    ///
    /// # Errors
    ///
    /// Returns error when the listener cannot bind
    pub async fn serve(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "bridge listening (loopback only)");

        let app = Router::new()
            .route("/", get(ws_upgrade))
            .with_state(Arc::clone(&self.state));

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

async fn ws_upgrade(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Auth error for a non-loopback peer, if one is warranted
#[must_use]
pub fn reject_non_loopback(addr: SocketAddr, account_id: &str) -> Option<Event> {
    if addr.ip().is_loopback() {
        return None;
    }
    Some(Event::error(
        account_id,
        None,
        &ProtocolError {
            code: ErrorCode::Auth,
            message: format!("connections from {} are not permitted", addr.ip()),
            retryable: false,
        },
    ))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, addr: SocketAddr) {
    let account_id = state.session.health_snapshot()["accountId"]
        .as_str()
        .unwrap_or("default")
        .to_string();

    let (mut sender, mut receiver) = socket.split();

    // Loopback enforcement: one auth error, then close.
    if let Some(rejection) = reject_non_loopback(addr, &account_id) {
        tracing::warn!(peer = %addr, "rejecting non-loopback bridge connection");
        if let Ok(text) = serde_json::to_string(&rejection) {
            let _ = sender.send(WsMessage::Text(text.into())).await;
        }
        let _ = sender.close().await;
        return;
    }

    state.clients.fetch_add(1, Ordering::Relaxed);
    tracing::info!(peer = %addr, "bridge client connected");

    // Outbound lane with a byte budget; events beyond the budget are
    // dropped with a counter rather than ballooning memory.
    let buffered_bytes = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_budgeted = {
        let buffered_bytes = Arc::clone(&buffered_bytes);
        let dropped = Arc::new(AtomicU64::new(0));
        let state = Arc::clone(&state);
        move |text: String| {
            let len = text.len();
            if buffered_bytes.load(Ordering::Relaxed) + len > MAX_OUTBOUND_BUFFER_BYTES {
                dropped.fetch_add(1, Ordering::Relaxed);
                state.dropped_events.fetch_add(1, Ordering::Relaxed);
                return;
            }
            buffered_bytes.fetch_add(len, Ordering::Relaxed);
            let _ = tx.send(text);
        }
    };

    let writer = {
        let buffered_bytes = Arc::clone(&buffered_bytes);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                buffered_bytes.fetch_sub(text.len(), Ordering::Relaxed);
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        })
    };

    // Fan bridge events (inbound messages, status, QR) out to this client.
    let event_pump = {
        let mut events = state.session.subscribe();
        let send_budgeted = send_budgeted.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Ok(text) = serde_json::to_string(&event) {
                    send_budgeted(text);
                }
            }
        })
    };

    let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_COMMANDS));

    while let Some(Ok(frame)) = receiver.next().await {
        let text = match frame {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let command = match parse_command(&text, &state.token) {
            Ok(command) => command,
            Err(error) => {
                let event = Event::error(&account_id, None, &error);
                if let Ok(text) = serde_json::to_string(&event) {
                    send_budgeted(text);
                }
                if error.code == ErrorCode::Auth {
                    break;
                }
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&inflight).try_acquire_owned() else {
            let error = ProtocolError {
                code: ErrorCode::QueueOverflow,
                message: format!("more than {MAX_INFLIGHT_COMMANDS} commands in flight"),
                retryable: true,
            };
            let event = Event::error(&account_id, command.request_id.clone(), &error);
            if let Ok(text) = serde_json::to_string(&event) {
                send_budgeted(text);
            }
            continue;
        };

        let session = Arc::clone(&state.session);
        let server_state = Arc::clone(&state);
        let inflight_gauge = Arc::clone(&inflight);
        let account_id = account_id.clone();
        let send_budgeted = send_budgeted.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let request_id = command.request_id.clone();
            let is_health = matches!(command.kind, super::protocol::CommandKind::Health);
            let event = match session.handle_command(&command).await {
                Ok(mut payload) => {
                    if is_health {
                        payload["queue"] = serde_json::json!({
                            "clients": server_state.clients.load(Ordering::Relaxed),
                            "inflight": MAX_INFLIGHT_COMMANDS
                                - inflight_gauge.available_permits(),
                            "dropped": server_state.dropped_events.load(Ordering::Relaxed),
                        });
                    }
                    Event::response(&account_id, request_id, payload)
                }
                Err(error) => Event::error(&account_id, request_id, &error),
            };
            if let Ok(text) = serde_json::to_string(&event) {
                send_budgeted(text);
            }
        });
    }

    event_pump.abort();
    writer.abort();
    state.clients.fetch_sub(1, Ordering::Relaxed);
    tracing::info!(peer = %addr, "bridge client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_peers_are_accepted() {
        let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        assert!(reject_non_loopback(addr, "acct").is_none());
        let v6: SocketAddr = "[::1]:5555".parse().unwrap();
        assert!(reject_non_loopback(v6, "acct").is_none());
    }

    #[test]
    fn lan_peer_gets_auth_error() {
        let addr: SocketAddr = "192.168.1.5:5555".parse().unwrap();
        let rejection = reject_non_loopback(addr, "acct").unwrap();
        assert_eq!(rejection.kind, "error");
        assert_eq!(rejection.payload["code"], "ERR_AUTH");
        assert_eq!(rejection.payload["retryable"], false);
    }
}
