//! WebSocket connection gateway.
//!
//! Architecture:
//! ```text
//! GET /  ── no upgrade ──► bundled client page
//!   │
//!   └── upgrade ──► connection task ──┬── SessionRegistry
//!                   (one per socket)  ├── RecoveryEngine ──┐
//!                                     │                    ├── MessageLog
//!                                     └── BroadcastEngine ─┘
//! ```
//!
//! Each upgraded socket gets its own task, which owns both halves of the
//! WebSocket and the receiving end of the session's outbox:
//!
//! 1. read `username` / `serverOffset` from the upgrade query
//! 2. admit: register the session and replay its backlog
//! 3. loop: inbound `chat message` → publish, outbox → socket, and retry
//!    recovery on a timer while the backlog is still missing
//! 4. unregister on close
//!
//! Persistence failures during publish or recovery are logged and counted by
//! the engines and never reach the client or close the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::broadcast::{BroadcastEngine, RelayStats, RelayStatsSnapshot};
use crate::error::RelayError;
use crate::order::DeliveryOrder;
use crate::protocol::{ClientEvent, Handshake, Message, ServerEvent};
use crate::recovery::{RecoveryEngine, RecoveryOutcome};
use crate::session::{ConnectionId, Outbox, SessionRegistry};
use crate::storage::{open_log, MessageLog, StoreConfig};

/// Browser client served at `/` to plain HTTP requests.
const CLIENT_PAGE: &str = include_str!("../static/index.html");

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistent message log (None = in-memory only)
    pub storage: Option<StoreConfig>,
    /// Inbound messages longer than this are dropped
    pub max_message_bytes: usize,
    /// Delay between recovery attempts for a connection whose backlog read
    /// failed
    pub recovery_retry: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            storage: None,
            max_message_bytes: 64 * 1024,
            recovery_retry: Duration::from_secs(5),
        }
    }
}

type WsSink = SplitSink<WebSocket, WsMessage>;
type WsSource = SplitStream<WebSocket>;

/// State shared by every connection task.
struct Gateway {
    registry: Arc<SessionRegistry>,
    broadcast: BroadcastEngine,
    recovery: RecoveryEngine,
    max_message_bytes: usize,
    recovery_retry: Duration,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    log: Arc<dyn MessageLog>,
    stats: Arc<RelayStats>,
    gateway: Arc<Gateway>,
}

impl RelayServer {
    /// Create a server, opening the message log selected by `config`.
    pub fn new(config: ServerConfig) -> Result<Self, RelayError> {
        let log = open_log(config.storage.as_ref())?;
        Self::with_log(config, log)
    }

    /// Create a server around an already opened log. Messages already in
    /// the log are treated as delivered; they reach clients through
    /// recovery.
    pub fn with_log(config: ServerConfig, log: Arc<dyn MessageLog>) -> Result<Self, RelayError> {
        let registry = Arc::new(SessionRegistry::new());
        let order = Arc::new(DeliveryOrder::starting_after(log.last_id()?));
        let stats = Arc::new(RelayStats::new());

        let gateway = Gateway {
            registry: registry.clone(),
            broadcast: BroadcastEngine::new(log.clone(), registry.clone(), order.clone(), stats.clone()),
            recovery: RecoveryEngine::new(log.clone(), registry, order, stats.clone()),
            max_message_bytes: config.max_message_bytes,
            recovery_retry: config.recovery_retry.max(Duration::from_millis(1)),
        };

        Ok(Self {
            config,
            log,
            stats,
            gateway: Arc::new(gateway),
        })
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Server running on {}", listener.local_addr()?);

        let app = Router::new()
            .route("/", get(root))
            .with_state(self.gateway.clone());
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.gateway.registry
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }
}

/// `/`: WebSocket upgrades join the relay, anything else gets the page.
async fn root(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(_) => {
            log::debug!("Serving client page to {addr}");
            return Html(CLIENT_PAGE).into_response();
        }
    };

    let handshake = Handshake::from_query(query.as_deref());
    upgrade.on_upgrade(move |socket| async move {
        if let Err(e) = gateway.handle_connection(socket, addr, handshake).await {
            log::error!("Connection error from {addr}: {e}");
        }
    })
}

impl Gateway {
    async fn handle_connection(
        &self,
        socket: WebSocket,
        addr: SocketAddr,
        handshake: Handshake,
    ) -> Result<(), RelayError> {
        let connection = ConnectionId::new();
        let (outbox, mut outbox_rx) = Outbox::channel();

        log::info!(
            "A user has connected: {} as {:?} from {addr} (offset {})",
            connection,
            handshake.username,
            handshake.server_offset
        );

        let recovered = self.admit(connection, &handshake, outbox).await?;

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let result = self
            .pump(connection, recovered, &mut ws_sender, &mut ws_receiver, &mut outbox_rx)
            .await;

        self.registry.unregister(&connection).await;
        log::info!("A user has disconnected: {connection} ({addr})");

        result
    }

    /// Register the session and replay its backlog before any inbound frame
    /// is read. Returns whether the backlog went out.
    async fn admit(
        &self,
        connection: ConnectionId,
        handshake: &Handshake,
        outbox: Outbox,
    ) -> Result<bool, RelayError> {
        self.registry
            .register(connection, handshake.username.clone(), handshake.server_offset, outbox)
            .await?;
        Ok(self.try_recover(connection).await)
    }

    async fn try_recover(&self, connection: ConnectionId) -> bool {
        match self.recovery.recover(&connection).await {
            Ok(RecoveryOutcome::Replayed { count, through }) => {
                log::debug!("Recovered {connection}: {count} messages through {through}");
                true
            }
            Ok(RecoveryOutcome::AlreadyRecovered) => true,
            Ok(RecoveryOutcome::InProgress) => false,
            Err(e) => {
                log::warn!(
                    "Connection {connection} has no backlog yet, retrying in {:?}: {e}",
                    self.recovery_retry
                );
                false
            }
        }
    }

    /// Shuttle frames until the client goes away.
    async fn pump(
        &self,
        connection: ConnectionId,
        mut recovered: bool,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        outbox_rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Result<(), RelayError> {
        let mut retry = interval_at(Instant::now() + self.recovery_retry, self.recovery_retry);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.on_text(connection, text.as_str()).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                        // Pings are answered by the socket; binary frames are not part of the protocol
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                Some(msg) = outbox_rx.recv() => {
                    let text = ServerEvent::from(&msg).encode()?;
                    ws_sender.send(WsMessage::Text(text.into())).await?;
                }

                _ = retry.tick(), if !recovered => {
                    recovered = self.try_recover(connection).await;
                }
            }
        }
    }

    async fn on_text(&self, connection: ConnectionId, text: &str) {
        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Ignoring frame from {connection}: {e}");
                return;
            }
        };

        match event {
            ClientEvent::ChatMessage(content) => {
                if content.trim().is_empty() {
                    log::debug!("Ignoring empty message from {connection}");
                    return;
                }
                if content.len() > self.max_message_bytes {
                    log::warn!(
                        "Dropping {}-byte message from {connection} (limit {})",
                        content.len(),
                        self.max_message_bytes
                    );
                    return;
                }
                // Failures are logged and counted by the engine
                let _ = self.broadcast.publish(&connection, &content).await;
            }
        }
    }
}
