//! WebSocket Seat Server
//!
//! Each authenticated connection gets its own round engine. The connection
//! task routes client requests to the engine and forwards every published
//! snapshot back to the client. A player holds at most one seat; when the
//! connection ends the seat is retired, settling any bet it still holds.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{ConfigError, Engine, EngineConfig, RoundSnapshot, Services};
use crate::network::auth::{authenticate, AuthConfig};
use crate::network::protocol::{
    AuthRequest, AuthResult, ClientMessage, ErrorCode, PlaceBetRequest, ServerError, ServerMessage,
};
use crate::round::crash::{CrashPointSource, TieredCrashGenerator};
use crate::round::state::PlayerId;

/// Builds the crash point source for each new seat.
pub type CrashSourceFactory = Arc<dyn Fn() -> Box<dyn CrashPointSource> + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close a connection that has not authenticated after this long
    /// without a client message. Seated connections are never idled out.
    pub idle_timeout: Duration,
    /// Server version string.
    pub version: String,
    /// REST ledger base URL. In-memory ledger when unset.
    pub ledger_url: Option<String>,
    /// Token verification.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ledger_url: None,
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CRASH_*` and `CRASH_AUTH_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("CRASH_BIND_ADDR")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("CRASH_MAX_CONNECTIONS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.max_connections),
            idle_timeout: std::env::var("CRASH_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            ledger_url: std::env::var("CRASH_LEDGER_URL").ok().filter(|url| !url.is_empty()),
            auth: AuthConfig::from_env(),
            ..defaults
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Engine settings rejected.
    #[error("Invalid engine config: {0}")]
    Config(#[from] ConfigError),
}

/// Connected client bookkeeping.
struct ConnectedClient {
    player_id: Option<PlayerId>,
    connected_at: Instant,
}

/// What every connection needs to open a seat.
struct SeatContext {
    auth: AuthConfig,
    engine_config: EngineConfig,
    services: Services,
    crash_source: CrashSourceFactory,
    version: String,
    /// Players that currently hold a seat.
    seated: Mutex<BTreeSet<PlayerId>>,
}

impl SeatContext {
    /// Reserve the seat for `player_id`, unless another connection has it.
    fn claim(self: &Arc<Self>, player_id: PlayerId) -> Option<SeatClaim> {
        let mut seated = self.seated.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        seated.insert(player_id).then(|| SeatClaim {
            context: self.clone(),
            player_id,
        })
    }
}

/// A reserved seat, released on drop.
struct SeatClaim {
    context: Arc<SeatContext>,
    player_id: PlayerId,
}

impl Drop for SeatClaim {
    fn drop(&mut self) {
        self.context
            .seated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.player_id);
    }
}

/// The seat server.
pub struct GameServer {
    config: ServerConfig,
    context: Arc<SeatContext>,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server. Engine settings are validated up front.
    pub fn new(
        config: ServerConfig,
        engine_config: EngineConfig,
        services: Services,
    ) -> Result<Self, GameServerError> {
        let entropy: CrashSourceFactory = Arc::new(|| Box::new(TieredCrashGenerator::from_entropy()));
        Self::with_crash_source(config, engine_config, services, entropy)
    }

    /// Create a server whose seats draw crash points from `crash_source`.
    pub fn with_crash_source(
        config: ServerConfig,
        engine_config: EngineConfig,
        services: Services,
        crash_source: CrashSourceFactory,
    ) -> Result<Self, GameServerError> {
        engine_config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let context = Arc::new(SeatContext {
            auth: config.auth.clone(),
            engine_config,
            services,
            crash_source,
            version: config.version.clone(),
            seated: Mutex::new(BTreeSet::new()),
        });

        Ok(Self {
            config,
            context,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    ///
    /// Returns once every connection has retired its seat.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Seat server listening on {}", listener.local_addr()?);
        if !self.context.auth.is_configured() {
            warn!("No auth key configured, accepting client-chosen player ids");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(&mut connections, stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    reap_connection(joined);
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if !connections.is_empty() {
            info!(connections = connections.len(), "Waiting for seats to retire");
        }
        while let Some(joined) = connections.join_next().await {
            reap_connection(joined);
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, connections: &mut JoinSet<()>, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let context = self.context.clone();
        let idle_timeout = self.config.idle_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        connections.spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            clients.write().await.insert(addr, ConnectedClient {
                player_id: None,
                connected_at: Instant::now(),
            });

            let mut sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let mut connection = Connection::new(context, msg_tx.clone());
            let mut sender_done = false;

            loop {
                let seated = connection.player_id().is_some();
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        connection.send(ServerMessage::Error(ServerError::new(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        ))).await;
                                        continue;
                                    }
                                };

                                let flow = connection.handle(client_msg).await;
                                if let Some(player_id) = connection.player_id() {
                                    if let Some(client) = clients.write().await.get_mut(&addr) {
                                        client.player_id = Some(player_id);
                                    }
                                }
                                if flow == Flow::Close {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = tokio::time::sleep(idle_timeout), if !seated => {
                        info!("Closing idle client {}", addr);
                        break;
                    }
                    _ = &mut sender_task => {
                        debug!("Client {} stopped accepting messages", addr);
                        sender_done = true;
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        connection.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            let seat = connection.take_seat();
            if let Some(seat) = &seat {
                seat.forwarder.abort();
            }
            drop(connection);
            drop(msg_tx);
            // Let queued messages drain, then the sender closes the socket.
            if !sender_done {
                let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;
            }
            if let Some(seat) = seat {
                seat.retire().await;
            }

            if let Some(client) = clients.write().await.remove(&addr) {
                debug!(
                    "Client {} held {} for {:?}",
                    addr,
                    client.player_id.map(|id| id.short()).unwrap_or_else(|| "-".into()),
                    client.connected_at.elapsed()
                );
            }
            info!("Client {} cleaned up", addr);
        });
    }

    /// Signal every connection and the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Connections that have opened a seat.
    pub async fn seat_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|client| client.player_id.is_some())
            .count()
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Whether the connection loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// An open seat: the engine, the task forwarding its snapshots, and the
/// claim that keeps the player from opening a second one.
struct Seat {
    engine: Engine,
    forwarder: JoinHandle<()>,
    _claim: SeatClaim,
}

impl Seat {
    /// Stop forwarding, settle the seat's bet, and release the claim.
    async fn retire(self) {
        self.forwarder.abort();
        self.engine.close().await;
        debug!("Seat retired for {}", self.engine.player_id().short());
    }
}

/// Per-connection request routing.
struct Connection {
    context: Arc<SeatContext>,
    sender: mpsc::Sender<ServerMessage>,
    seat: Option<Seat>,
}

impl Connection {
    fn new(context: Arc<SeatContext>, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self { context, sender, seat: None }
    }

    fn player_id(&self) -> Option<PlayerId> {
        self.seat.as_ref().map(|seat| seat.engine.player_id())
    }

    async fn send(&self, msg: ServerMessage) {
        let _ = self.sender.send(msg).await;
    }

    async fn handle(&mut self, msg: ClientMessage) -> Flow {
        match msg {
            ClientMessage::Auth(req) => self.handle_auth(req).await,
            ClientMessage::PlaceBet(req) => self.handle_place_bet(req).await,
            ClientMessage::CashOut => self.handle_cash_out().await,
            ClientMessage::SyncRequest => match &self.seat {
                Some(seat) => self.send(ServerMessage::Snapshot(seat.engine.snapshot())).await,
                None => self.not_authenticated().await,
            },
            ClientMessage::Ping { timestamp } => {
                self.send(ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
                })
                .await;
            }
            ClientMessage::Leave => return Flow::Close,
        }
        Flow::Continue
    }

    async fn handle_auth(&mut self, req: AuthRequest) {
        if self.seat.is_some() {
            self.send(ServerMessage::Error(ServerError::new(
                ErrorCode::AuthFailed,
                "Already authenticated",
            )))
            .await;
            return;
        }

        let account = match authenticate(
            &self.context.auth,
            req.token.as_deref(),
            req.player_id.as_deref(),
        ) {
            Ok(account) => account,
            Err(e) => {
                warn!("Authentication failed: {}", e);
                self.send(ServerMessage::AuthResult(AuthResult {
                    success: false,
                    player_id: None,
                    error: Some(e.to_string()),
                    server_version: self.context.version.clone(),
                }))
                .await;
                self.send(ServerMessage::Error((&e).into())).await;
                return;
            }
        };

        let Some(claim) = self.context.claim(account.player_id) else {
            warn!("Second seat refused for {}", account.player_id.short());
            self.send(ServerMessage::AuthResult(AuthResult {
                success: false,
                player_id: None,
                error: Some("already seated".into()),
                server_version: self.context.version.clone(),
            }))
            .await;
            self.send(ServerMessage::Error(ServerError::new(
                ErrorCode::AuthFailed,
                "Player already seated",
            )))
            .await;
            return;
        };

        let engine = match Engine::start_with_source(
            account.clone(),
            self.context.engine_config.clone(),
            self.context.services.clone(),
            (self.context.crash_source)(),
        ) {
            Ok(engine) => engine,
            Err(e) => {
                error!("Failed to start engine: {}", e);
                self.send(ServerMessage::Error(ServerError::new(
                    ErrorCode::InternalError,
                    "Engine unavailable",
                )))
                .await;
                return;
            }
        };

        self.send(ServerMessage::AuthResult(AuthResult {
            success: true,
            player_id: Some(account.user_id.clone()),
            error: None,
            server_version: self.context.version.clone(),
        }))
        .await;

        let forwarder = tokio::spawn(forward_snapshots(engine.subscribe(), self.sender.clone()));
        debug!("Seat opened for {}", account.player_id.short());
        self.seat = Some(Seat { engine, forwarder, _claim: claim });
    }

    async fn handle_place_bet(&mut self, req: PlaceBetRequest) {
        let Some(seat) = &self.seat else {
            return self.not_authenticated().await;
        };

        let reply = match seat.engine.place_bet(req.amount, req.auto_cashout).await {
            Ok(bet) => ServerMessage::BetPlaced { bet },
            Err(rejection) => ServerMessage::rejection(&rejection),
        };
        self.send(reply).await;
    }

    async fn handle_cash_out(&mut self) {
        let Some(seat) = &self.seat else {
            return self.not_authenticated().await;
        };

        let reply = match seat.engine.cash_out().await {
            Ok(bet) => ServerMessage::CashedOut { bet },
            Err(rejection) => ServerMessage::rejection(&rejection),
        };
        self.send(reply).await;
    }

    async fn not_authenticated(&self) {
        self.send(ServerMessage::Error(ServerError::new(
            ErrorCode::NotAuthenticated,
            "Must authenticate first",
        )))
        .await;
    }

    /// Hand the seat over for retirement.
    fn take_seat(&mut self) -> Option<Seat> {
        self.seat.take()
    }
}

fn reap_connection(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection task panicked: {}", e);
        }
    }
}

/// Push every published snapshot to the client, starting with the current one.
async fn forward_snapshots(mut rx: watch::Receiver<RoundSnapshot>, sender: mpsc::Sender<ServerMessage>) {
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if sender.send(ServerMessage::Snapshot(snapshot)).await.is_err() {
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryLedger;
    use crate::round::crash::ScriptedCrashPoints;
    use crate::round::ledger::BetRejection;
    use crate::round::state::Account;

    const PLAYER: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    fn context() -> (Arc<SeatContext>, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::with_opening_balance(100_000));
        let context = Arc::new(SeatContext {
            auth: AuthConfig::default(),
            engine_config: EngineConfig::default(),
            services: Services::from_ledger(ledger.clone(), Duration::from_secs(2)),
            crash_source: Arc::new(|| Box::new(ScriptedCrashPoints::new(vec![2.0]))),
            version: "test".into(),
            seated: Mutex::new(BTreeSet::new()),
        });
        (context, ledger)
    }

    async fn retire(connection: &mut Connection) {
        if let Some(seat) = connection.take_seat() {
            seat.retire().await;
        }
    }

    fn dev_auth() -> ClientMessage {
        ClientMessage::Auth(AuthRequest {
            token: None,
            player_id: Some(PLAYER.into()),
            client_version: None,
        })
    }

    /// Next non-snapshot message.
    async fn next_reply(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        loop {
            match rx.recv().await.expect("channel open") {
                ServerMessage::Snapshot(_) => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.ledger_url.is_none());
    }

    #[tokio::test]
    async fn test_server_rejects_invalid_engine_config() {
        let ledger = Arc::new(InMemoryLedger::new());
        let services = Services::from_ledger(ledger, Duration::from_secs(1));
        let engine_config = EngineConfig { countdown_secs: 0, ..EngineConfig::default() };
        assert!(matches!(
            GameServer::new(ServerConfig::default(), engine_config, services),
            Err(GameServerError::Config(ConfigError::ZeroCountdown))
        ));
    }

    #[tokio::test]
    async fn test_requests_need_auth() {
        let (context, _) = context();
        let (tx, mut rx) = mpsc::channel(16);
        let mut connection = Connection::new(context, tx);

        assert_eq!(connection.handle(ClientMessage::CashOut).await, Flow::Continue);
        match next_reply(&mut rx).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::NotAuthenticated),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_then_bet() {
        let (context, ledger) = context();
        let (tx, mut rx) = mpsc::channel(64);
        let mut connection = Connection::new(context, tx);

        connection.handle(dev_auth()).await;
        match next_reply(&mut rx).await {
            ServerMessage::AuthResult(result) => {
                assert!(result.success);
                assert_eq!(result.player_id.as_deref(), Some(PLAYER));
            }
            other => panic!("unexpected {:?}", other),
        }

        connection
            .handle(ClientMessage::PlaceBet(PlaceBetRequest { amount: 10_000, auto_cashout: None }))
            .await;
        match next_reply(&mut rx).await {
            ServerMessage::BetPlaced { bet } => assert_eq!(bet.amount, 10_000),
            other => panic!("unexpected {:?}", other),
        }
        let player = Account::new(PLAYER).player_id;
        assert_eq!(ledger.balance(&player), Some(90_000));

        connection
            .handle(ClientMessage::PlaceBet(PlaceBetRequest { amount: 500, auto_cashout: None }))
            .await;
        match next_reply(&mut rx).await {
            ServerMessage::Error(err) => {
                let expected: ServerError = (&BetRejection::BelowMinimum { amount: 500, minimum: 1_000 }).into();
                assert_eq!(err.code, expected.code);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Retiring during countdown refunds the stake
        retire(&mut connection).await;
        assert_eq!(ledger.balance(&player), Some(100_000));
    }

    #[tokio::test]
    async fn test_second_seat_for_same_player_refused() {
        let (context, _) = context();
        let (tx, _rx) = mpsc::channel(64);
        let mut first = Connection::new(context.clone(), tx);
        first.handle(dev_auth()).await;
        assert!(first.player_id().is_some());

        let (tx, mut rx2) = mpsc::channel(64);
        let mut second = Connection::new(context.clone(), tx);
        second.handle(dev_auth()).await;
        match next_reply(&mut rx2).await {
            ServerMessage::AuthResult(result) => assert!(!result.success),
            other => panic!("unexpected {:?}", other),
        }
        match next_reply(&mut rx2).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
            other => panic!("unexpected {:?}", other),
        }
        assert!(second.player_id().is_none());

        // The seat frees up once the first connection retires
        retire(&mut first).await;
        second.handle(dev_auth()).await;
        match next_reply(&mut rx2).await {
            ServerMessage::AuthResult(result) => assert!(result.success),
            other => panic!("unexpected {:?}", other),
        }
        retire(&mut second).await;
    }

    #[tokio::test]
    async fn test_snapshots_forwarded_after_auth() {
        let (context, _) = context();
        let (tx, mut rx) = mpsc::channel(64);
        let mut connection = Connection::new(context, tx);

        connection.handle(dev_auth()).await;
        let mut saw_snapshot = false;
        for _ in 0..3 {
            if let Some(ServerMessage::Snapshot(snap)) = rx.recv().await {
                assert_eq!(snap.countdown_remaining, 10);
                saw_snapshot = true;
                break;
            }
        }
        assert!(saw_snapshot);

        connection.handle(ClientMessage::SyncRequest).await;
        retire(&mut connection).await;
    }

    #[tokio::test]
    async fn test_bad_credentials_rejected() {
        let (context, _) = context();
        let (tx, mut rx) = mpsc::channel(16);
        let mut connection = Connection::new(context, tx);

        connection
            .handle(ClientMessage::Auth(AuthRequest {
                token: None,
                player_id: Some("".into()),
                client_version: None,
            }))
            .await;
        match rx.recv().await {
            Some(ServerMessage::AuthResult(result)) => assert!(!result.success),
            other => panic!("unexpected {:?}", other),
        }
        assert!(connection.player_id().is_none());
    }

    #[tokio::test]
    async fn test_leave_closes() {
        let (context, _) = context();
        let (tx, _rx) = mpsc::channel(16);
        let mut connection = Connection::new(context, tx);
        assert_eq!(connection.handle(ClientMessage::Leave).await, Flow::Close);
    }
}
