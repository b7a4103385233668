//! WebSocket Game Server
//!
//! Accepts player connections, authenticates them, routes bet and cash-out
//! requests to the round engine, and fans round events out to every client.
//! Handlers never change the round phase; only the scheduler does.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{env_duration_ms, env_flag, env_parse};
use crate::core::money::Amount;
use crate::game::engine::RoundEngine;
use crate::game::ledger::Applied;
use crate::game::round::UserId;
use crate::network::auth::{derive_user_id, validate_token, AuthConfig, AuthError};
use crate::network::protocol::{
    AuthRequest, AuthResult, ClientMessage, ErrorCode, HistoryEntry, ServerError, ServerMessage,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close connections silent for this long.
    pub idle_timeout: Duration,
    /// Funds credited to a newly opened account (minor units).
    pub starting_balance: Amount,
    /// Accept a bare user id instead of a JWT when auth is not configured.
    pub allow_guests: bool,
    /// Largest history page.
    pub history_limit: u32,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(120),
            starting_balance: 0,
            allow_guests: false,
            history_limit: 100,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Read `CRASH_BIND_ADDR`, `CRASH_MAX_CONNECTIONS`, `CRASH_IDLE_TIMEOUT_MS`,
    /// `CRASH_STARTING_BALANCE` and `CRASH_ALLOW_GUESTS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_parse("CRASH_BIND_ADDR", d.bind_addr),
            max_connections: env_parse("CRASH_MAX_CONNECTIONS", d.max_connections),
            idle_timeout: env_duration_ms("CRASH_IDLE_TIMEOUT_MS", d.idle_timeout),
            starting_balance: env_parse("CRASH_STARTING_BALANCE", d.starting_balance),
            allow_guests: env_flag("CRASH_ALLOW_GUESTS", d.allow_guests),
            history_limit: d.history_limit,
            version: d.version,
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
}

// =============================================================================
// REQUEST HANDLING
// =============================================================================

/// Per-connection identity.
#[derive(Debug, Default, Clone)]
pub struct ClientSession {
    /// Account, once authenticated.
    pub user_id: Option<UserId>,
    /// Admin rights from the token's role claim.
    pub admin: bool,
}

/// Turns client messages into engine calls and replies.
pub struct Dispatcher {
    engine: Arc<RoundEngine>,
    auth: AuthConfig,
    config: ServerConfig,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(engine: Arc<RoundEngine>, auth: AuthConfig, config: ServerConfig) -> Self {
        Self { engine, auth, config }
    }

    /// Handle one message and produce the reply.
    pub async fn handle(&self, session: &mut ClientSession, msg: ClientMessage) -> ServerMessage {
        match msg {
            ClientMessage::Auth(req) => self.authenticate(session, req).await,
            ClientMessage::Ping { timestamp } => ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
            },
            ClientMessage::Snapshot => ServerMessage::Snapshot { round: self.engine.snapshot().await },
            ClientMessage::History { limit } => self.history(limit).await,
            other => match session.user_id {
                Some(user_id) => self.handle_authenticated(session, user_id, other).await,
                None => ServerMessage::error(ErrorCode::NotAuthenticated, "Must authenticate first"),
            },
        }
    }

    async fn handle_authenticated(
        &self,
        session: &ClientSession,
        user_id: UserId,
        msg: ClientMessage,
    ) -> ServerMessage {
        let ledger = self.engine.ledger();

        match msg {
            ClientMessage::PlaceBet { round_id, amount } => {
                match self.engine.place_bet(round_id, user_id, amount).await {
                    Ok(_) => ServerMessage::BetAccepted {
                        round_id,
                        amount,
                        balance: ledger.balance(&user_id).await.unwrap_or(0),
                    },
                    Err(e) => ServerMessage::Error(ServerError::from(&e)),
                }
            }
            ClientMessage::CashOut { round_id } => match self.engine.cash_out(round_id, user_id).await {
                Ok(multiplier) => ServerMessage::CashedOut { round_id, multiplier },
                Err(e) => ServerMessage::Error(ServerError::from(&e)),
            },
            ClientMessage::Balance => ServerMessage::Balance {
                balance: ledger.balance(&user_id).await.unwrap_or(0),
            },
            ClientMessage::SetEnabled { enabled } if session.admin => {
                self.engine.set_enabled(enabled);
                ServerMessage::GameStatus { enabled: self.engine.is_enabled() }
            }
            ClientMessage::FreezeAccount { user_id: target, frozen } if session.admin => {
                match ledger.set_frozen(target, frozen).await {
                    Ok(()) => {
                        info!("Account {} {} by {}", target.short(), if frozen { "frozen" } else { "unfrozen" }, user_id.short());
                        ServerMessage::AccountStatus { user_id: target, frozen }
                    }
                    Err(e) => ServerMessage::error(ErrorCode::UnknownAccount, e.to_string()),
                }
            }
            ClientMessage::AdjustBalance { user_id: target, amount, reason, adjustment_id } if session.admin => {
                match ledger.adjust(target, amount, adjustment_id, &reason).await {
                    Ok(outcome) => {
                        let applied = matches!(outcome, Applied::Applied(_));
                        if applied {
                            info!("Account {} adjusted by {} ({}) by {}", target.short(), amount, reason, user_id.short());
                        }
                        ServerMessage::BalanceAdjusted { user_id: target, balance: outcome.balance(), applied }
                    }
                    Err(e) => ServerMessage::Error(ServerError::from(&e)),
                }
            }
            ClientMessage::Resettle { round_id } if session.admin => {
                match self.engine.resettle(round_id).await {
                    Ok(report) => ServerMessage::Resettled { round_id, report },
                    Err(e) => {
                        warn!("Resettle of round {} failed: {}", round_id, e);
                        ServerMessage::Error(ServerError::from(&e))
                    }
                }
            }
            ClientMessage::SetEnabled { .. }
            | ClientMessage::FreezeAccount { .. }
            | ClientMessage::AdjustBalance { .. }
            | ClientMessage::Resettle { .. } => {
                ServerMessage::error(ErrorCode::Forbidden, "Admin role required")
            }
            // Handled before authentication
            ClientMessage::Auth(_)
            | ClientMessage::Ping { .. }
            | ClientMessage::Snapshot
            | ClientMessage::History { .. } => {
                ServerMessage::error(ErrorCode::InternalError, "Unexpected message")
            }
        }
    }

    async fn authenticate(&self, session: &mut ClientSession, req: AuthRequest) -> ServerMessage {
        let (user_id, admin) = if self.auth.is_configured() {
            match validate_token(&req.token, &self.auth) {
                Ok(claims) => (claims.user_id(), claims.is_admin()),
                Err(AuthError::Expired) => {
                    return ServerMessage::error(ErrorCode::TokenExpired, "Token expired");
                }
                Err(e) => {
                    debug!("Token rejected: {}", e);
                    return ServerMessage::error(ErrorCode::InvalidToken, e.to_string());
                }
            }
        } else if self.config.allow_guests {
            let user_id = UserId::parse(&req.token).unwrap_or_else(|| derive_user_id(&req.token));
            (user_id, false)
        } else {
            return ServerMessage::error(ErrorCode::AuthFailed, "Authentication not configured");
        };

        let ledger = self.engine.ledger();
        if ledger.open_account(user_id).await && self.config.starting_balance > 0 {
            if let Err(e) = ledger.deposit(user_id, self.config.starting_balance, uuid::Uuid::new_v4()).await {
                warn!("Starting balance for {} failed: {}", user_id.short(), e);
            }
        }

        session.user_id = Some(user_id);
        session.admin = admin;
        debug!("Authenticated {} (admin: {})", user_id.short(), admin);

        ServerMessage::AuthResult(AuthResult {
            success: true,
            user_id: Some(user_id),
            balance: ledger.balance(&user_id).await,
            error: None,
            server_version: self.config.version.clone(),
        })
    }

    async fn history(&self, limit: Option<u32>) -> ServerMessage {
        let limit = limit.unwrap_or(20).min(self.config.history_limit) as usize;
        match self.engine.history(limit).await {
            Ok(records) => ServerMessage::History {
                rounds: records.iter().map(HistoryEntry::from).collect(),
            },
            Err(e) => {
                error!("History lookup failed: {}", e);
                ServerMessage::error(ErrorCode::InternalError, "History unavailable")
            }
        }
    }
}

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Connected client state.
struct ConnectedClient {
    user_id: Option<UserId>,
    connected_at: Instant,
    last_activity: Instant,
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    engine: Arc<RoundEngine>,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server. `shutdown_tx` is shared with the scheduler.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        engine: Arc<RoundEngine>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(engine.clone(), auth, config.clone())),
            config,
            engine,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Run the accept loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Game server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connection_count().await >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                tokio::spawn(reject_overloaded(stream, addr));
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let dispatcher = self.dispatcher.clone();
        let mut events = self.engine.subscribe();
        let idle_timeout = self.config.idle_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(256);

            clients.write().await.insert(addr, ConnectedClient {
                user_id: None,
                connected_at: Instant::now(),
                last_activity: Instant::now(),
            });

            let sender_task = tokio::spawn(async move {
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

            // Round events go to every connection, authenticated or not
            let event_tx = msg_tx.clone();
            let forward_task = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if event_tx.send(ServerMessage::Event(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Client {} lagged, {} events dropped", addr, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            let mut session = ClientSession::default();

            loop {
                tokio::select! {
                    next = tokio::time::timeout(idle_timeout, ws_receiver.next()) => {
                        let client_msg = match next {
                            Err(_) => {
                                debug!("Client {} idle, closing", addr);
                                break;
                            }
                            Ok(Some(Ok(Message::Text(text)))) => {
                                ClientMessage::from_json(&text).map_err(|e| e.to_string())
                            }
                            Ok(Some(Ok(Message::Binary(data)))) => {
                                ClientMessage::from_bytes(&data).map_err(|e| e.to_string())
                            }
                            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Ok(Some(Err(e))) => {
                                debug!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            Ok(Some(Ok(_))) => continue,
                        };

                        let reply = match client_msg {
                            Ok(msg) => dispatcher.handle(&mut session, msg).await,
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                ServerMessage::error(ErrorCode::InvalidInput, "Invalid message format")
                            }
                        };

                        if let Some(client) = clients.write().await.get_mut(&addr) {
                            client.user_id = session.user_id;
                            client.last_activity = Instant::now();
                        }

                        if msg_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            forward_task.abort();
            drop(msg_tx);
            // Let queued replies drain before the socket goes away
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Client {} send queue not drained", addr);
            }

            if let Some(client) = clients.write().await.remove(&addr) {
                debug!(
                    "Client {} ({:?}) cleaned up after {:?}, idle {:?}",
                    addr,
                    client.user_id.map(|u| u.short()),
                    client.connected_at.elapsed(),
                    client.last_activity.elapsed(),
                );
            }
        });
    }
}

/// Tell a client over the connection limit why before closing.
async fn reject_overloaded<S>(stream: S, addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let notice = async {
        let mut ws = accept_async(stream).await?;
        let msg = ServerMessage::error(ErrorCode::ServerOverloaded, "Connection limit reached");
        if let Ok(text) = msg.to_json() {
            ws.send(Message::Text(text)).await?;
        }
        ws.close(None).await
    };

    match tokio::time::timeout(Duration::from_secs(5), notice).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Overload notice to {} failed: {}", addr, e),
        Err(_) => debug!("Overload notice to {} timed out", addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::money::Multiplier;
    use crate::game::engine::EngineConfig;
    use crate::game::ledger::Ledger;
    use crate::game::round::RoundId;
    use crate::game::store::MemoryRoundStore;
    use crate::network::auth::{TokenClaims, ADMIN_ROLE};
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "dispatcher-test-secret-32-bytes!";

    fn engine() -> Arc<RoundEngine> {
        Arc::new(RoundEngine::new(
            EngineConfig::default(),
            Arc::new(ManualClock::new(0)),
            Arc::new(Ledger::new()),
            Arc::new(MemoryRoundStore::default()),
            RoundId::FIRST,
        ))
    }

    fn guest_dispatcher(engine: Arc<RoundEngine>) -> Dispatcher {
        let config = ServerConfig { allow_guests: true, starting_balance: 1000, ..Default::default() };
        Dispatcher::new(engine, AuthConfig::default(), config)
    }

    fn jwt_dispatcher(engine: Arc<RoundEngine>) -> Dispatcher {
        let auth = AuthConfig { secret: Some(SECRET.into()), ..Default::default() };
        Dispatcher::new(engine, auth, ServerConfig { starting_balance: 500, ..Default::default() })
    }

    fn token(sub: &str, role: Option<&str>) -> String {
        let now = chrono::Utc::now().timestamp() as u64;
        let claims = TokenClaims {
            sub: sub.into(),
            exp: now + 600,
            iat: now,
            iss: None,
            aud: None,
            role: role.map(String::from),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn auth(token: &str) -> ClientMessage {
        ClientMessage::Auth(AuthRequest { token: token.into(), client_version: "test".into() })
    }

    fn error_code(msg: &ServerMessage) -> Option<ErrorCode> {
        match msg {
            ServerMessage::Error(e) => Some(e.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_requires_auth() {
        let d = guest_dispatcher(engine());
        let mut session = ClientSession::default();

        let reply = d.handle(&mut session, ClientMessage::Balance).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotAuthenticated));

        // Public queries work without auth
        let reply = d.handle(&mut session, ClientMessage::Snapshot).await;
        assert_eq!(reply, ServerMessage::Snapshot { round: None });
    }

    #[tokio::test]
    async fn test_guest_bet_flow() {
        let engine = engine();
        let d = guest_dispatcher(engine.clone());
        let mut session = ClientSession::default();

        let user = UserId::random();
        match d.handle(&mut session, auth(&user.to_string())).await {
            ServerMessage::AuthResult(result) => {
                assert!(result.success);
                assert_eq!(result.user_id, Some(user));
                assert_eq!(result.balance, Some(1000));
            }
            other => panic!("unexpected reply {:?}", other),
        }

        // Re-auth does not fund the account twice
        d.handle(&mut session, auth(&user.to_string())).await;
        assert_eq!(engine.ledger().balance(&user).await, Some(1000));

        let round_id = engine.open_round(Multiplier::from_hundredths(200), 0).await.unwrap();
        let reply = d.handle(&mut session, ClientMessage::PlaceBet { round_id, amount: 100 }).await;
        assert_eq!(reply, ServerMessage::BetAccepted { round_id, amount: 100, balance: 900 });

        let reply = d.handle(&mut session, ClientMessage::PlaceBet { round_id, amount: 100 }).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::DuplicateBet));

        let reply = d.handle(&mut session, ClientMessage::CashOut { round_id }).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::WrongPhase));

        engine.start_round().await.unwrap();
        let reply = d.handle(&mut session, ClientMessage::CashOut { round_id }).await;
        assert_eq!(reply, ServerMessage::CashedOut { round_id, multiplier: Multiplier::ONE });
    }

    #[tokio::test]
    async fn test_guest_cannot_use_admin_messages() {
        let engine = engine();
        let d = guest_dispatcher(engine.clone());
        let mut session = ClientSession::default();
        d.handle(&mut session, auth("someone")).await;

        let reply = d.handle(&mut session, ClientMessage::SetEnabled { enabled: false }).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::Forbidden));
        assert!(engine.is_enabled());
    }

    #[tokio::test]
    async fn test_guests_refused_without_flag() {
        let d = Dispatcher::new(engine(), AuthConfig::default(), ServerConfig::default());
        let mut session = ClientSession::default();
        let reply = d.handle(&mut session, auth("someone")).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::AuthFailed));
        assert!(session.user_id.is_none());
    }

    #[tokio::test]
    async fn test_jwt_admin_controls() {
        let engine = engine();
        let d = jwt_dispatcher(engine.clone());

        let mut player = ClientSession::default();
        d.handle(&mut player, auth(&token("player-9", None))).await;
        let player_id = player.user_id.unwrap();
        assert_eq!(engine.ledger().balance(&player_id).await, Some(500));

        let mut admin = ClientSession::default();
        d.handle(&mut admin, auth(&token("ops", Some(ADMIN_ROLE)))).await;
        assert!(admin.admin);

        let reply = d.handle(&mut admin, ClientMessage::SetEnabled { enabled: false }).await;
        assert_eq!(reply, ServerMessage::GameStatus { enabled: false });
        assert!(!engine.is_enabled());

        let reply = d.handle(&mut admin, ClientMessage::FreezeAccount { user_id: player_id, frozen: true }).await;
        assert_eq!(reply, ServerMessage::AccountStatus { user_id: player_id, frozen: true });

        let round_id = engine.open_round(Multiplier::from_hundredths(150), 0).await.unwrap();
        let reply = d.handle(&mut player, ClientMessage::PlaceBet { round_id, amount: 100 }).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::AccountFrozen));
        assert_eq!(engine.ledger().balance(&player_id).await, Some(500));
    }

    #[tokio::test]
    async fn test_admin_adjusts_balance_once() {
        let engine = engine();
        let d = jwt_dispatcher(engine.clone());

        let mut player = ClientSession::default();
        d.handle(&mut player, auth(&token("player-3", None))).await;
        let player_id = player.user_id.unwrap();

        let mut admin = ClientSession::default();
        d.handle(&mut admin, auth(&token("ops", Some(ADMIN_ROLE)))).await;

        let topup = ClientMessage::AdjustBalance {
            user_id: player_id,
            amount: 250,
            reason: "promo".into(),
            adjustment_id: uuid::Uuid::from_u128(1),
        };
        let reply = d.handle(&mut admin, topup.clone()).await;
        assert_eq!(reply, ServerMessage::BalanceAdjusted { user_id: player_id, balance: 750, applied: true });

        // Same id again changes nothing
        let reply = d.handle(&mut admin, topup).await;
        assert_eq!(reply, ServerMessage::BalanceAdjusted { user_id: player_id, balance: 750, applied: false });

        let reply = d
            .handle(&mut admin, ClientMessage::AdjustBalance {
                user_id: player_id,
                amount: -100,
                reason: "chargeback".into(),
                adjustment_id: uuid::Uuid::from_u128(2),
            })
            .await;
        assert_eq!(reply, ServerMessage::BalanceAdjusted { user_id: player_id, balance: 650, applied: true });

        let reply = d
            .handle(&mut admin, ClientMessage::AdjustBalance {
                user_id: player_id,
                amount: -10_000,
                reason: "too much".into(),
                adjustment_id: uuid::Uuid::from_u128(3),
            })
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::InsufficientFunds));

        let journal = engine.ledger().journal(&player_id).await;
        assert_eq!(journal.last().and_then(|e| e.memo.as_deref()), Some("chargeback"));

        // Players cannot fund themselves
        let reply = d
            .handle(&mut player, ClientMessage::AdjustBalance {
                user_id: player_id,
                amount: 1_000,
                reason: "gift".into(),
                adjustment_id: uuid::Uuid::from_u128(4),
            })
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::Forbidden));
        assert_eq!(engine.ledger().balance(&player_id).await, Some(650));
    }

    #[tokio::test]
    async fn test_admin_resettles_frozen_payout() {
        let engine = engine();
        let d = jwt_dispatcher(engine.clone());

        let mut player = ClientSession::default();
        d.handle(&mut player, auth(&token("player-4", None))).await;
        let player_id = player.user_id.unwrap();

        let mut admin = ClientSession::default();
        d.handle(&mut admin, auth(&token("ops", Some(ADMIN_ROLE)))).await;

        let round_id = engine.open_round(Multiplier::from_hundredths(200), 0).await.unwrap();
        d.handle(&mut player, ClientMessage::PlaceBet { round_id, amount: 100 }).await;
        engine.start_round().await.unwrap();
        let reply = d.handle(&mut player, ClientMessage::CashOut { round_id }).await;
        assert_eq!(reply, ServerMessage::CashedOut { round_id, multiplier: Multiplier::ONE });

        d.handle(&mut admin, ClientMessage::FreezeAccount { user_id: player_id, frozen: true }).await;
        engine.crash_round().await.unwrap();
        let report = engine.settle_current().await.unwrap();
        engine.archive_current(report.failures).await.unwrap();
        d.handle(&mut admin, ClientMessage::FreezeAccount { user_id: player_id, frozen: false }).await;
        assert_eq!(engine.ledger().balance(&player_id).await, Some(400));

        let reply = d.handle(&mut player, ClientMessage::Resettle { round_id }).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::Forbidden));

        match d.handle(&mut admin, ClientMessage::Resettle { round_id }).await {
            ServerMessage::Resettled { round_id: settled, report } => {
                assert_eq!(settled, round_id);
                assert_eq!((report.won, report.total_paid), (1, 100));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(engine.ledger().balance(&player_id).await, Some(500));

        let reply = d.handle(&mut admin, ClientMessage::Resettle { round_id: RoundId(9) }).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::UnknownRound));
    }

    #[tokio::test]
    async fn test_overloaded_client_told_before_close() {
        let (client, server) = tokio::io::duplex(4096);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let rejecter = tokio::spawn(reject_overloaded(server, addr));

        let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/", client).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let msg = ServerMessage::from_json(&text).unwrap();
                assert_eq!(error_code(&msg), Some(ErrorCode::ServerOverloaded));
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(ws.next().await, Some(Ok(Message::Close(_)))));
        rejecter.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_token() {
        let d = jwt_dispatcher(engine());
        let mut session = ClientSession::default();
        let reply = d.handle(&mut session, auth("not-a-jwt")).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::InvalidToken));
    }

    #[tokio::test]
    async fn test_history_reply() {
        let engine = engine();
        for point in [110, 340] {
            engine.open_round(Multiplier::from_hundredths(point), 0).await.unwrap();
            engine.start_round().await.unwrap();
            engine.crash_round().await.unwrap();
            engine.settle_current().await.unwrap();
            engine.archive_current(vec![]).await.unwrap();
        }

        let d = guest_dispatcher(engine);
        let mut session = ClientSession::default();
        match d.handle(&mut session, ClientMessage::History { limit: Some(1) }).await {
            ServerMessage::History { rounds } => {
                assert_eq!(rounds.len(), 1);
                assert_eq!(rounds[0].round_id, RoundId(2));
                assert_eq!(rounds[0].crash_point, Multiplier::from_hundredths(340));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
