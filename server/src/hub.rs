//! Session hub: authenticated connections, per-user rooms, broadcast and
//! targeted delivery.
//!
//! Phase and multiplier events ride a bounded broadcast channel; a lagging
//! connection skips the oldest ticks instead of stalling the engine. Acks
//! and per-user events ride an unbounded queue per connection, and the
//! writer drains that queue first so acknowledgements beat later ticks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::auth::AuthGate;
use crate::config::Config;
use crate::engine::CycleSnapshot;
use crate::error::GameError;
use crate::lifecycle::BetLifecycle;
use crate::store::{Store, UserId};
use crate::wire::{self, CashOutData, ClientEnvelope, Handshake, PlaceBetData, ServerEvent};

/// High-water mark for queued broadcast events per connection.
const BROADCAST_CAPACITY: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct Conn {
    id: u64,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

pub struct Hub {
    broadcast_tx: broadcast::Sender<ServerEvent>,
    rooms: StdRwLock<HashMap<UserId, Vec<Conn>>>,
    next_conn_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Hub::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Hub {
            broadcast_tx,
            rooms: StdRwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Best-effort fan-out to every connection.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.broadcast_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Deliver to every connection in the user's room.
    pub fn send_to_user(&self, user: UserId, event: ServerEvent) {
        let rooms = self.rooms.read().unwrap_or_else(|err| err.into_inner());
        if let Some(conns) = rooms.get(&user) {
            for conn in conns {
                let _ = conn.tx.send(event.clone());
            }
        }
    }

    pub fn join(&self, user: UserId, tx: mpsc::UnboundedSender<ServerEvent>) -> u64 {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.rooms.write().unwrap_or_else(|err| err.into_inner());
        rooms.entry(user).or_default().push(Conn { id, tx });
        id
    }

    pub fn leave(&self, user: UserId, conn_id: u64) {
        let mut rooms = self.rooms.write().unwrap_or_else(|err| err.into_inner());
        if let Some(conns) = rooms.get_mut(&user) {
            conns.retain(|conn| conn.id != conn_id);
            if conns.is_empty() {
                rooms.remove(&user);
            }
        }
    }
}

/// Everything a connection task needs.
pub struct SessionDeps {
    pub hub: Arc<Hub>,
    pub lifecycle: Arc<BetLifecycle>,
    pub store: Arc<dyn Store>,
    pub gate: Arc<AuthGate>,
    pub snapshot: watch::Receiver<CycleSnapshot>,
    pub cfg: Arc<Config>,
}

/// Accept loop; one task per connection.
pub async fn serve(
    listener: TcpListener,
    deps: Arc<SessionDeps>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let deps = deps.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, deps).await;
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }
    info!("listener closed");
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, deps: Arc<SessionDeps>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Handshake: first frame must be {"auth":{"token":...}}.
    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        _ => {
            debug!(%peer, "handshake timed out or closed");
            return;
        }
    };
    let claims = serde_json::from_str::<Handshake>(&first)
        .ok()
        .and_then(|handshake| deps.gate.verify(&handshake.auth.token).ok());
    let Some(claims) = claims else {
        let _ = write_event(
            &mut write_half,
            &ServerEvent::AuthFailed {
                error: GameError::Unauthorised.code(),
            },
        )
        .await;
        return;
    };
    let user = claims.user_id;
    info!(%peer, %user, "connection authenticated");
    if write_event(&mut write_half, &ServerEvent::AuthOk { user_id: user })
        .await
        .is_err()
    {
        return;
    }

    // State replay: current cycle, wallet balance, live cash-out handles.
    let snap = deps.snapshot.borrow().clone();
    if let Some(state) = wire::game_state(&snap) {
        if write_event(&mut write_half, &state).await.is_err() {
            return;
        }
    }
    match deps.store.balance_of(user).await {
        Ok(balance) => {
            let _ = write_event(
                &mut write_half,
                &ServerEvent::WalletUpdate {
                    balance,
                    currency: deps.cfg.currency.clone(),
                    cause: "snapshot",
                    correlation_id: None,
                },
            )
            .await;
        }
        Err(err) => warn!(%user, error = %err, "balance lookup failed on connect"),
    }
    for (bet_id, token) in deps.lifecycle.active_bets_for(user) {
        let _ = write_event(&mut write_half, &ServerEvent::ActivateCashout { bet_id, token }).await;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let ack_tx = tx.clone();
    let conn_id = deps.hub.join(user, tx);
    let broadcast_rx = deps.hub.subscribe();
    let writer = tokio::spawn(write_loop(write_half, rx, broadcast_rx));

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ClientEnvelope>(line) {
            Ok(envelope) => dispatch(&deps, user, envelope, &ack_tx).await,
            Err(err) => debug!(%peer, error = %err, "unparseable frame"),
        }
    }

    deps.hub.leave(user, conn_id);
    writer.abort();
    debug!(%peer, %user, "connection closed");
}

async fn dispatch(
    deps: &SessionDeps,
    user: UserId,
    envelope: ClientEnvelope,
    ack_tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    match envelope.event.as_str() {
        "placeBet" => {
            let ack = match serde_json::from_value::<PlaceBetData>(envelope.data) {
                Ok(data) => {
                    match deps
                        .lifecycle
                        .place_bet(user, data.amount, data.auto_cashout_multiplier)
                        .await
                    {
                        Ok(bet_id) => ServerEvent::PlaceBetAck {
                            success: true,
                            bet_id: Some(bet_id),
                            error: None,
                        },
                        Err(err) => ServerEvent::PlaceBetAck {
                            success: false,
                            bet_id: None,
                            error: Some(err.code()),
                        },
                    }
                }
                // A type-mangled stake is rejected like an illegal one.
                Err(_) => ServerEvent::PlaceBetAck {
                    success: false,
                    bet_id: None,
                    error: Some(GameError::StakeOutOfRange.code()),
                },
            };
            let _ = ack_tx.send(ack);
        }
        "cashOut" => {
            let ack = match serde_json::from_value::<CashOutData>(envelope.data) {
                Ok(data) => {
                    match deps
                        .lifecycle
                        .cash_out(user, data.bet_id, data.token.as_deref())
                        .await
                    {
                        Ok(receipt) => ServerEvent::CashOutAck {
                            success: true,
                            payout: Some(receipt.payout),
                            new_balance: Some(receipt.new_balance),
                            error: None,
                        },
                        Err(err) => {
                            deps.hub.send_to_user(
                                user,
                                ServerEvent::CashoutError {
                                    bet_id: data.bet_id,
                                    error: err.code(),
                                },
                            );
                            ServerEvent::CashOutAck {
                                success: false,
                                payout: None,
                                new_balance: None,
                                error: Some(err.code()),
                            }
                        }
                    }
                }
                Err(_) => ServerEvent::CashOutAck {
                    success: false,
                    payout: None,
                    new_balance: None,
                    error: Some(GameError::NotActive.code()),
                },
            };
            let _ = ack_tx.send(ack);
        }
        other => debug!(event = other, "unknown client event"),
    }
}

async fn write_event(writer: &mut OwnedWriteHalf, event: &ServerEvent) -> std::io::Result<()> {
    let mut line = serde_json::to_string(event)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut private: mpsc::UnboundedReceiver<ServerEvent>,
    mut broadcast_rx: broadcast::Receiver<ServerEvent>,
) {
    loop {
        let event = tokio::select! {
            // Acks and targeted events drain before queued broadcast
            // traffic from the same tick.
            biased;
            private_event = private.recv() => match private_event {
                Some(event) => event,
                None => break,
            },
            broadcast_event = broadcast_rx.recv() => match broadcast_event {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "dropped stale ticks for slow connection");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        if write_event(&mut writer, &event).await.is_err() {
            break;
        }
    }
}
