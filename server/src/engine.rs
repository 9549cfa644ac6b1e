//! Game cycle engine.
//!
//! A single task drives betting → flying → crashed → completed and owns
//! every cycle-row and hot-bet-index mutation. State flows out one way: a
//! watch channel carries the read-only snapshot, and an event channel
//! carries phase/tick events for the hub to translate onto the wire.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::OsRng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::fairness;
use crate::hex;
use crate::lifecycle::BetLifecycle;
use crate::money::Multiplier;
use crate::store::{CycleId, CycleRecord, CycleState, Store};

/// Activation attempts at the lock edge before the cycle is aborted.
const LOCK_ATTEMPTS: u32 = 3;
/// Countdown broadcast interval during betting.
const COUNTDOWN_STEP_MS: u64 = 1_000;

/// Read-only view of the engine's current state, published after every
/// transition and tick.
#[derive(Debug, Clone)]
pub struct CycleSnapshot {
    pub cycle_id: Option<CycleId>,
    pub state: CycleState,
    pub multiplier: Multiplier,
    pub crash_point: Option<Multiplier>,
    pub countdown_ms: Option<u64>,
}

impl Default for CycleSnapshot {
    fn default() -> Self {
        CycleSnapshot {
            cycle_id: None,
            state: CycleState::Completed,
            multiplier: Multiplier::ONE,
            crash_point: None,
            countdown_ms: None,
        }
    }
}

/// One-way traffic from the engine to the session hub.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PhaseChanged(CycleSnapshot),
    Tick(CycleSnapshot),
    Crashed(CycleSnapshot),
}

pub struct CycleEngine {
    store: Arc<dyn Store>,
    lifecycle: Arc<BetLifecycle>,
    cfg: Arc<Config>,
    snapshot_tx: watch::Sender<CycleSnapshot>,
    events: mpsc::UnboundedSender<EngineEvent>,
    shutdown: watch::Receiver<bool>,
}

impl CycleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: Arc<BetLifecycle>,
        cfg: Arc<Config>,
        snapshot_tx: watch::Sender<CycleSnapshot>,
        events: mpsc::UnboundedSender<EngineEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        CycleEngine {
            store,
            lifecycle,
            cfg,
            snapshot_tx,
            events,
            shutdown,
        }
    }

    /// Drive cycles until shutdown. A store failure here is fatal; the
    /// caller exits non-zero and restart recovery voids the open cycle.
    pub async fn run(mut self) -> Result<(), StoreError> {
        info!("cycle engine started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if !self.run_cycle().await? {
                break;
            }
        }
        info!("cycle engine stopped");
        Ok(())
    }

    /// One full cycle. Ok(false) means shutdown was requested mid-cycle.
    async fn run_cycle(&mut self) -> Result<bool, StoreError> {
        // open
        let created_at = Utc::now();
        let draw = fairness::draw_crash_point(&mut OsRng, created_at.timestamp_millis());
        let cycle = CycleRecord {
            id: Uuid::new_v4(),
            state: CycleState::Betting,
            seed_hex: hex::encode(&draw.seed),
            hash_hex: hex::encode(&draw.hash),
            crash_point: None,
            created_at,
            flew_at: None,
            ended_at: None,
        };
        self.store.insert_cycle(&cycle).await?;
        info!(cycle = %cycle.id, "betting open");
        self.publish(
            EngineEvent::PhaseChanged,
            self.betting_snapshot(cycle.id, self.cfg.betting_ms),
        );
        if !self.betting_window(cycle.id).await {
            return Ok(false);
        }

        // lock
        let mut activated = None;
        for attempt in 1..=LOCK_ATTEMPTS {
            match self.store.activate_pending(cycle.id, Utc::now()).await {
                Ok(rows) => {
                    activated = Some(rows);
                    break;
                }
                Err(err) => {
                    warn!(cycle = %cycle.id, attempt, error = %err, "cycle lock failed");
                    if attempt < LOCK_ATTEMPTS {
                        // Re-open the betting window and try again.
                        self.publish(
                            EngineEvent::PhaseChanged,
                            self.betting_snapshot(cycle.id, self.cfg.betting_ms),
                        );
                        if !self.betting_window(cycle.id).await {
                            return Ok(false);
                        }
                    }
                }
            }
        }
        let Some(rows) = activated else {
            error!(cycle = %cycle.id, "aborting cycle after repeated lock failures");
            self.lifecycle.abort_cycle(cycle.id).await;
            return Ok(true);
        };
        self.lifecycle.hydrate(cycle.id, &rows);

        // flying
        debug!(cycle = %cycle.id, crash_point = %draw.crash_point, bets = rows.len(), "flying");
        self.publish(
            EngineEvent::PhaseChanged,
            self.flying_snapshot(cycle.id, Multiplier::ONE),
        );
        let crash_target = draw.crash_point.to_major();
        let mut multiplier = 1.0f64;
        let mut last_tick = Instant::now();
        loop {
            if !self.pause(Duration::from_millis(self.cfg.tick_ms)).await {
                return Ok(false);
            }
            let now = Instant::now();
            let elapsed_ms = now.duration_since(last_tick).as_millis() as u64;
            last_tick = now;
            multiplier = fairness::advance_multiplier(multiplier, elapsed_ms);
            if multiplier >= crash_target {
                break;
            }
            let quantised = Multiplier::from_major_floor(multiplier);
            self.publish(EngineEvent::Tick, self.flying_snapshot(cycle.id, quantised));
            // Inline sweep: settlement for this tick is done before the
            // next tick is emitted.
            self.lifecycle.sweep(quantised).await;
        }

        // crash
        let ended_at = Utc::now();
        self.lifecycle.settle_losses(ended_at).await;
        self.store.finish_cycle(cycle.id, draw.crash_point, ended_at).await?;
        info!(cycle = %cycle.id, crash_point = %draw.crash_point, "crashed");
        self.publish(
            EngineEvent::Crashed,
            self.crashed_snapshot(cycle.id, draw.crash_point),
        );
        let keep_running = self
            .pause(Duration::from_millis(self.cfg.crash_display_ms))
            .await;

        // close
        self.lifecycle.clear();
        self.store.complete_cycle(cycle.id).await?;
        Ok(keep_running)
    }

    /// Betting countdown at 1 Hz. Returns false on shutdown.
    async fn betting_window(&mut self, cycle: CycleId) -> bool {
        let mut remaining = self.cfg.betting_ms;
        while remaining > 0 {
            let step = remaining.min(COUNTDOWN_STEP_MS);
            if !self.pause(Duration::from_millis(step)).await {
                return false;
            }
            remaining -= step;
            if remaining > 0 {
                self.publish(EngineEvent::Tick, self.betting_snapshot(cycle, remaining));
            }
        }
        true
    }

    fn betting_snapshot(&self, cycle: CycleId, countdown_ms: u64) -> CycleSnapshot {
        CycleSnapshot {
            cycle_id: Some(cycle),
            state: CycleState::Betting,
            multiplier: Multiplier::ONE,
            crash_point: None,
            countdown_ms: Some(countdown_ms),
        }
    }

    fn flying_snapshot(&self, cycle: CycleId, multiplier: Multiplier) -> CycleSnapshot {
        CycleSnapshot {
            cycle_id: Some(cycle),
            state: CycleState::Flying,
            multiplier,
            crash_point: None,
            countdown_ms: None,
        }
    }

    fn crashed_snapshot(&self, cycle: CycleId, crash_point: Multiplier) -> CycleSnapshot {
        CycleSnapshot {
            cycle_id: Some(cycle),
            state: CycleState::Crashed,
            multiplier: crash_point,
            crash_point: Some(crash_point),
            countdown_ms: None,
        }
    }

    fn publish(&self, wrap: fn(CycleSnapshot) -> EngineEvent, snapshot: CycleSnapshot) {
        self.snapshot_tx.send_replace(snapshot.clone());
        let _ = self.events.send(wrap(snapshot));
    }

    /// Sleep, interruptible by shutdown. Returns false when shutting down.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            changed = self.shutdown.changed() => match changed {
                Ok(()) => !*self.shutdown.borrow(),
                Err(_) => false,
            },
        }
    }
}
