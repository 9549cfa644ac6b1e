//! Composition root: configuration, storage selection, restart recovery,
//! engine and hub wiring, and the accept loop. Exits 0 on clean shutdown,
//! 1 when the database stays unreachable or the engine dies.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crash_server::auth::AuthGate;
use crash_server::engine::{CycleEngine, CycleSnapshot, EngineEvent};
use crash_server::hub::{self, Hub, SessionDeps};
use crash_server::lifecycle::BetLifecycle;
use crash_server::store::{recover_unfinished, MemoryStore, PgStore, Store};
use crash_server::wire::{self, ServerEvent};
use crash_server::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = Arc::new(Config::from_env()?);

    let store: Arc<dyn Store> = match &cfg.database_url {
        Some(dsn) => Arc::new(
            PgStore::connect(dsn)
                .await
                .context("database unavailable after retries")?,
        ),
        None => {
            warn!("DATABASE_URL not set; using the volatile in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let voided = recover_unfinished(store.as_ref())
        .await
        .context("restart recovery failed")?;
    if let Some(cycle) = voided {
        warn!(cycle = %cycle, "voided unfinished cycle from previous run");
    }

    let hub = Arc::new(Hub::new());
    let (snapshot_tx, snapshot_rx) = watch::channel(CycleSnapshot::default());
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lifecycle = Arc::new(BetLifecycle::new(
        store.clone(),
        hub.clone(),
        cfg.clone(),
        snapshot_rx.clone(),
    ));
    let engine = CycleEngine::new(
        store.clone(),
        lifecycle.clone(),
        cfg.clone(),
        snapshot_tx,
        event_tx,
        shutdown_rx.clone(),
    );

    tokio::spawn(pump_engine_events(event_rx, hub.clone()));
    let mut engine_task = tokio::spawn(engine.run());

    if let Some(cycle_id) = voided {
        hub.broadcast(ServerEvent::CycleVoided { cycle_id });
    }

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("cannot bind {}", cfg.listen_addr))?;
    info!(addr = %cfg.listen_addr, "listening");

    let deps = Arc::new(SessionDeps {
        hub: hub.clone(),
        lifecycle,
        store,
        gate: Arc::new(AuthGate::new(cfg.auth_secret.as_bytes().to_vec())),
        snapshot: snapshot_rx,
        cfg: cfg.clone(),
    });
    tokio::spawn(hub::serve(listener, deps, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
        finished = &mut engine_task => {
            // The engine only returns on shutdown; anything else is fatal.
            match finished {
                Ok(Ok(())) => bail!("cycle engine exited unexpectedly"),
                Ok(Err(err)) => {
                    error!(error = %err, "cycle engine failed");
                    bail!("cycle engine failed: {err}");
                }
                Err(err) => bail!("cycle engine panicked: {err}"),
            }
        }
    }

    let _ = engine_task.await;
    info!("shutdown complete");
    Ok(())
}

/// Translate engine events into wire broadcasts.
async fn pump_engine_events(mut events: mpsc::UnboundedReceiver<EngineEvent>, hub: Arc<Hub>) {
    while let Some(event) = events.recv().await {
        let snapshot = match event {
            EngineEvent::PhaseChanged(snapshot)
            | EngineEvent::Tick(snapshot)
            | EngineEvent::Crashed(snapshot) => snapshot,
        };
        if let Some(state) = wire::game_state(&snapshot) {
            hub.broadcast(state);
        }
    }
}
