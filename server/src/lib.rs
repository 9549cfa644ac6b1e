//! Authoritative server for a crash-style multiplier game.
//!
//! One process owns the game cycle, the wallet ledger, and the bet ledger.
//! Clients connect over a persistent socket, wager during a betting window,
//! watch the multiplier climb, and cash out before the hidden crash point.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod fairness;
pub mod hex;
pub mod hotbets;
pub mod hub;
pub mod lifecycle;
pub mod money;
pub mod store;
pub mod wire;

pub use config::Config;
pub use engine::{CycleEngine, CycleSnapshot, EngineEvent};
pub use error::{GameError, StoreError};
pub use lifecycle::BetLifecycle;
pub use money::{Amount, Multiplier};
pub use store::{MemoryStore, PgStore, Store};
