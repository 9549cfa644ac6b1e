//! Process configuration, read once from the environment at startup.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::money::Amount;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub betting_ms: u64,
    pub tick_ms: u64,
    pub crash_display_ms: u64,
    pub min_bet: Amount,
    pub max_bet: Amount,
    pub bet_limit_per_cycle: usize,
    pub currency: String,
    pub database_url: Option<String>,
    pub auth_secret: String,
    pub db_timeout: Duration,
    pub require_cashout_token: bool,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let cfg = Config {
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:4000"),
            betting_ms: env_parse("BETTING_MS", 5_000)?,
            tick_ms: env_parse("TICK_MS", 100)?,
            crash_display_ms: env_parse("CRASH_DISPLAY_MS", 3_000)?,
            min_bet: env_amount("MIN_BET", 1.0)?,
            max_bet: env_amount("MAX_BET", 10_000.0)?,
            bet_limit_per_cycle: env_parse("BET_LIMIT_PER_CYCLE", 2)?,
            currency: env_or("CURRENCY", "KSH"),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            auth_secret: env::var("AUTH_SECRET").context("AUTH_SECRET must be set")?,
            db_timeout: Duration::from_millis(env_parse("DB_TIMEOUT_MS", 15_000)?),
            require_cashout_token: env_parse("REQUIRE_CASHOUT_TOKEN", false)?,
        };
        if cfg.tick_ms == 0 {
            bail!("TICK_MS must be positive");
        }
        if cfg.min_bet > cfg.max_bet {
            bail!("MIN_BET exceeds MAX_BET");
        }
        Ok(cfg)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_amount(key: &str, default: f64) -> Result<Amount> {
    match env::var(key) {
        Ok(raw) => {
            let value: f64 = raw.parse().with_context(|| format!("invalid {key}: {raw}"))?;
            Amount::try_from_major(value).with_context(|| format!("invalid {key}: {raw}"))
        }
        Err(_) => Amount::try_from_major(default).with_context(|| format!("bad default for {key}")),
    }
}
