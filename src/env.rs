// src/env.rs
// HUTCH_* environment overrides applied on top of the file configuration.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;

use crate::config::HutchConfig;

pub const AMQP_ADDR: &str = "HUTCH_AMQP_ADDR";
pub const RECONNECT_DELAY_MS: &str = "HUTCH_RECONNECT_DELAY_MS";
pub const RECONNECT_STEP_MS: &str = "HUTCH_RECONNECT_STEP_MS";
pub const CONNECT_TIMEOUT_MS: &str = "HUTCH_CONNECT_TIMEOUT_MS";
pub const CONSUMER_WORKERS: &str = "HUTCH_CONSUMER_WORKERS";
pub const PREFETCH_COUNT: &str = "HUTCH_PREFETCH_COUNT";
pub const CONNECTION_NAME: &str = "HUTCH_CONNECTION_NAME";

/// Loads `.env` if present and applies process environment overrides.
pub fn apply_env(config: &mut HutchConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides(config, |key| env::var(key).ok())
}

/// Applies overrides from `lookup`. Unset variables leave the value alone,
/// unparseable ones are an error.
pub fn apply_overrides<F>(config: &mut HutchConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(uri) = lookup(AMQP_ADDR) {
        config.connection.uri = uri;
    }
    if let Some(name) = lookup(CONNECTION_NAME) {
        config.connection.connection_name = Some(name);
    }

    override_parsed(&lookup, RECONNECT_DELAY_MS, &mut config.connection.reconnect_delay_ms)?;
    override_parsed(&lookup, RECONNECT_STEP_MS, &mut config.connection.reconnect_step_ms)?;
    override_parsed(&lookup, CONNECT_TIMEOUT_MS, &mut config.connection.connect_timeout_ms)?;
    override_parsed(&lookup, CONSUMER_WORKERS, &mut config.consumer.workers)?;
    override_parsed(&lookup, PREFETCH_COUNT, &mut config.consumer.prefetch_count)?;

    config.validate()
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = lookup(key) {
        *target = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, value))?;
    }
    Ok(())
}
