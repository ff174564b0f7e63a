//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{AllocatorError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// SQLite pool size
    pub max_connections: u32,
    /// Extra attempts on write contention before answering 503
    pub max_contention_retries: u32,
    /// Fixed RNG seed for waitlist passes (reproducible runs)
    pub resolver_seed: Option<u64>,
    /// JSON file of problem statements to upsert at startup
    pub problems_seed_path: Option<String>,
    /// Rebuild ledger counts from allocation records at startup
    pub reconcile_on_start: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./allocator.db".to_string()),
            api_port: parse_or("API_PORT", 3001)?,
            max_connections: parse_or("MAX_CONNECTIONS", 5)?,
            max_contention_retries: parse_or("MAX_CONTENTION_RETRIES", 5)?,
            resolver_seed: env_var("RESOLVER_SEED")
                .ok()
                .map(|raw| parse("RESOLVER_SEED", &raw))
                .transpose()?,
            problems_seed_path: env_var("PROBLEMS_SEED_PATH").ok(),
            reconcile_on_start: parse_or("RECONCILE_ON_START", true)?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AllocatorError::Config(format!("Missing env var: {key}")))
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AllocatorError::Config(format!("Invalid {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => parse(key, &raw),
        Err(_) => Ok(default),
    }
}
