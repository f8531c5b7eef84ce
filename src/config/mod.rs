//! Configuration module for SugarBox.
//!
//! All configuration is loaded from environment variables with sensible defaults.
//! Server settings and device settings share one struct; each side reads what it needs.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the server SQLite database file
    pub db_path: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Lifetime of access tokens
    pub access_token_ttl: Duration,
    /// Lifetime of refresh tokens
    pub refresh_token_ttl: Duration,
    /// Register new accounts with the restricted role
    pub registered_users_limited: bool,
    /// bcrypt cost factor for password hashes
    pub password_hash_cost: u32,
    /// Base URL of the sync server, as seen from the device
    pub server_url: String,
    /// Path to the device store
    pub store_path: PathBuf,
    /// Timeout of a single request to the sync server
    pub request_timeout: Duration,
    /// Delay before dependents of an archived record are committed
    pub archive_grace: Duration,
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let db_path = env::var("SUGARBOX_DB_PATH")
            .unwrap_or_else(|_| "./data/server.sqlite".to_string())
            .into();

        let bind_addr = env::var("SUGARBOX_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .expect("Invalid SUGARBOX_BIND_ADDR format");

        let log_level = env::var("SUGARBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let access_token_ttl =
            Duration::from_secs(parse_or("SUGARBOX_ACCESS_TOKEN_TTL_SECS", 10 * 60));
        let refresh_token_ttl =
            Duration::from_secs(parse_or("SUGARBOX_REFRESH_TOKEN_TTL_SECS", 60 * 24 * 60 * 60));
        let registered_users_limited = parse_or("SUGARBOX_REGISTERED_USERS_LIMITED", false);
        let password_hash_cost = parse_or("SUGARBOX_PASSWORD_HASH_COST", bcrypt::DEFAULT_COST);

        let server_url = env::var("SUGARBOX_SERVER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());

        let store_path = env::var("SUGARBOX_STORE_PATH")
            .unwrap_or_else(|_| "./data/device.sqlite".to_string())
            .into();

        let request_timeout = Duration::from_secs(parse_or("SUGARBOX_REQUEST_TIMEOUT_SECS", 30));
        let archive_grace = Duration::from_millis(parse_or("SUGARBOX_ARCHIVE_GRACE_MS", 2750));

        Self {
            db_path,
            bind_addr,
            log_level,
            access_token_ttl,
            refresh_token_ttl,
            registered_users_limited,
            password_hash_cost,
            server_url,
            store_path,
            request_timeout,
            archive_grace,
        }
    }
}
