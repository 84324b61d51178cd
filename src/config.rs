//! Application configuration
//!
//! Loads configuration from environment variables with sensible defaults.

use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,

    /// HTTP server host (default: 0.0.0.0)
    pub host: String,

    /// HTTP server port
    pub port: u16,

    /// Maximum database connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// SQLite busy timeout in seconds before contended writes fail (default: 5)
    pub db_busy_timeout_secs: u64,

    /// CORS allowed origins (comma-separated; empty allows any origin)
    pub cors_origins: Vec<String>,

    /// Log format: "json" for structured, "pretty" for human-readable (default: pretty)
    pub log_format: String,

    /// Graceful shutdown timeout in seconds (default: 30)
    pub shutdown_timeout_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults for local development if variables are not set.
    pub fn load() -> Self {
        // Load .env file if it exists
        dotenv().ok();

        let cors_origins_str = env::var("CORS_ORIGINS").unwrap_or_default();
        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://attestation.db?mode=rwc".to_string()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("PORT must be a number"),
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .expect("DB_MAX_CONNECTIONS must be a number"),
            db_busy_timeout_secs: env::var("DB_BUSY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .expect("DB_BUSY_TIMEOUT_SECS must be a number"),
            cors_origins,
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            shutdown_timeout_secs: env::var("SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .expect("SHUTDOWN_TIMEOUT_SECS must be a number"),
        }
    }

    /// Creates a default configuration for testing purposes.
    #[cfg(test)]
    pub fn default_for_test() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_max_connections: 1,
            db_busy_timeout_secs: 5,
            cors_origins: vec!["http://localhost:3000".to_string()],
            log_format: "pretty".to_string(),
            shutdown_timeout_secs: 5,
        }
    }
}
