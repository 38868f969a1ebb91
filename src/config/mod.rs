//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;

/// Which backend holds the durable match snapshots
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process map, lost on restart (dev and tests)
    Memory,
    /// Supabase/PostgREST table
    Supabase,
}

/// Phase timer durations, in milliseconds
#[derive(Clone, Copy, Debug)]
pub struct PhaseDurations {
    pub night_ms: u64,
    pub day_ms: u64,
    pub vote_ms: u64,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            night_ms: 60_000,
            day_ms: 90_000,
            vote_ms: 60_000,
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Match snapshot store backend
    pub store_backend: StoreBackend,
    /// Supabase project URL (required for the supabase backend)
    pub supabase_url: Option<String>,
    /// Supabase service role key (bypasses RLS - server only!)
    pub supabase_service_role_key: Option<String>,
    /// Supabase JWT secret for token verification
    pub supabase_jwt_secret: String,

    /// Night/day/vote phase timers
    pub phase_durations: PhaseDurations,
    /// Grace period before an ended match is dropped from the registry
    pub retire_grace_secs: u64,

    /// Allowed client origin for CORS
    pub client_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let store_backend = match env::var("MATCH_STORE").as_deref() {
            Ok("supabase") => StoreBackend::Supabase,
            Ok("memory") | Err(_) => StoreBackend::Memory,
            Ok(other) => return Err(ConfigError::UnknownStoreBackend(other.to_string())),
        };

        let supabase_url = env::var("SUPABASE_URL").ok();
        let supabase_service_role_key = env::var("SUPABASE_SERVICE_ROLE_KEY").ok();

        if store_backend == StoreBackend::Supabase
            && (supabase_url.is_none() || supabase_service_role_key.is_none())
        {
            return Err(ConfigError::Missing("SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY"));
        }

        let defaults = PhaseDurations::default();
        let phase_durations = PhaseDurations {
            night_ms: secs_var("NIGHT_SECS")?.map_or(defaults.night_ms, |s| s * 1000),
            day_ms: secs_var("DAY_SECS")?.map_or(defaults.day_ms, |s| s * 1000),
            vote_ms: secs_var("VOTE_SECS")?.map_or(defaults.vote_ms, |s| s * 1000),
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            store_backend,
            supabase_url,
            supabase_service_role_key,
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .map_err(|_| ConfigError::Missing("SUPABASE_JWT_SECRET"))?,

            phase_durations,
            retire_grace_secs: secs_var("RETIRE_GRACE_SECS")?.unwrap_or(300),

            client_origin: env::var("CLIENT_ORIGIN")
                .map_err(|_| ConfigError::Missing("CLIENT_ORIGIN"))?,
        })
    }
}

/// Parse an optional seconds-valued environment variable
fn secs_var(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid numeric value for {0}")]
    InvalidNumber(&'static str),

    #[error("Unknown MATCH_STORE backend: {0}")]
    UnknownStoreBackend(String),
}
