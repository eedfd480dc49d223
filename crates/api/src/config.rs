//! Configuration loaded from environment variables.
//!
//! Every value has a default suitable for local development except
//! `DATABASE_URL`. Values that are present but unparsable are reported as
//! [`ConfigError`] at startup instead of silently falling back.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crackq_core::engine_output::DEFAULT_BLOCK_DELIMITER;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Reads variables through a lookup function so tests need not touch the
/// process environment.
struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, var: &'static str, default: &str) -> String {
        (self.lookup)(var).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn positive_millis(&self, var: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parse(var, default_ms)?;
        if ms == 0 {
            return Err(ConfigError::Invalid {
                var,
                value: ms.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(Duration::from_millis(ms))
    }

    fn positive_secs(&self, var: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
        let secs: u64 = self.parse(var, default_secs)?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                var,
                value: secs.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long post-shutdown cleanup may wait for lane workers (default: `30`).
    pub shutdown_timeout_secs: u64,
    pub database_url: String,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Where the engine and converter live and how runs are bounded.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub engine_bin: PathBuf,
    /// Runtime ceiling passed to the engine itself.
    pub max_runtime_secs: u64,
    pub status_timer_secs: u64,
    /// Separator between status blocks on the engine's stdout.
    pub block_delimiter: String,
    /// Output and state files are written here.
    pub work_dir: PathBuf,
    /// Raw captures and converted hash inputs.
    pub capture_dir: PathBuf,
    /// Wordlists.
    pub dictionary_dir: PathBuf,
    pub converter_bin: PathBuf,
    /// How often the supervisor re-reads the job status for cancellation.
    pub cancel_poll: Duration,
    /// Wait between SIGTERM and SIGKILL when stopping the engine.
    pub terminate_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_bin: PathBuf::from("hashcat"),
            max_runtime_secs: 3600,
            status_timer_secs: 5,
            block_delimiter: DEFAULT_BLOCK_DELIMITER.to_string(),
            work_dir: PathBuf::from("./data/work"),
            capture_dir: PathBuf::from("./data/captures"),
            dictionary_dir: PathBuf::from("./data/dictionaries"),
            converter_bin: PathBuf::from("hcxpcapngtool"),
            cancel_poll: Duration::from_millis(1000),
            terminate_grace: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Throttle / lanes / websocket
// ---------------------------------------------------------------------------

/// Dual-rate progress throttling intervals.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub persist_interval: Duration,
    pub broadcast_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_millis(5000),
            broadcast_interval: Duration::from_millis(1500),
        }
    }
}

/// Per-lane parallelism and queue polling.
#[derive(Debug, Clone, Copy)]
pub struct LaneConfig {
    /// Always 1: the engine is a single-slot resource.
    pub attack_concurrency: usize,
    pub capture_concurrency: usize,
    pub dictionary_concurrency: usize,
    pub poll_interval: Duration,
    /// Re-queue delay for jobs waiting on dependencies.
    pub dependency_retry: Duration,
    /// Validity of a queue claim between renewals. An item whose holder
    /// stops renewing is claimable again once this lapses.
    pub lease: Duration,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            attack_concurrency: 1,
            capture_concurrency: 2,
            dictionary_concurrency: 3,
            poll_interval: Duration::from_millis(1000),
            dependency_retry: Duration::from_secs(30),
            lease: Duration::from_secs(60),
        }
    }
}

/// WebSocket liveness settings.
#[derive(Debug, Clone, Copy)]
pub struct WsConfig {
    pub heartbeat_interval: Duration,
    /// A connection silent for longer than this is closed.
    pub timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub throttle: ThrottleConfig,
    pub lanes: LaneConfig,
    pub ws: WsConfig,
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                           | Default                 |
    /// |-----------------------------------|-------------------------|
    /// | `HOST`                            | `0.0.0.0`               |
    /// | `PORT`                            | `3000`                  |
    /// | `CORS_ORIGINS`                    | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`            | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`           | `30`                    |
    /// | `DATABASE_URL`                    | required                |
    /// | `ENGINE_BIN`                      | `hashcat`               |
    /// | `ENGINE_MAX_RUNTIME_SECS`         | `3600`                  |
    /// | `ENGINE_STATUS_TIMER_SECS`        | `5`                     |
    /// | `ENGINE_BLOCK_DELIMITER`          | blank line              |
    /// | `ENGINE_WORK_DIR`                 | `./data/work`           |
    /// | `CAPTURE_DIR`                     | `./data/captures`       |
    /// | `DICTIONARY_DIR`                  | `./data/dictionaries`   |
    /// | `CONVERTER_BIN`                   | `hcxpcapngtool`         |
    /// | `CANCEL_POLL_MS`                  | `1000`                  |
    /// | `TERMINATE_GRACE_SECS`            | `5`                     |
    /// | `PROGRESS_PERSIST_INTERVAL_MS`    | `5000`                  |
    /// | `PROGRESS_BROADCAST_INTERVAL_MS`  | `1500`                  |
    /// | `ATTACK_CONCURRENCY`              | `1` (forced)            |
    /// | `CAPTURE_CONCURRENCY`             | `2`                     |
    /// | `DICTIONARY_CONCURRENCY`          | `3`                     |
    /// | `QUEUE_POLL_MS`                   | `1000`                  |
    /// | `DEPENDENCY_RETRY_SECS`           | `30`                    |
    /// | `QUEUE_LEASE_SECS`                | `60`                    |
    /// | `WS_HEARTBEAT_SECS`               | `30`                    |
    /// | `WS_TIMEOUT_SECS`                 | `60`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let cors_origins: Vec<String> = env
            .string("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for origin in &cors_origins {
            if let Err(e) = origin.parse::<axum::http::HeaderValue>() {
                return Err(ConfigError::Invalid {
                    var: "CORS_ORIGINS",
                    value: origin.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let server = ServerConfig {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 3000)?,
            cors_origins,
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECS", 30)?,
            shutdown_timeout_secs: env.parse("SHUTDOWN_TIMEOUT_SECS", 30)?,
            database_url: (env.lookup)("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            engine_bin: env.parse("ENGINE_BIN", defaults.engine_bin)?,
            max_runtime_secs: env.parse("ENGINE_MAX_RUNTIME_SECS", defaults.max_runtime_secs)?,
            status_timer_secs: env.parse("ENGINE_STATUS_TIMER_SECS", defaults.status_timer_secs)?,
            block_delimiter: (env.lookup)("ENGINE_BLOCK_DELIMITER")
                .map(|d| unescape(&d))
                .filter(|d| !d.is_empty())
                .unwrap_or(defaults.block_delimiter),
            work_dir: env.parse("ENGINE_WORK_DIR", defaults.work_dir)?,
            capture_dir: env.parse("CAPTURE_DIR", defaults.capture_dir)?,
            dictionary_dir: env.parse("DICTIONARY_DIR", defaults.dictionary_dir)?,
            converter_bin: env.parse("CONVERTER_BIN", defaults.converter_bin)?,
            cancel_poll: env.positive_millis("CANCEL_POLL_MS", 1000)?,
            terminate_grace: env.positive_secs("TERMINATE_GRACE_SECS", 5)?,
        };

        let throttle = ThrottleConfig {
            persist_interval: env.positive_millis("PROGRESS_PERSIST_INTERVAL_MS", 5000)?,
            broadcast_interval: env.positive_millis("PROGRESS_BROADCAST_INTERVAL_MS", 1500)?,
        };

        let attack_concurrency: usize = env.parse("ATTACK_CONCURRENCY", 1)?;
        if attack_concurrency != 1 {
            tracing::warn!(
                requested = attack_concurrency,
                "ATTACK_CONCURRENCY ignored; the engine lane always runs one job at a time",
            );
        }
        let lanes = LaneConfig {
            attack_concurrency: 1,
            capture_concurrency: env.parse::<usize>("CAPTURE_CONCURRENCY", 2)?.max(1),
            dictionary_concurrency: env.parse::<usize>("DICTIONARY_CONCURRENCY", 3)?.max(1),
            poll_interval: env.positive_millis("QUEUE_POLL_MS", 1000)?,
            dependency_retry: env.positive_secs("DEPENDENCY_RETRY_SECS", 30)?,
            lease: env.positive_secs("QUEUE_LEASE_SECS", 60)?,
        };

        let ws = WsConfig {
            heartbeat_interval: env.positive_secs("WS_HEARTBEAT_SECS", 30)?,
            timeout: env.positive_secs("WS_TIMEOUT_SECS", 60)?,
        };

        Ok(Self {
            server,
            engine,
            throttle,
            lanes,
            ws,
        })
    }
}

/// Turn `\n`, `\r` and `\t` escapes in an env value into the characters.
fn unescape(value: &str) -> String {
    value
        .replace("\\n", "\n")
        .replace("\\r", "\r")
        .replace("\\t", "\t")
}
