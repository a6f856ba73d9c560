use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Longest auction window accepted from config or a customer request (one year).
pub const MAX_BID_WINDOW_HOURS: u32 = 24 * 366;
/// Longest sweep interval accepted from config (one day).
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the service and the procurement engine.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub engine: EngineConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let defaults = EngineConfig::default();
        let bid_window_hours = parse_bounded(
            "SUNBID_BID_WINDOW_HOURS",
            defaults.bid_window_hours,
            MAX_BID_WINDOW_HOURS,
        )?;
        let authority_fee = match env::var("SUNBID_AUTHORITY_FEE") {
            Ok(raw) => raw
                .trim()
                .parse::<Decimal>()
                .ok()
                .filter(|fee| *fee > Decimal::ZERO)
                .ok_or(ConfigError::InvalidAmount {
                    variable: "SUNBID_AUTHORITY_FEE",
                    value: raw,
                })?,
            Err(_) => defaults.authority_fee,
        };
        let retry_attempts =
            parse_positive("SUNBID_STORE_RETRY_ATTEMPTS", defaults.store_retry.attempts)?;
        let retry_backoff_ms = parse_number(
            "SUNBID_STORE_RETRY_BACKOFF_MS",
            defaults.store_retry.backoff.as_millis() as u64,
        )?;
        let sweep_secs = parse_bounded(
            "SUNBID_SWEEP_INTERVAL_SECS",
            defaults.sweep_interval.as_secs(),
            MAX_SWEEP_INTERVAL_SECS,
        )?;

        let db_path = env::var("SUNBID_DB_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            engine: EngineConfig {
                bid_window_hours,
                authority_fee,
                store_retry: RetryPolicy {
                    attempts: retry_attempts,
                    backoff: Duration::from_millis(retry_backoff_ms),
                },
                sweep_interval: Duration::from_secs(sweep_secs),
            },
            storage: StorageConfig { db_path },
        })
    }
}

fn parse_number<T>(variable: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(variable) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber {
                variable,
                value: raw,
            }),
        Err(_) => Ok(default),
    }
}

fn parse_positive<T>(variable: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + fmt::Display,
{
    let value = parse_number(variable, default)?;
    if value <= T::default() {
        return Err(ConfigError::InvalidNumber {
            variable,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn parse_bounded<T>(variable: &'static str, default: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + fmt::Display,
{
    let value = parse_positive(variable, default)?;
    if value > max {
        return Err(ConfigError::OutOfRange {
            variable,
            value: value.to_string(),
            max: max.to_string(),
        });
    }
    Ok(value)
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Tunables for the lifecycle and bidding engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Default auction window used when the customer does not request one.
    pub bid_window_hours: u32,
    /// Flat fee charged by the regulating authority once an application is approved.
    pub authority_fee: Decimal,
    pub store_retry: RetryPolicy,
    /// How often the sweeper looks for overdue or unreconciled auctions.
    pub sweep_interval: Duration,
}

impl EngineConfig {
    pub fn bid_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.bid_window_hours))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bid_window_hours: 48,
            authority_fee: dec!(25000),
            store_retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Retry policy for persisting a committed transition after a transient store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Linear backoff before the given retry (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Where durable state lives. `None` keeps everything in process memory.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub db_path: Option<PathBuf>,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost {
        source: std::net::AddrParseError,
    },
    InvalidNumber {
        variable: &'static str,
        value: String,
    },
    InvalidAmount {
        variable: &'static str,
        value: String,
    },
    OutOfRange {
        variable: &'static str,
        value: String,
        max: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { variable, value } => {
                write!(f, "{variable} must be a positive integer, got '{value}'")
            }
            ConfigError::InvalidAmount { variable, value } => {
                write!(f, "{variable} must be a positive decimal amount, got '{value}'")
            }
            ConfigError::OutOfRange {
                variable,
                value,
                max,
            } => write!(f, "{variable} must be at most {max}, got '{value}'"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidNumber { .. }
            | ConfigError::InvalidAmount { .. }
            | ConfigError::OutOfRange { .. } => None,
        }
    }
}
