use std::{env, fmt, net::SocketAddr, time::Duration};

use budgetwatch_core::retry::RetryPolicy;
use budgetwatch_core::types::{ThresholdError, ThresholdSchedule};

use super::{server_bind_address, DEFAULT_DATABASE_URL};

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Mail gateway credentials, present only when email delivery is enabled.
#[derive(Debug, Clone)]
pub struct MailGatewayConfig {
    pub url: String,
    pub token: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Organization-wide default threshold ladder; campaigns may override it.
    pub thresholds: ThresholdSchedule,
    /// Retry bound and backoff for notification dispatch and queued tasks.
    pub dispatch_retry: RetryPolicy,
    /// Upper bound on acquiring the per-campaign evaluation lease.
    pub lock_lease: Duration,
    /// Cadence of the periodic evaluation sweep.
    pub sweep_interval: Duration,
    pub webhook_signing_secret: Option<Vec<u8>>,
    pub mail_gateway: Option<MailGatewayConfig>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let thresholds = match env::var("BUDGET_THRESHOLDS") {
            Ok(raw) => ThresholdSchedule::parse(&raw).map_err(ConfigError::InvalidThresholds)?,
            Err(_) => ThresholdSchedule::default(),
        };

        let max_attempts = read_number("DISPATCH_MAX_ATTEMPTS", 5)?;
        let backoff_base_ms = read_number("DISPATCH_BACKOFF_BASE_MS", 500)?;
        let backoff_cap_ms = read_number("DISPATCH_BACKOFF_CAP_MS", 30_000)?;
        let dispatch_retry = RetryPolicy::new(max_attempts as u32, backoff_base_ms, backoff_cap_ms);

        let lock_lease = Duration::from_millis(read_number("LOCK_LEASE_MS", 5_000)?);
        let sweep_interval = Duration::from_secs(read_number("SWEEP_INTERVAL_SECS", 60)?);

        let webhook_signing_secret = env::var("WEBHOOK_SIGNING_SECRET")
            .ok()
            .filter(|value| !value.is_empty())
            .map(String::into_bytes);

        let mail_gateway = match env::var("MAIL_GATEWAY_URL").ok().filter(|v| !v.is_empty()) {
            Some(url) => {
                let token = env::var("MAIL_GATEWAY_TOKEN")
                    .ok()
                    .filter(|value| !value.is_empty())
                    .ok_or(ConfigError::MissingMailGatewayToken)?;
                Some(MailGatewayConfig { url, token })
            }
            None => None,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            thresholds,
            dispatch_retry,
            lock_lease,
            sweep_interval,
            webhook_signing_secret,
            mail_gateway,
        })
    }
}

fn read_number(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidThresholds(ThresholdError),
    InvalidNumber { var: &'static str, value: String },
    MissingMailGatewayToken,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidThresholds(err) => write!(f, "invalid BUDGET_THRESHOLDS value: {err}"),
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a non-negative integer (got {value})")
            }
            Self::MissingMailGatewayToken => write!(
                f,
                "MAIL_GATEWAY_TOKEN is required when MAIL_GATEWAY_URL is set"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
