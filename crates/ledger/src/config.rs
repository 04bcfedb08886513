//! Engine configuration loaded from environment variables.

use std::time::Duration;

use crate::coordinator::RetryPolicy;
use crate::stock::StockFloorPolicy;
use crate::telemetry::LogFormat;

/// Ledger configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string (default: unset, in-memory)
/// - `LEDGER_DB_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `LEDGER_MAX_RETRIES`: transaction attempts on conflict (default: `5`)
/// - `LEDGER_RETRY_BASE_DELAY_MS`: linear backoff step (default: `25`)
/// - `LEDGER_SEQUENCE_PADDING`: digits in generated codes (default: `5`)
/// - `LEDGER_LOCK_TIMEOUT_MS`: row lock wait before a conflict (default: `2000`)
/// - `LEDGER_STOCK_FLOOR`: `sales` or `all` (default: `sales`)
/// - `LEDGER_LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub retry: RetryPolicy,
    pub sequence_padding: usize,
    pub lock_timeout: Duration,
    pub stock_floor: StockFloorPolicy,
    pub log_format: LogFormat,
    pub log_level: String,
}

impl LedgerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Values that do
    /// not parse are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            max_connections: parsed("LEDGER_DB_MAX_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_connections),
            retry: RetryPolicy {
                max_retries: parsed("LEDGER_MAX_RETRIES")
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(defaults.retry.max_retries),
                base_delay: parsed("LEDGER_RETRY_BASE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
            },
            sequence_padding: parsed("LEDGER_SEQUENCE_PADDING")
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(defaults.sequence_padding),
            lock_timeout: parsed("LEDGER_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            stock_floor: lookup("LEDGER_STOCK_FLOOR")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.stock_floor),
            log_format: lookup("LEDGER_LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_format),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            retry: RetryPolicy::default(),
            sequence_padding: 5,
            lock_timeout: Duration::from_millis(2000),
            stock_floor: StockFloorPolicy::SalesOnly,
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
        }
    }
}
