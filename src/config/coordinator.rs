use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::{env_list, env_millis, env_or, env_string};
use crate::aggregator::ConsensusPolicy;
use crate::error::ConfigError;
use crate::models::{Amount, ConsensusMethod};
use crate::retry::RetryPolicy;

/// Coordinator-wide settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub quorum_size: usize,
    pub quorum_timeout: Duration,
    pub minimum_responses: usize,
    /// Relative deviation from the median beyond which a value is an
    /// outlier. `None` disables outlier exclusion.
    pub outlier_deviation: Option<Decimal>,
    pub consensus_method: ConsensusMethod,
    pub equality_tolerance: Decimal,
    pub max_fetch_attempts: u32,
    pub max_delivery_attempts: u32,
    pub minimum_fee: Amount,
    pub node_fee_share: Amount,
    pub fetch_timeout: Duration,
    pub delivery_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub maintenance_interval: Duration,
    /// How long settled requests stay queryable before they are purged
    pub retention: Duration,
    pub max_response_bytes: usize,
    pub ledger_snapshot: Option<PathBuf>,
    pub callback_endpoint: Option<String>,
    /// Env prefixes of node agents hosted in this process
    pub local_nodes: Vec<String>,
    /// Hex verifying keys of remote nodes allowed to post responses
    pub admitted_nodes: Vec<String>,
    pub port: u16,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            quorum_size: 3,
            quorum_timeout: Duration::from_secs(30),
            minimum_responses: 2,
            outlier_deviation: Some(Decimal::new(1, 1)),
            consensus_method: ConsensusMethod::Median,
            equality_tolerance: Decimal::ZERO,
            max_fetch_attempts: 3,
            max_delivery_attempts: 3,
            minimum_fee: 10,
            node_fee_share: 10,
            fetch_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(1),
            retention: Duration::from_secs(3600),
            max_response_bytes: 64 * 1024,
            ledger_snapshot: None,
            callback_endpoint: None,
            local_nodes: Vec::new(),
            admitted_nodes: Vec::new(),
            port: 3001,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // "off" or zero disables outlier exclusion
        let outlier_deviation = match env_string("ORACLE_OUTLIER_DEVIATION") {
            Some(raw) if raw.eq_ignore_ascii_case("off") => None,
            Some(raw) => match Decimal::from_str(&raw) {
                Ok(threshold) if threshold.is_zero() => None,
                Ok(threshold) => Some(threshold),
                Err(_) => defaults.outlier_deviation,
            },
            None => defaults.outlier_deviation,
        };

        Self {
            quorum_size: env_or("ORACLE_QUORUM_SIZE", defaults.quorum_size),
            quorum_timeout: env_millis("ORACLE_QUORUM_TIMEOUT_MS", defaults.quorum_timeout),
            minimum_responses: env_or("ORACLE_MINIMUM_RESPONSES", defaults.minimum_responses),
            outlier_deviation,
            consensus_method: env_or("ORACLE_CONSENSUS_METHOD", defaults.consensus_method),
            equality_tolerance: env_or("ORACLE_EQUALITY_TOLERANCE", defaults.equality_tolerance),
            max_fetch_attempts: env_or("ORACLE_MAX_FETCH_ATTEMPTS", defaults.max_fetch_attempts),
            max_delivery_attempts: env_or(
                "ORACLE_MAX_DELIVERY_ATTEMPTS",
                defaults.max_delivery_attempts,
            ),
            minimum_fee: env_or("ORACLE_MINIMUM_FEE", defaults.minimum_fee),
            node_fee_share: env_or("ORACLE_NODE_FEE_SHARE", defaults.node_fee_share),
            fetch_timeout: env_millis("ORACLE_FETCH_TIMEOUT_MS", defaults.fetch_timeout),
            delivery_timeout: env_millis("ORACLE_DELIVERY_TIMEOUT_MS", defaults.delivery_timeout),
            retry_backoff: env_millis("ORACLE_RETRY_BACKOFF_MS", defaults.retry_backoff),
            max_backoff: env_millis("ORACLE_MAX_BACKOFF_MS", defaults.max_backoff),
            maintenance_interval: env_millis(
                "ORACLE_MAINTENANCE_INTERVAL_MS",
                defaults.maintenance_interval,
            ),
            retention: env_millis("ORACLE_RETENTION_MS", defaults.retention),
            max_response_bytes: env_or("ORACLE_MAX_RESPONSE_BYTES", defaults.max_response_bytes),
            ledger_snapshot: env_string("ORACLE_LEDGER_SNAPSHOT").map(PathBuf::from),
            callback_endpoint: env_string("ORACLE_CALLBACK_ENDPOINT"),
            local_nodes: env_list("ORACLE_LOCAL_NODES"),
            admitted_nodes: env_list("ORACLE_ADMITTED_NODES"),
            port: env_or("PORT", defaults.port),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quorum_size == 0 {
            return Err(ConfigError::Invalid("quorum size must be at least 1".into()));
        }
        if self.minimum_responses == 0 || self.minimum_responses > self.quorum_size {
            return Err(ConfigError::Invalid(format!(
                "minimum responses must be between 1 and the quorum size ({}), got {}",
                self.quorum_size, self.minimum_responses
            )));
        }
        if self.quorum_timeout.is_zero() {
            return Err(ConfigError::Invalid("quorum timeout must be positive".into()));
        }
        if let Some(threshold) = self.outlier_deviation {
            if threshold.is_sign_negative() {
                return Err(ConfigError::Invalid(format!(
                    "outlier deviation must not be negative, got {threshold}"
                )));
            }
        }
        if self.equality_tolerance.is_sign_negative() {
            return Err(ConfigError::Invalid(format!(
                "equality tolerance must not be negative, got {}",
                self.equality_tolerance
            )));
        }
        if self.max_fetch_attempts == 0 || self.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid("attempt limits must be at least 1".into()));
        }
        if self.max_backoff < self.retry_backoff {
            return Err(ConfigError::Invalid(
                "max backoff must not be shorter than the base backoff".into(),
            ));
        }
        if self.retention.is_zero() {
            return Err(ConfigError::Invalid("retention must be positive".into()));
        }
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Invalid("max response size must be positive".into()));
        }
        Ok(())
    }

    pub fn consensus_policy(&self) -> ConsensusPolicy {
        ConsensusPolicy {
            method: self.consensus_method,
            quorum_size: self.quorum_size,
            minimum_responses: self.minimum_responses,
            quorum_timeout: self.quorum_timeout,
            equality_tolerance: self.equality_tolerance,
            outlier_deviation: self.outlier_deviation,
        }
    }

    pub fn fetch_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_fetch_attempts, self.retry_backoff, self.max_backoff)
    }

    pub fn delivery_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_delivery_attempts, self.retry_backoff, self.max_backoff)
    }
}
