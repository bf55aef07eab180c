use std::collections::HashSet;
use std::time::Duration;

use super::{env_list, env_string, CoordinatorConfig};
use crate::models::{DataSource, SourceKind};
use crate::retry::RetryPolicy;

/// Per-node settings, passed explicitly to each `NodeAgent`
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Hex-encoded 32-byte Ed25519 seed
    pub signing_seed: Option<String>,
    pub sources: HashSet<SourceKind>,
    /// When set, only these hosts are fetched from
    pub hosts: Option<HashSet<String>>,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl NodeConfig {
    pub fn new(sources: impl IntoIterator<Item = SourceKind>) -> Self {
        Self {
            signing_seed: None,
            sources: sources.into_iter().collect(),
            hosts: None,
            fetch_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    /// Node serving every source kind with the coordinator's fetch settings
    pub fn from_coordinator(config: &CoordinatorConfig) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout,
            retry: config.fetch_retry(),
            ..Self::new([SourceKind::HttpJson, SourceKind::HttpText, SourceKind::Inline])
        }
    }

    /// Build from `<PREFIX>_SIGNING_SEED`, `<PREFIX>_SOURCES` and
    /// `<PREFIX>_HOSTS`. Returns `None` when no seed is configured.
    pub fn from_env_prefixed(prefix: &str, defaults: &CoordinatorConfig) -> Option<Self> {
        let seed = env_string(&format!("{prefix}_SIGNING_SEED"))?;

        let mut config = Self::from_coordinator(defaults);
        config.signing_seed = Some(seed);

        let sources: HashSet<SourceKind> = env_list(&format!("{prefix}_SOURCES"))
            .iter()
            .filter_map(|kind| kind.parse().ok())
            .collect();
        if !sources.is_empty() {
            config.sources = sources;
        }

        let hosts = env_list(&format!("{prefix}_HOSTS"));
        if !hosts.is_empty() {
            config = config.with_hosts(hosts);
        }

        Some(config)
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.hosts = Some(
            hosts
                .into_iter()
                .map(|host| host.as_ref().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Whether this node is configured to fetch from `source`
    pub fn serves(&self, source: &DataSource) -> bool {
        if !self.sources.contains(&source.kind()) {
            return false;
        }

        match (&self.hosts, source.host()) {
            (Some(allowed), Some(host)) => allowed.contains(&host),
            _ => true,
        }
    }
}
