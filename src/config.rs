use std::time::Duration;

use crate::error::{RaftError, Result};

/// Bounds on how much of the log stays resident in memory.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Number of entries above the snapshot index loaded on start.
    pub load_len: usize,
    /// Maximum number of entries cached in memory; older entries are
    /// read back from the log storage on demand.
    pub cache_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            load_len: 30,
            cache_capacity: 1024,
        }
    }
}

/// Timing and sizing knobs for a Raft node.
///
/// The follower election timeout is derived from three values:
/// `base_timeout_ms + priority * priority_step_ms + rand(0..=timeout_random_factor_ms)`.
/// The priority is the node's position among the cluster ids, so lower ids
/// tend to time out first and elections rarely split.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub heartbeat_interval_ms: u64,
    pub base_timeout_ms: u64,
    pub timeout_random_factor_ms: u64,
    pub priority_step_ms: u64,
    /// How often the follower checks for a missed heartbeat.
    pub tick_interval_ms: u64,
    /// Upper bound on a single majority-call round.
    pub rpc_timeout_ms: u64,
    /// How far back a follower rewinds when its log diverges from the leader.
    pub repair_length: u64,
    /// Maximum number of entries shipped in one AppendLogEntries call.
    pub max_batch: usize,
    /// Idle wait of a replication pipeline when nothing can be shipped.
    pub proxy_idle_ms: u64,
    pub cluster_pool_size: usize,
    pub api_pool_size: usize,
    pub log: LogConfig,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 100,
            base_timeout_ms: 300,
            timeout_random_factor_ms: 150,
            priority_step_ms: 50,
            tick_interval_ms: 20,
            rpc_timeout_ms: 500,
            repair_length: 100,
            max_batch: 100,
            proxy_idle_ms: 50,
            cluster_pool_size: 16,
            api_pool_size: 64,
            log: LogConfig::default(),
        }
    }
}

impl RaftConfig {
    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_timeouts(
        mut self,
        base_ms: u64,
        random_factor_ms: u64,
        priority_step_ms: u64,
    ) -> Self {
        self.base_timeout_ms = base_ms;
        self.timeout_random_factor_ms = random_factor_ms;
        self.priority_step_ms = priority_step_ms;
        self
    }

    pub fn with_rpc_timeout(mut self, ms: u64) -> Self {
        self.rpc_timeout_ms = ms;
        self
    }

    pub fn with_tick_interval(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn with_repair_length(mut self, len: u64) -> Self {
        self.repair_length = len;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_log_config(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn proxy_idle(&self) -> Duration {
        Duration::from_millis(self.proxy_idle_ms)
    }

    /// Window during which a node that heard from a leader refuses pre-votes.
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(RaftError::Config(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.base_timeout_ms {
            return Err(RaftError::Config(format!(
                "heartbeat_interval_ms ({}) must be less than base_timeout_ms ({})",
                self.heartbeat_interval_ms, self.base_timeout_ms
            )));
        }
        if self.tick_interval_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(RaftError::Config(
                "tick_interval_ms and rpc_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.repair_length == 0 {
            return Err(RaftError::Config("repair_length must be at least 1".to_string()));
        }
        if self.max_batch == 0 {
            return Err(RaftError::Config("max_batch must be at least 1".to_string()));
        }
        if self.cluster_pool_size == 0 || self.api_pool_size == 0 {
            return Err(RaftError::Config("worker pools must not be empty".to_string()));
        }
        if self.log.cache_capacity == 0 {
            return Err(RaftError::Config("log cache_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_config_default() {
        let cfg = RaftConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 100);
        assert_eq!(cfg.base_timeout_ms, 300);
        assert_eq!(cfg.timeout_random_factor_ms, 150);
        assert_eq!(cfg.repair_length, 100);
        assert_eq!(cfg.max_batch, 100);
        assert_eq!(cfg.rpc_timeout_ms, 500);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn log_config_default() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.load_len, 30);
        assert_eq!(cfg.cache_capacity, 1024);
    }

    #[test]
    fn builder_methods_override_fields() {
        let cfg = RaftConfig::default()
            .with_heartbeat_interval(20)
            .with_timeouts(80, 30, 25)
            .with_rpc_timeout(150)
            .with_repair_length(2)
            .with_max_batch(10);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(20));
        assert_eq!(cfg.base_timeout(), Duration::from_millis(80));
        assert_eq!(cfg.timeout_random_factor_ms, 30);
        assert_eq!(cfg.priority_step_ms, 25);
        assert_eq!(cfg.rpc_timeout(), Duration::from_millis(150));
        assert_eq!(cfg.repair_length, 2);
        assert_eq!(cfg.max_batch, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_heartbeat_slower_than_timeout() {
        let cfg = RaftConfig::default().with_heartbeat_interval(400);
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_repair_length() {
        let cfg = RaftConfig::default().with_repair_length(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_cache() {
        let cfg = RaftConfig::default().with_log_config(LogConfig {
            load_len: 10,
            cache_capacity: 0,
        });
        assert!(cfg.validate().is_err());
    }
}
