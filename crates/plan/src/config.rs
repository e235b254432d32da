//! Plan execution configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};

/// Plan execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Broadcast protocol config
    pub broadcast: BroadcastConfig,

    /// Membership protocol config
    pub membership: MembershipConfig,

    /// Quorum health check config
    pub health: HealthConfig,

    /// Cleanup job config
    pub cleanup: CleanupConfig,

    /// Executor config
    pub executor: ExecutorConfig,

    /// Upper bound on a single remote call
    pub rpc_timeout: Duration,
}

/// Broadcast protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Share of the target population that must be updated, in percent
    pub threshold_percent: u8,

    /// Delay between retries of failing targets
    pub retry_delay: Duration,
}

/// Membership protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Delay between sweeps when a group has no leader
    pub retry_delay: Duration,

    /// Maximum number of sweeps, unbounded when `None`
    pub max_sweeps: Option<u32>,
}

/// Quorum health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between status polls while waiting for replicas
    pub poll_interval: Duration,

    /// How long to wait for replicas to catch up
    pub catch_up_timeout: Duration,

    /// Replication lag considered caught up, in milliseconds
    pub acceptable_lag_ms: u64,

    /// Number of arbiter status checks before refusing to stop a node
    pub arbiter_recheck_attempts: u32,

    /// Delay between arbiter status checks
    pub arbiter_recheck_delay: Duration,
}

/// Cleanup job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Fixed delay between cleanup attempts
    pub retry_delay: Duration,

    /// Maximum number of cleanup attempts
    pub max_attempts: u32,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker pool size for parallel steps
    pub pool_size: usize,

    /// Delay before a job that is not done yet runs again
    pub continuation_delay: Duration,
}

impl PlanConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> PlanResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| PlanError::invalid_state(format!("invalid plan configuration: {e}")))
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            broadcast: BroadcastConfig::default(),
            membership: MembershipConfig::default(),
            health: HealthConfig::default(),
            cleanup: CleanupConfig::default(),
            executor: ExecutorConfig::default(),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 60,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            max_sweeps: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            catch_up_timeout: Duration::from_secs(60),
            acceptable_lag_ms: 5_000,
            arbiter_recheck_attempts: 3,
            arbiter_recheck_delay: Duration::from_secs(1),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(120),
            max_attempts: 10,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            continuation_delay: Duration::from_secs(1),
        }
    }
}
