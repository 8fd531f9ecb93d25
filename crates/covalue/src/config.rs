//! Node configuration.

use std::time::Duration;

use covalue_core::config::MAX_RECOMMENDED_TX_SIZE;
use covalue_store::StorageConfig;
use covalue_sync::LoadQueueConfig;

/// Backoff between load attempts of an unavailable CoValue.
///
/// Attempt `n` (starting at 1 for the first retry) waits
/// `base_delay * factor^n`: 300ms, 900ms, 2700ms, 8100ms with the defaults.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            factor: 3,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt`. Saturates at `Duration::MAX`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.factor
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

/// When local changes are pushed to server peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncWhen {
    /// Push every local change as soon as it is made.
    #[default]
    Always,
    /// Keep local changes in storage only.
    Never,
}

/// Configuration for a [`crate::LocalNode`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Outgoing load scheduling, per peer.
    pub load_queue: LoadQueueConfig,
    /// Load retries towards server peers.
    pub retry: RetryConfig,
    /// Payload bytes after which sessions take a signature checkpoint.
    pub max_tx_size: usize,
    pub sync_when: SyncWhen,
    /// Erase deleted CoValues from storage in the background.
    pub erase_deleted_covalues: bool,
    /// Upper bound for [`crate::LocalNode::wait_for_sync`].
    pub sync_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            load_queue: LoadQueueConfig::default(),
            retry: RetryConfig::default(),
            max_tx_size: MAX_RECOMMENDED_TX_SIZE,
            sync_when: SyncWhen::default(),
            erase_deleted_covalues: false,
            sync_timeout: Duration::from_secs(30),
        }
    }
}

impl NodeConfig {
    /// Settings for a [`covalue_store::StorageSync`] that this node writes
    /// through, with matching checkpoints.
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            max_tx_size: self.max_tx_size,
            ..StorageConfig::default()
        }
    }
}
