use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::layout;
use crate::merkle::Hash;

/// Produces signed checkpoint bytes committing to `(size, root)`. Absent
/// for mirrored logs, which never publish their own checkpoints.
pub type NewCheckpointFn = dyn Fn(u64, &Hash) -> Result<Vec<u8>> + Send + Sync;

/// Maps an entry bundle `(index, partial)` to its path relative to the log
/// root. Overridable for callers with a bespoke bundle layout; partial
/// variants must live under `<full path>.p/` so promotion can relink them.
pub type EntriesPathFn = dyn Fn(u64, u8) -> String + Send + Sync;

/// Parses an entry bundle back into the leaf hashes of its entries.
/// Migration only.
pub type BundleHasherFn = dyn Fn(&[u8]) -> Result<Vec<Hash>> + Send + Sync;

/// Publishing a checkpoint more often than this is rejected at
/// construction.
pub const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the log storage engine.
#[derive(Clone)]
pub struct Config {
    /// How often a fresh checkpoint is published, and the minimum age an
    /// existing checkpoint must reach before being rewritten (default: 10s)
    pub checkpoint_interval: Duration,

    /// Maximum time an entry waits in the queue before its batch is
    /// flushed (default: 250ms)
    pub batch_max_age: Duration,

    /// Maximum entries per batch before an immediate flush (default: 256)
    pub batch_max_size: usize,

    /// Checkpoint signer; `None` makes this a mirrored log.
    pub new_checkpoint: Option<Arc<NewCheckpointFn>>,

    /// Entry bundle path scheme.
    pub entries_path: Arc<EntriesPathFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(10),
            batch_max_age: Duration::from_millis(250),
            batch_max_size: 256,
            new_checkpoint: None,
            entries_path: Arc::new(layout::entries_path),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("batch_max_age", &self.batch_max_age)
            .field("batch_max_size", &self.batch_max_size)
            .field("new_checkpoint", &self.new_checkpoint.is_some())
            .finish()
    }
}

impl Config {
    /// Set the checkpoint publish interval
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the queue age trigger
    pub fn batch_max_age(mut self, age: Duration) -> Self {
        self.batch_max_age = age;
        self
    }

    /// Set the queue size trigger
    pub fn batch_max_size(mut self, size: usize) -> Self {
        self.batch_max_size = size;
        self
    }

    /// Set the checkpoint signer
    pub fn new_checkpoint<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, &Hash) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.new_checkpoint = Some(Arc::new(f));
        self
    }

    /// Override the entry bundle path scheme
    pub fn entries_path<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, u8) -> String + Send + Sync + 'static,
    {
        self.entries_path = Arc::new(f);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.checkpoint_interval < MIN_CHECKPOINT_INTERVAL {
            return crate::errinput!(
                "checkpoint interval {:?} is less than minimum permitted {:?}",
                self.checkpoint_interval,
                MIN_CHECKPOINT_INTERVAL
            );
        }
        if self.batch_max_size == 0 {
            return crate::errinput!("batch max size must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.checkpoint_interval, Duration::from_secs(10));
        assert_eq!(config.batch_max_age, Duration::from_millis(250));
        assert_eq!(config.batch_max_size, 256);
        assert!(config.new_checkpoint.is_none());
        assert_eq!((config.entries_path)(1, 1), "tile/entries/001.p/1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::default()
            .checkpoint_interval(Duration::from_secs(2))
            .batch_max_age(Duration::from_millis(50))
            .batch_max_size(64)
            .new_checkpoint(|size, _root| Ok(format!("cp {size}").into_bytes()));

        assert_eq!(config.checkpoint_interval, Duration::from_secs(2));
        assert_eq!(config.batch_max_age, Duration::from_millis(50));
        assert_eq!(config.batch_max_size, 64);
        assert!(config.new_checkpoint.is_some());
    }

    #[test]
    fn test_rejects_short_checkpoint_interval() {
        let config = Config::default().checkpoint_interval(Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let config = Config::default().batch_max_size(0);
        assert!(config.validate().is_err());
    }
}
