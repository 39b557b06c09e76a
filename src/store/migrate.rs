use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BundleHasherFn, Config};
use crate::error::Result;
use crate::layout;
use crate::merkle::Hash;
use crate::{errdata, errinput};

use super::core::LogCore;

// Bundles hashed per build cycle. Bounding the work per lock hold keeps
// migration incremental and lets concurrent readers observe progress.
const MAX_BUNDLES_PER_CYCLE: usize = 300;

/// The migration lifecycle: a log populated from externally supplied
/// entry bundles instead of an in-process sequencer.
///
/// The migration driver feeds bundles in via
/// [`set_entry_bundle`](MigrationStorage::set_entry_bundle) and then waits
/// on [`await_integration`](MigrationStorage::await_integration), which
/// incrementally rebuilds the tiled tree until it covers the source log's
/// size. Verifying the returned root against the source's checkpoint is
/// the driver's job; a migration target never publishes checkpoints of
/// its own.
pub struct MigrationStorage {
    core: Arc<LogCore>,
    bundle_hasher: Arc<BundleHasherFn>,
}

impl MigrationStorage {
    /// Opens (or with `create`, initializes) a migration target at
    /// `path`. `bundle_hasher` parses an entry bundle into the leaf
    /// hashes of its entries.
    pub fn new<F>(path: impl Into<PathBuf>, create: bool, bundle_hasher: F, config: Config) -> Result<Self>
    where
        F: Fn(&[u8]) -> Result<Vec<Hash>> + Send + Sync + 'static,
    {
        let core = Arc::new(LogCore::new(
            path.into(),
            config.entries_path.clone(),
            None,
            None,
        ));
        core.initialise(create)?;
        Ok(Self {
            core,
            bundle_hasher: Arc::new(bundle_hasher),
        })
    }

    /// Stores one entry bundle supplied by the migration driver.
    pub fn set_entry_bundle(&self, index: u64, partial: u8, bundle: &[u8]) -> Result<()> {
        self.core.write_bundle(index, partial, bundle)
    }

    /// The stored tree state.
    pub fn state(&self) -> Result<(u64, Hash)> {
        match self.core.read_tree_state()? {
            Some(state) => Ok(state),
            None => errdata!("no tree state found at {}", self.core.path().display()),
        }
    }

    /// Repeatedly integrates stored bundles until the tree covers
    /// `source_size` entries, then returns the root. Build failures are
    /// logged and retried on the next tick; drop the future to cancel.
    pub async fn await_integration(&self, source_size: u64) -> Result<Hash> {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        loop {
            ticker.tick().await;

            let core = Arc::clone(&self.core);
            let hasher = Arc::clone(&self.bundle_hasher);
            let built =
                tokio::task::spawn_blocking(move || build_tree(&core, &*hasher, source_size))
                    .await?;
            if let Err(e) = built {
                tracing::warn!(error = %e, "build tree failed");
            }

            match self.core.read_tree_state() {
                Ok(Some((size, root))) => {
                    if size == source_size {
                        return Ok(root);
                    }
                    tracing::debug!(size, source_size, "integration still catching up");
                }
                Ok(None) => tracing::warn!("tree state missing"),
                Err(e) => tracing::warn!(error = %e, "read tree state failed"),
            }
        }
    }
}

// One bounded build cycle under the same double lock as the sequencer.
fn build_tree(core: &LogCore, hasher: &BundleHasherFn, target_size: u64) -> Result<()> {
    core.with_tree_lock(|| {
        let from = match core.read_tree_state()? {
            Some((size, _)) => size,
            None => 0,
        };
        if from > target_size {
            return errinput!("stored size {from} is beyond the migration target {target_size}");
        }
        tracing::debug!(from, target_size, "building tree");
        let hashes = fetch_leaf_hashes(core, hasher, from, target_size, target_size)?;
        core.integrate(from, &hashes)
    })
}

// Leaf hashes for [from, to), capped at MAX_BUNDLES_PER_CYCLE bundles.
fn fetch_leaf_hashes(
    core: &LogCore,
    hasher: &BundleHasherFn,
    from: u64,
    to: u64,
    source_size: u64,
) -> Result<Vec<Hash>> {
    let mut hashes = Vec::new();
    for (n, ri) in layout::range(from, to, source_size).enumerate() {
        if n >= MAX_BUNDLES_PER_CYCLE {
            break;
        }
        let bundle = core.read_entry_bundle(ri.index, ri.partial)?;
        let bundle_hashes = hasher(&bundle)?;
        let first = ri.first as usize;
        let end = first + ri.n as usize;
        if bundle_hashes.len() < end {
            return errdata!(
                "bundle {} hashed to {} leaves, need {end}",
                ri.index,
                bundle_hashes.len()
            );
        }
        hashes.extend_from_slice(&bundle_hashes[first..end]);
    }
    Ok(hashes)
}
