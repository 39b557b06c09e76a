use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{EntriesPathFn, NewCheckpointFn};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::files;
use crate::flock::FileLock;
use crate::integrate;
use crate::layout::{self, TileId, ENTRY_BUNDLE_WIDTH, TILE_WIDTH};
use crate::merkle::{self, Hash};
use crate::tile::HashTile;
use crate::{errdata, errinput};

/// Required version of the log state directory. Bumped whenever the
/// on-disk layout changes incompatibly.
const COMPATIBILITY_VERSION: u64 = 1;

// Tree state is a small JSON blob; the root travels base64-encoded.
#[derive(Serialize, Deserialize)]
struct TreeState {
    size: u64,
    root: String,
}

/// The POSIX log engine shared by the appender and migration lifecycles:
/// file layout, tree state, sequencing, integration, and checkpoint
/// publication. Lifecycle-specific plumbing (queue, publisher task) lives
/// in the wrappers.
pub(crate) struct LogCore {
    path: PathBuf,
    entries_path: Arc<EntriesPathFn>,
    new_checkpoint: Option<Arc<NewCheckpointFn>>,

    // First half of the double lock: serializes tree mutation within this
    // instance. The flock on treeState.lock serializes across instances
    // and processes.
    seq_lock: Mutex<()>,

    // Single-slot dirty signal to the checkpoint publisher; absent for
    // mirrored and migration logs.
    cp_updated: Option<mpsc::Sender<()>>,
}

impl LogCore {
    pub fn new(
        path: PathBuf,
        entries_path: Arc<EntriesPathFn>,
        new_checkpoint: Option<Arc<NewCheckpointFn>>,
        cp_updated: Option<mpsc::Sender<()>>,
    ) -> Self {
        Self {
            path,
            entries_path,
            new_checkpoint,
            seq_lock: Mutex::new(()),
            cp_updated,
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.path.join(layout::STATE_DIR)
    }

    fn tree_state_path(&self) -> PathBuf {
        self.state_dir().join("treeState")
    }

    fn version_path(&self) -> PathBuf {
        self.state_dir().join("version")
    }

    fn tree_state_lock_path(&self) -> PathBuf {
        self.state_dir().join("treeState.lock")
    }

    fn publish_lock_path(&self) -> PathBuf {
        self.state_dir().join("publish.lock")
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.path.join(layout::CHECKPOINT_PATH)
    }

    /// Validates (and with `create`, builds) the on-disk structure.
    pub fn initialise(&self, create: bool) -> Result<()> {
        if create {
            if self.version_path().exists() {
                return errinput!(
                    "log at {} already exists; create must only be used once",
                    self.path.display()
                );
            }
            tracing::info!(path = %self.path.display(), "initializing directory for new log");
            files::ensure_dir(&self.state_dir())?;
            self.write_tree_state(0, &merkle::empty_root())?;
        }
        self.ensure_version()?;
        if self.read_tree_state()?.is_none() {
            return errdata!("no tree state found at {}", self.path.display());
        }
        if create && self.new_checkpoint.is_some() {
            self.publish_checkpoint(Duration::ZERO)?;
        }
        Ok(())
    }

    // Fails on a version mismatch. A missing version file is written in
    // place so logs created before versioning keep working.
    fn ensure_version(&self) -> Result<()> {
        let path = self.version_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no version file exists, creating");
                files::ensure_dir(&self.state_dir())?;
                files::create_exclusive(&path, COMPATIBILITY_VERSION.to_string().as_bytes())?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let got: u64 = raw
            .parse()
            .map_err(|e| Error::InvalidData(format!("failed to parse version file: {e}")))?;
        if got != COMPATIBILITY_VERSION {
            return errinput!("wanted version {COMPATIBILITY_VERSION} but found {got}");
        }
        Ok(())
    }

    /// Currently stored tree state, or `None` for a log with no state
    /// file yet.
    pub fn read_tree_state(&self) -> Result<Option<(u64, Hash)>> {
        let raw = match fs::read(self.tree_state_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: TreeState = serde_json::from_slice(&raw)?;
        let root = BASE64
            .decode(&state.root)
            .map_err(|e| Error::InvalidData(format!("failed to decode root: {e}")))?;
        let root: Hash = root
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidData(format!("root has {} bytes, want 32", root.len())))?;
        Ok(Some((state.size, root)))
    }

    /// Persists the tree state and wakes the checkpoint publisher. The
    /// wake is non-blocking: a signal already pending is enough.
    pub fn write_tree_state(&self, size: u64, root: &Hash) -> Result<()> {
        let raw = serde_json::to_vec(&TreeState {
            size,
            root: BASE64.encode(root),
        })?;
        files::create_exclusive(&self.tree_state_path(), &raw)?;
        if let Some(tx) = &self.cp_updated {
            let _ = tx.try_send(());
        }
        Ok(())
    }

    /// Runs `f` under the double lock: the in-process mutex, then the
    /// cross-process advisory lock on `treeState.lock`. Every tree
    /// mutation must go through here.
    pub fn with_tree_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.seq_lock.lock()?;
        let flock = FileLock::lock(self.tree_state_lock_path())?;
        let result = f();
        flock.unlock()?;
        result
    }

    /// Assigns contiguous sequence numbers to a batch of entries, writes
    /// their bundles, and integrates their hashes into the tree. Returns
    /// the index assigned to the first entry.
    pub fn sequence_batch(&self, entries: Vec<Box<dyn Entry>>) -> Result<u64> {
        self.with_tree_lock(|| self.sequence_locked(entries))
    }

    fn sequence_locked(&self, entries: Vec<Box<dyn Entry>>) -> Result<u64> {
        // Re-read under the lock: another process may have advanced the
        // tree since our last flush.
        let size = match self.read_tree_state()? {
            Some((size, _)) => size,
            None => 0,
        };
        tracing::debug!(size, "sequencing from");
        if entries.is_empty() {
            return Ok(size);
        }

        let seq = size;
        let mut bundle_index = seq / ENTRY_BUNDLE_WIDTH;
        let mut in_bundle = (seq % ENTRY_BUNDLE_WIDTH) as usize;
        let mut buf: Vec<u8> = Vec::new();
        if in_bundle > 0 {
            // The right-most bundle is partial: start from its contents so
            // the grown bundle supersedes it.
            buf = self.read_entry_bundle(bundle_index, in_bundle as u8)?;
        }

        let mut leaf_hashes = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            buf.extend(entry.marshal_bundle(seq + i as u64));
            leaf_hashes.push(entry.leaf_hash());
            in_bundle += 1;
            if in_bundle == ENTRY_BUNDLE_WIDTH as usize {
                self.write_bundle(bundle_index, 0, &buf)?;
                bundle_index += 1;
                in_bundle = 0;
                buf.clear();
            }
        }
        if in_bundle > 0 {
            // Unreachable given the flush above, but an overflow past the
            // u8 partial suffix would corrupt the log, so re-check before
            // the narrowing cast.
            if in_bundle > ENTRY_BUNDLE_WIDTH as usize {
                return errdata!(
                    "entries in bundle ({in_bundle}) exceed bundle width {ENTRY_BUNDLE_WIDTH}"
                );
            }
            self.write_bundle(bundle_index, in_bundle as u8, &buf)?;
        }

        self.integrate(seq, &leaf_hashes)?;
        Ok(seq)
    }

    /// Folds `leaf_hashes` (starting at `from_seq`) into the tiled tree,
    /// writes the touched tiles, and commits the new tree state.
    pub fn integrate(&self, from_seq: u64, leaf_hashes: &[Hash]) -> Result<()> {
        let read = |ids: &[TileId], tree_size: u64| self.read_tiles(ids, tree_size);
        let integrated = integrate::integrate(read, from_seq, leaf_hashes).map_err(|e| {
            tracing::error!(from_seq, error = %e, "integrate failed");
            e
        })?;
        for (id, tile) in &integrated.tiles {
            self.store_tile(id.level, id.index, integrated.size, tile)?;
        }
        tracing::info!(
            size = integrated.size,
            root = %hex::encode(integrated.root),
            "new tree state"
        );
        self.write_tree_state(integrated.size, &integrated.root)
    }

    fn read_tiles(&self, ids: &[TileId], tree_size: u64) -> Result<Vec<Option<HashTile>>> {
        ids.iter()
            .map(|id| {
                let p = layout::partial_tile_size(id.level, id.index, tree_size);
                self.read_hash_tile(id.level, id.index, p)
            })
            .collect()
    }

    // Parsed tile at the given location, or None if no file exists there.
    fn read_hash_tile(&self, level: u64, index: u64, partial: u8) -> Result<Option<HashTile>> {
        match fs::read(self.path.join(layout::tile_path(level, index, partial))) {
            Ok(raw) => Ok(Some(HashTile::from_bytes(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Writes a tile, deriving its partial suffix from the new tree size.
    // Writing a full tile retires every partial predecessor via symlink.
    fn store_tile(&self, level: u64, index: u64, tree_size: u64, tile: &HashTile) -> Result<()> {
        let n = tile.nodes.len();
        if n == 0 || n > TILE_WIDTH as usize {
            return errdata!("tile size {n} must be > 0 and <= {TILE_WIDTH}");
        }
        let partial = layout::partial_tile_size(level, index, tree_size);
        tracing::debug!(level, index, nodes = n, partial, "store tile");

        let path = self.path.join(layout::tile_path(level, index, partial));
        if let Some(dir) = path.parent() {
            files::ensure_dir(dir)?;
        }
        files::create_exclusive(&path, &tile.to_bytes())?;
        if partial == 0 {
            files::relink_partials(&path)?;
        }
        Ok(())
    }

    /// Writes an entry bundle. Re-writing an existing bundle is permitted
    /// and idempotent: retries after a crash land on identical bytes.
    /// Writing a full bundle retires every partial predecessor via
    /// symlink, like tiles.
    pub fn write_bundle(&self, index: u64, partial: u8, bundle: &[u8]) -> Result<()> {
        let path = self.path.join((self.entries_path)(index, partial));
        if let Some(dir) = path.parent() {
            files::ensure_dir(dir)?;
        }
        files::create_exclusive(&path, bundle)?;
        if partial == 0 {
            files::relink_partials(&path)?;
        }
        Ok(())
    }

    /// Raw bytes of the entry bundle at `(index, partial)`.
    pub fn read_entry_bundle(&self, index: u64, partial: u8) -> Result<Vec<u8>> {
        Ok(fs::read(self.path.join((self.entries_path)(index, partial)))?)
    }

    /// Raw bytes of the tile at `(level, index, partial)`.
    pub fn read_tile(&self, level: u64, index: u64, partial: u8) -> Result<Vec<u8>> {
        Ok(fs::read(self.path.join(layout::tile_path(level, index, partial)))?)
    }

    /// Raw bytes of the currently published checkpoint.
    pub fn read_checkpoint(&self) -> Result<Vec<u8>> {
        Ok(fs::read(self.checkpoint_path())?)
    }

    /// Publishes a fresh checkpoint unless the current one is younger
    /// than `min_staleness`. Serialized across processes by
    /// `publish.lock`. A no-op for mirrored logs.
    pub fn publish_checkpoint(&self, min_staleness: Duration) -> Result<()> {
        let Some(new_cp) = &self.new_checkpoint else {
            return Ok(());
        };
        let lock = FileLock::lock(self.publish_lock_path())?;
        let result = self.publish_locked(new_cp, min_staleness);
        lock.unlock()?;
        result
    }

    fn publish_locked(&self, new_cp: &Arc<NewCheckpointFn>, min_staleness: Duration) -> Result<()> {
        match fs::metadata(self.checkpoint_path()) {
            Ok(meta) => {
                if let Ok(age) = meta.modified()?.elapsed() {
                    if age < min_staleness {
                        tracing::debug!(
                            age_ms = age.as_millis() as u64,
                            "checkpoint is fresh, skipping publish"
                        );
                        return Ok(());
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no checkpoint exists, publishing");
            }
            Err(e) => return Err(e.into()),
        }

        let Some((size, root)) = self.read_tree_state()? else {
            return errdata!("no tree state to publish a checkpoint from");
        };
        let raw = new_cp(size, &root)?;
        files::create_exclusive(&self.checkpoint_path(), &raw)?;
        tracing::info!(size, "published checkpoint");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
