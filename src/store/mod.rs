//! The storage engine's two lifecycles: [`Storage`] for appending logs
//! and [`MigrationStorage`] for rebuilding a log from external bundles.

mod core;
mod migrate;

pub use migrate::MigrationStorage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::entry::Entry;
use crate::error::Result;
use crate::queue::{IndexFuture, Queue};

use self::core::LogCore;

/// A tiled Merkle log over a POSIX filesystem.
///
/// Entries queued with [`add`](Storage::add) are batched, assigned
/// contiguous sequence numbers, persisted into entry bundles, and folded
/// into the tiled tree. When a checkpoint signer is configured, a
/// background task publishes signed checkpoints of the tree head, paced by
/// the checkpoint interval.
///
/// Multiple `Storage` instances (including in other processes) may share
/// one log directory; tree mutations are serialized by an advisory file
/// lock.
pub struct Storage {
    core: Arc<LogCore>,
    queue: Queue,
    shutdown: broadcast::Sender<()>,
    publisher: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Opens the log at `path`, creating it first when `create` is set.
    /// `create` must only be used once per log. Must be called within a
    /// tokio runtime.
    pub fn new(path: impl Into<PathBuf>, create: bool, config: Config) -> Result<Self> {
        config.validate()?;

        let (cp_tx, cp_rx) = mpsc::channel(1);
        let core = Arc::new(LogCore::new(
            path.into(),
            config.entries_path.clone(),
            config.new_checkpoint.clone(),
            Some(cp_tx),
        ));
        core.initialise(create)?;

        let seq_core = Arc::clone(&core);
        let queue = Queue::new(config.batch_max_age, config.batch_max_size, move |entries| {
            seq_core.sequence_batch(entries)
        });

        let (shutdown, _) = broadcast::channel(1);
        let publisher = config.new_checkpoint.is_some().then(|| {
            spawn_publisher(
                Arc::clone(&core),
                cp_rx,
                config.checkpoint_interval,
                shutdown.subscribe(),
            )
        });

        Ok(Self {
            core,
            queue,
            shutdown,
            publisher,
        })
    }

    /// Queues an entry for inclusion in the log. The returned future
    /// resolves once the entry is both sequenced and integrated, meaning a
    /// subsequent checkpoint will commit to it. Entries added later are
    /// assigned strictly greater indices.
    pub fn add(&self, entry: impl Entry + 'static) -> IndexFuture {
        self.queue.add(Box::new(entry))
    }

    /// The currently published checkpoint.
    pub fn read_checkpoint(&self) -> Result<Vec<u8>> {
        self.core.read_checkpoint()
    }

    /// The entry bundle at `(index, partial)`.
    pub fn read_entry_bundle(&self, index: u64, partial: u8) -> Result<Vec<u8>> {
        self.core.read_entry_bundle(index, partial)
    }

    /// The tile at `(level, index, partial)`.
    pub fn read_tile(&self, level: u64, index: u64, partial: u8) -> Result<Vec<u8>> {
        self.core.read_tile(level, index, partial)
    }

    /// Stops the background checkpoint publisher and waits for it to
    /// finish. Entries still queued are flushed by the queue before it
    /// shuts down.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.publisher.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

// Long-running checkpoint publication: wake on the dirty signal from tree
// state writes or on the interval ticker, whichever comes first, and let
// the staleness check inside publish_checkpoint pace actual rewrites.
fn spawn_publisher(
    core: Arc<LogCore>,
    mut cp_updated: mpsc::Receiver<()>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                signal = cp_updated.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("checkpoint publisher shutting down");
                    break;
                }
            }
            let publish_core = Arc::clone(&core);
            match tokio::task::spawn_blocking(move || publish_core.publish_checkpoint(interval))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "publish checkpoint failed"),
                Err(e) => tracing::warn!(error = %e, "publish task failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{bundle_leaf_hashes, PlainEntry};
    use crate::error::Error;
    use crate::merkle;
    use crate::tmpfs::TempDir;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> Config {
        Config::default()
            .batch_max_age(Duration::from_millis(10))
            .checkpoint_interval(Duration::from_secs(1))
            .new_checkpoint(|size, root| {
                Ok(format!("size {size}\nroot {}\n", hex::encode(root)).into_bytes())
            })
    }

    fn entry_data(i: u64) -> Vec<u8> {
        format!("e{i}").into_bytes()
    }

    #[tokio::test]
    async fn test_create_then_single_entry() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path(), true, test_config()).unwrap();

        // A fresh log publishes an initial checkpoint over the empty tree.
        let cp = storage.read_checkpoint().unwrap();
        assert_eq!(
            String::from_utf8(cp).unwrap(),
            format!("size 0\nroot {}\n", hex::encode(merkle::empty_root()))
        );

        let index = storage.add(PlainEntry::new(b"A".to_vec())).await.unwrap();
        assert_eq!(index, 0);

        let bundle = storage.read_entry_bundle(0, 1).unwrap();
        assert_eq!(bundle, PlainEntry::new(b"A".to_vec()).marshal_bundle(0));

        let tile = storage.read_tile(0, 0, 1).unwrap();
        assert_eq!(tile, merkle::leaf_hash(b"A").to_vec());

        let (size, root) = storage.core.read_tree_state().unwrap().unwrap();
        assert_eq!(size, 1);
        assert_eq!(root, merkle::reference_root(&[b"A".to_vec()]));

        // Once the staleness floor passes, the publisher commits to the
        // new head. Two full intervals guarantee a tick lands on a stale
        // checkpoint.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let cp = storage.read_checkpoint().unwrap();
        assert_eq!(
            String::from_utf8(cp).unwrap(),
            format!("size 1\nroot {}\n", hex::encode(root))
        );
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path(), true, test_config()).unwrap();
        drop(storage);

        match Storage::new(dir.path(), true, test_config()) {
            Err(Error::InvalidInput(msg)) => assert!(msg.contains("already exists")),
            other => panic!("want InvalidInput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_version() {
        let dir = TempDir::new().unwrap();
        drop(Storage::new(dir.path(), true, test_config()).unwrap());

        std::fs::write(dir.path().join(".state/version"), b"9").unwrap();
        match Storage::new(dir.path(), false, test_config()) {
            Err(Error::InvalidInput(msg)) => assert!(msg.contains("version")),
            other => panic!("want version mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fill_one_bundle_relinks_partials() {
        let dir = TempDir::new().unwrap();
        let config = test_config().batch_max_size(64);
        let storage = Storage::new(dir.path(), true, config).unwrap();

        let mut data = Vec::new();
        for i in 0..256u64 {
            data.push(entry_data(i));
            let index = storage.add(PlainEntry::new(entry_data(i))).await.unwrap();
            assert_eq!(index, i);
        }

        // Bundle and level-0 tile are full.
        let bundle = storage.read_entry_bundle(0, 0).unwrap();
        assert_eq!(bundle_leaf_hashes(&bundle).unwrap().len(), 256);
        let tile = storage.read_tile(0, 0, 0).unwrap();
        assert_eq!(tile.len(), 256 * 32);

        // Every partial path written along the way now resolves, via
        // symlink, to the full file's bytes.
        for partial_dir in ["tile/entries/000.p", "tile/0/000.p"] {
            let mut relinked = 0;
            for entry in std::fs::read_dir(dir.path().join(partial_dir)).unwrap() {
                let path = entry.unwrap().path();
                assert!(path.symlink_metadata().unwrap().file_type().is_symlink());
                relinked += 1;
            }
            assert_eq!(relinked, 255, "{partial_dir}");
        }
        assert_eq!(storage.read_entry_bundle(0, 17).unwrap(), bundle);

        let (size, root) = storage.core.read_tree_state().unwrap().unwrap();
        assert_eq!(size, 256);
        assert_eq!(root, merkle::reference_root(&data));
    }

    #[tokio::test]
    async fn test_partial_then_full() {
        let dir = TempDir::new().unwrap();
        let config = test_config().batch_max_size(512);
        let storage = Storage::new(dir.path(), true, config).unwrap();

        let futures: Vec<_> = (0..200)
            .map(|i| storage.add(PlainEntry::new(entry_data(i))))
            .collect();
        for f in futures {
            f.await.unwrap();
        }
        let partial = storage.read_entry_bundle(0, 200).unwrap();
        assert_eq!(bundle_leaf_hashes(&partial).unwrap().len(), 200);

        let futures: Vec<_> = (200..300)
            .map(|i| storage.add(PlainEntry::new(entry_data(i))))
            .collect();
        for f in futures {
            f.await.unwrap();
        }

        let full = storage.read_entry_bundle(0, 0).unwrap();
        assert_eq!(bundle_leaf_hashes(&full).unwrap().len(), 256);
        let tail = storage.read_entry_bundle(1, 44).unwrap();
        assert_eq!(bundle_leaf_hashes(&tail).unwrap().len(), 44);

        // The superseded partial path resolves to the full bundle.
        assert_eq!(storage.read_entry_bundle(0, 200).unwrap(), full);

        let (size, root) = storage.core.read_tree_state().unwrap().unwrap();
        assert_eq!(size, 300);
        let data: Vec<_> = (0..300).map(entry_data).collect();
        assert_eq!(root, merkle::reference_root(&data));
    }

    #[tokio::test]
    async fn test_two_instances_interleave() {
        let dir = TempDir::new().unwrap();
        let a = Storage::new(dir.path(), true, test_config()).unwrap();
        let b = Storage::new(dir.path(), false, test_config()).unwrap();

        let futures: Vec<_> = (0..128)
            .flat_map(|i| {
                vec![
                    (
                        entry_data(1000 + i),
                        a.add(PlainEntry::new(entry_data(1000 + i))),
                    ),
                    (
                        entry_data(2000 + i),
                        b.add(PlainEntry::new(entry_data(2000 + i))),
                    ),
                ]
            })
            .collect();

        let mut by_index = std::collections::BTreeMap::new();
        for (data, f) in futures {
            let index = f.await.unwrap();
            // Every sequence number is assigned exactly once.
            assert!(by_index.insert(index, data).is_none(), "index {index} reused");
        }
        assert_eq!(by_index.len(), 256);
        assert_eq!(*by_index.keys().last().unwrap(), 255);

        let committed: Vec<_> = by_index.into_values().collect();
        let (size, root) = a.core.read_tree_state().unwrap().unwrap();
        assert_eq!(size, 256);
        assert_eq!(root, merkle::reference_root(&committed));
    }

    #[tokio::test]
    async fn test_reopen_resumes_sequencing() {
        let dir = TempDir::new().unwrap();
        {
            let storage = Storage::new(dir.path(), true, test_config()).unwrap();
            for i in 0..10 {
                storage.add(PlainEntry::new(entry_data(i))).await.unwrap();
            }
            storage.shutdown().await.unwrap();
        }

        let storage = Storage::new(dir.path(), false, test_config()).unwrap();
        let index = storage.add(PlainEntry::new(entry_data(10))).await.unwrap();
        assert_eq!(index, 10);
    }

    #[tokio::test]
    async fn test_recovers_from_orphaned_bundle() {
        // Simulate a crash between a bundle write and the tree state
        // write: the orphaned bundle beyond `size` is simply rewritten by
        // the next sequencing cycle.
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path(), true, test_config()).unwrap();
        for i in 0..5 {
            storage.add(PlainEntry::new(entry_data(i))).await.unwrap();
        }

        // An orphaned, larger partial bundle that the "crashed" process
        // wrote before dying.
        let mut orphan = storage.read_entry_bundle(0, 5).unwrap();
        orphan.extend(PlainEntry::new(b"orphan".to_vec()).marshal_bundle(5));
        storage.core.write_bundle(0, 6, &orphan).unwrap();

        // Tree state still says 5, so the next entry is sequenced at 5 and
        // overwrites the orphan with identical framing.
        let index = storage.add(PlainEntry::new(entry_data(5))).await.unwrap();
        assert_eq!(index, 5);
        let bundle = storage.read_entry_bundle(0, 6).unwrap();
        let hashes = bundle_leaf_hashes(&bundle).unwrap();
        assert_eq!(hashes.len(), 6);
        assert_eq!(hashes[5], merkle::leaf_hash(&entry_data(5)));

        let (size, root) = storage.core.read_tree_state().unwrap().unwrap();
        assert_eq!(size, 6);
        let data: Vec<_> = (0..6).map(entry_data).collect();
        assert_eq!(root, merkle::reference_root(&data));
    }

    #[tokio::test]
    async fn test_checkpoint_throttling() {
        let dir = TempDir::new().unwrap();
        let publishes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&publishes);
        let config = Config::default()
            .batch_max_age(Duration::from_millis(10))
            .checkpoint_interval(Duration::from_secs(2))
            .new_checkpoint(move |size, _root| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("size {size}\n").into_bytes())
            });
        let storage = Storage::new(dir.path(), true, config).unwrap();
        assert_eq!(publishes.load(Ordering::SeqCst), 1);

        // A burst of adds within the staleness window must not produce a
        // burst of checkpoint rewrites.
        for i in 0..10 {
            storage.add(PlainEntry::new(entry_data(i))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(publishes.load(Ordering::SeqCst), 1);
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mirrored_log_never_publishes() {
        let dir = TempDir::new().unwrap();
        let config = Config::default().batch_max_age(Duration::from_millis(10));
        let storage = Storage::new(dir.path(), true, config).unwrap();
        storage.add(PlainEntry::new(b"A".to_vec())).await.unwrap();

        match storage.read_checkpoint() {
            Err(Error::IO(_)) => {}
            other => panic!("mirrored log published a checkpoint: {other:?}"),
        }
    }
}
