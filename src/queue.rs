//! In-memory batching of `Add` calls ahead of the sequencer.
//!
//! A single consumer task collects entries into batches bounded by age and
//! size, then hands each batch to the sequencing function on the blocking
//! thread pool. Arrival order is preserved, so the indices assigned to a
//! batch are `first..first + len` in the order the entries were queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tokio::time::{timeout_at, Instant};

use crate::entry::Entry;
use crate::error::{Error, Result};

/// Resolves to the sequence number assigned to an added entry, or to the
/// error that failed its batch. Dropping the queue before the entry is
/// flushed resolves the future with [`Error::Cancelled`].
pub struct IndexFuture {
    rx: oneshot::Receiver<Result<u64>>,
}

impl Future for IndexFuture {
    type Output = Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Item {
    entry: Box<dyn Entry>,
    done: oneshot::Sender<Result<u64>>,
}

/// Batches entries and drives the sequencing function.
pub struct Queue {
    tx: mpsc::UnboundedSender<Item>,
}

impl Queue {
    /// Spawns the consumer task. `sequence` persists a batch and returns
    /// the index assigned to its first entry; it runs on the blocking
    /// thread pool. Must be called within a tokio runtime.
    pub fn new<S>(max_age: Duration, max_size: usize, sequence: S) -> Self
    where
        S: Fn(Vec<Box<dyn Entry>>) -> Result<u64> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, max_age, max_size, Arc::new(sequence)));
        Self { tx }
    }

    /// Queues an entry, returning the future for its assigned index.
    /// Entries queued later resolve to strictly greater indices.
    pub fn add(&self, entry: Box<dyn Entry>) -> IndexFuture {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(item)) = self.tx.send(Item { entry, done }) {
            let _ = item.done.send(Err(Error::Cancelled));
        }
        IndexFuture { rx }
    }
}

async fn run<S>(
    mut rx: mpsc::UnboundedReceiver<Item>,
    max_age: Duration,
    max_size: usize,
    sequence: Arc<S>,
) where
    S: Fn(Vec<Box<dyn Entry>>) -> Result<u64> + Send + Sync + 'static,
{
    loop {
        // Block for the first entry, then fill the batch until either
        // bound is hit.
        let Some(first) = rx.recv().await else { return };
        let mut batch = vec![first];
        let deadline = Instant::now() + max_age;
        let mut closed = false;
        while batch.len() < max_size {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break, // batch aged out
            }
        }
        flush(batch, &sequence).await;
        if closed {
            return;
        }
    }
}

async fn flush<S>(batch: Vec<Item>, sequence: &Arc<S>)
where
    S: Fn(Vec<Box<dyn Entry>>) -> Result<u64> + Send + Sync + 'static,
{
    let mut entries = Vec::with_capacity(batch.len());
    let mut dones = Vec::with_capacity(batch.len());
    for item in batch {
        entries.push(item.entry);
        dones.push(item.done);
    }

    let sequence = Arc::clone(sequence);
    let result = match task::spawn_blocking(move || sequence(entries)).await {
        Ok(result) => result,
        Err(e) => Err(e.into()),
    };

    // The batch is atomic: every future resolves to its index, or every
    // future resolves to the batch's error.
    match result {
        Ok(first) => {
            for (i, done) in dones.into_iter().enumerate() {
                let _ = done.send(Ok(first + i as u64));
            }
        }
        Err(e) => {
            for done in dones {
                let _ = done.send(Err(e.clone()));
            }
        }
    }
}
