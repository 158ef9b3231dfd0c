//! Unbounded single-consumer ingest queue between the host's event dispatch
//! and an upload worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn ingest_queue<T>() -> (IngestSender<T>, IngestReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicU64::new(0));
    (
        IngestSender {
            tx,
            depth: depth.clone(),
        },
        IngestReceiver { rx, depth },
    )
}

pub struct IngestSender<T> {
    tx: mpsc::UnboundedSender<T>,
    depth: Arc<AtomicU64>,
}

// Derived Clone would require `T: Clone`.
impl<T> Clone for IngestSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> IngestSender<T> {
    /// Never blocks. Returns whether the record was accepted; a closed queue
    /// drops the record and logs.
    pub fn enqueue(&self, record: T) -> bool {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(record).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!("ingest queue closed; dropping record");
            return false;
        }
        true
    }

    /// Records waiting to be drained.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct IngestReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    depth: Arc<AtomicU64>,
}

impl<T> IngestReceiver<T> {
    /// Waits until at least one record is queued, then takes every queued
    /// record in arrival order. `None` once all senders are gone and the queue
    /// is empty.
    pub async fn drain_blocking(&mut self) -> Option<Vec<T>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while let Ok(record) = self.rx.try_recv() {
            batch.push(record);
        }
        self.depth.fetch_sub(batch.len() as u64, Ordering::Relaxed);
        Some(batch)
    }
}
