//! Per-chain execution queues, one per submitting identity.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Result, anyhow};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::message::Signed;

/// The producer side of every transactor queue of one chain. Each queue has exactly one consumer, its
/// [TransactorQueue], so submissions from one identity never race each other for a nonce.
#[derive(Debug)]
pub struct TransactorPool {
    queues: Vec<(UnboundedSender<Signed>, Arc<AtomicUsize>)>,
    next: AtomicUsize,
}

#[derive(Debug)]
pub struct TransactorQueue {
    pub index: usize,
    receiver: UnboundedReceiver<Signed>,
    depth: Arc<AtomicUsize>,
}

impl TransactorQueue {
    /// Waits for the next message. Returns `None` once the pool is dropped.
    pub async fn recv(&mut self) -> Option<Signed> {
        let message = self.receiver.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(message)
    }
}

impl TransactorPool {
    pub fn new(size: usize) -> (TransactorPool, Vec<TransactorQueue>) {
        let (queues, receivers) = (0..size)
            .map(|index| {
                let (sender, receiver) = mpsc::unbounded_channel();
                let depth = Arc::new(AtomicUsize::new(0));
                (
                    (sender, depth.clone()),
                    TransactorQueue {
                        index,
                        receiver,
                        depth,
                    },
                )
            })
            .unzip();
        let pool = TransactorPool {
            queues,
            next: AtomicUsize::new(0),
        };
        (pool, receivers)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Round robin over `[0, len)`, starting at 0.
    fn next_index(&self) -> Option<usize> {
        if self.queues.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len())
    }

    /// Puts `message` on the next transactor's queue and returns that transactor's index.
    pub fn enqueue(&self, message: Signed) -> Result<usize> {
        let index = self
            .next_index()
            .ok_or_else(|| anyhow!("no transactors configured"))?;
        let (sender, depth) = &self.queues[index];
        depth.fetch_add(1, Ordering::Relaxed);
        if sender.send(message).is_err() {
            depth.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow!("queue of transactor {index} is closed"));
        }
        Ok(index)
    }

    /// Messages waiting across all queues.
    pub fn queued(&self) -> usize {
        self.queues
            .iter()
            .map(|(_, depth)| depth.load(Ordering::Relaxed))
            .sum()
    }
}
