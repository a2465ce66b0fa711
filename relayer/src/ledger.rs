//! Shared, concurrently updated state keyed by source transaction hash.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use alloy::primitives::{Address, Bytes, TxHash};
use dashmap::{DashMap, mapref::entry::Entry};

/// Identifies one holder of an [ExecutedSet] entry. A reset followed by a new claim yields a new id, so a
/// stale holder can tell its claim was taken away.
pub type ClaimId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Execution {
    /// Some handler is verifying or executing the hash.
    Pending(ClaimId),
    /// The message reached a terminal state. Holds the claim that got it there, if it was a local one.
    Done(Option<ClaimId>),
    /// Some node reported an execution on chain.
    Executed,
}

/// Records which transaction hashes are being worked on or have finished.
///
/// One set is shared by every chain driver on a node, since the hash of a source transaction is unique
/// across chains.
#[derive(Debug, Default)]
pub struct ExecutedSet {
    entries: DashMap<TxHash, Execution>,
    next_claim: AtomicU64,
}

impl ExecutedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims `hash` if nobody holds it yet.
    pub fn claim(&self, hash: TxHash) -> Option<ClaimId> {
        match self.entries.entry(hash) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
                entry.insert(Execution::Pending(id));
                Some(id)
            }
        }
    }

    /// Whether `claim` is still the live claim on `hash`. This stays true after the holder marks the
    /// hash done and becomes false once the hash is reset.
    pub fn holds(&self, hash: TxHash, claim: ClaimId) -> bool {
        matches!(
            self.entries.get(&hash).map(|e| *e),
            Some(Execution::Pending(id)) | Some(Execution::Done(Some(id))) if id == claim
        )
    }

    pub fn contains(&self, hash: TxHash) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn is_done(&self, hash: TxHash) -> bool {
        matches!(
            self.entries.get(&hash).map(|e| *e),
            Some(Execution::Done(_) | Execution::Executed)
        )
    }

    /// Moves `hash` into the terminal state. Returns `false` if it already was there, so exactly one
    /// caller wins the right to act on a message.
    pub fn mark_done(&self, hash: TxHash) -> bool {
        match self.entries.entry(hash) {
            Entry::Occupied(mut entry) => match *entry.get() {
                Execution::Done(_) | Execution::Executed => false,
                Execution::Pending(id) => {
                    entry.insert(Execution::Done(Some(id)));
                    true
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(Execution::Done(None));
                true
            }
        }
    }

    /// Records that the message was executed on chain. Returns `false` if that was already known.
    pub fn mark_executed(&self, hash: TxHash) -> bool {
        self.entries.insert(hash, Execution::Executed) != Some(Execution::Executed)
    }

    /// Forgets `hash` unless its execution was already reported, in which case there is nothing left to
    /// retry. Returns whether the hash was forgotten.
    pub fn release(&self, hash: TxHash) -> bool {
        self.entries
            .remove_if(&hash, |_, execution| *execution != Execution::Executed)
            .is_some()
    }

    /// Forgets `hash`. Returns whether there was anything to forget.
    pub fn reset(&self, hash: TxHash) -> bool {
        self.entries.remove(&hash).is_some()
    }
}

/// Signatures collected per transaction hash, one per signer.
#[derive(Debug, Default)]
pub struct SignatureLedger {
    baskets: DashMap<TxHash, BTreeMap<Address, Bytes>>,
}

impl SignatureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `signer`'s signature for `hash`, replacing any earlier one from the same signer, and returns a
    /// snapshot of the basket ordered by signer address.
    pub fn record(
        &self,
        hash: TxHash,
        signer: Address,
        signature: Bytes,
    ) -> (Vec<Address>, Vec<Bytes>) {
        let mut basket = self.baskets.entry(hash).or_default();
        basket.insert(signer, signature);
        basket
            .iter()
            .map(|(signer, signature)| (*signer, signature.clone()))
            .unzip()
    }
}
