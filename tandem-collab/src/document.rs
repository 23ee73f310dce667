//! Document capability: opaque CRDT state with origin-tagged notifications.
//!
//! The relay and the client controller never look inside a document. They
//! only exchange three opaque byte strings with it:
//!
//! ```text
//!            state_vector()                 compute_delta(peer)
//!  Document ───────────────► VersionVector ─────────────────────► Delta
//!     ▲                                                             │
//!     └──────────────── apply_delta(delta, origin) ◄────────────────┘
//!                               │
//!                               ▼
//!                 subscribers (delta, origin)
//! ```
//!
//! Every notification carries the [`Origin`] of the transaction that caused
//! it, so echo suppression is a plain equality check on the receiving side.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, MapRef, ReadTxn, StateVector, Transact, Transaction, TransactionMut, Update};

use crate::registry::SessionId;

/// v1 encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

/// Opaque descriptor of the operations a replica already knows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VersionVector(Vec<u8>);

impl VersionVector {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for VersionVector {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for VersionVector {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Opaque encoding of operations some peer may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Delta(Vec<u8>);

impl Delta {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the delta carries no operations.
    ///
    /// This is semantic emptiness: a diff against an up-to-date peer still
    /// encodes a (zero) struct count and an empty delete set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0 == EMPTY_UPDATE_V1
    }
}

impl From<Vec<u8>> for Delta {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Delta {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Who caused a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Edit made by the local application.
    Local,
    /// Delta received from the network on the client side.
    Remote,
    /// Delta received from a relay session.
    Session(SessionId),
}

/// Document errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("invalid version vector: {0}")]
    InvalidVersionVector(String),
    #[error("invalid delta: {0}")]
    InvalidDelta(String),
    #[error("delta rejected: {0}")]
    Apply(String),
}

/// Mutation callback: receives the integrated delta and its origin.
pub type UpdateCallback = Box<dyn Fn(&Delta, &Origin) + Send + Sync>;

type SharedCallback = Arc<dyn Fn(&Delta, &Origin) + Send + Sync>;

/// The CRDT capability consumed by the relay and the client controller.
pub trait Document: Send + Sync + 'static {
    /// Version vector of everything this replica knows.
    fn state_vector(&self) -> VersionVector;

    /// Operations known here but not covered by `peer`. May be empty.
    fn compute_delta(&self, peer: &VersionVector) -> Result<Delta, DocumentError>;

    /// Integrate `delta`, tagging the resulting notification with `origin`.
    fn apply_delta(&self, delta: &Delta, origin: Origin) -> Result<(), DocumentError>;

    /// Register a mutation callback. It stays registered until the returned
    /// handle is released.
    fn subscribe(&self, callback: UpdateCallback) -> Subscription;

    /// Release a subscription handle.
    fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, SharedCallback)>,
}

/// Registered mutation callbacks of one document.
#[derive(Default)]
pub struct SubscriberList {
    inner: Arc<Mutex<Subscribers>>,
}

impl SubscriberList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: UpdateCallback) -> Subscription {
        let mut subs = lock(&self.inner);
        let id = subs.next_id;
        subs.next_id += 1;
        subs.entries.push((id, Arc::from(callback)));
        Subscription {
            id,
            list: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every callback. Callbacks run outside the list lock, so they
    /// may subscribe or release handles themselves.
    pub fn notify(&self, delta: &Delta, origin: &Origin) {
        let callbacks: Vec<SharedCallback> = lock(&self.inner)
            .entries
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(delta, origin);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for a registered callback.
///
/// Move-only: releasing it (via [`Document::unsubscribe`] or by dropping it)
/// unregisters the callback exactly once.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    id: u64,
    list: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            lock(&list).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Yrs-backed document.
pub struct YDocument {
    doc: Doc,
    subscribers: SubscriberList,
}

impl YDocument {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            subscribers: SubscriberList::new(),
        }
    }

    /// Root-level map shared by every replica under `name`.
    ///
    /// Must not be called while a transaction from [`Self::transact`] is open.
    pub fn map(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    /// Run a read-only transaction.
    pub fn read<R>(&self, f: impl FnOnce(&Transaction<'_>) -> R) -> R {
        let txn = self.doc.transact();
        f(&txn)
    }

    /// Run a local edit. Subscribers see it with [`Origin::Local`].
    pub fn transact<R>(&self, f: impl FnOnce(&mut TransactionMut<'_>) -> R) -> R {
        self.transact_with(Origin::Local, f)
    }

    /// Run an edit on behalf of `origin`.
    pub fn transact_with<R>(
        &self,
        origin: Origin,
        f: impl FnOnce(&mut TransactionMut<'_>) -> R,
    ) -> R {
        let (result, update) = {
            let mut txn = self.doc.transact_mut();
            let result = f(&mut txn);
            (result, txn.encode_update_v1())
        };
        self.publish(Delta::from(update), origin);
        result
    }

    /// Number of registered mutation callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    // Transactions that changed nothing are not mutations.
    fn publish(&self, delta: Delta, origin: Origin) {
        if delta.is_empty() {
            return;
        }
        self.subscribers.notify(&delta, &origin);
    }
}

impl Default for YDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Document for YDocument {
    fn state_vector(&self) -> VersionVector {
        let txn = self.doc.transact();
        VersionVector::from(txn.state_vector().encode_v1())
    }

    fn compute_delta(&self, peer: &VersionVector) -> Result<Delta, DocumentError> {
        let remote_sv = StateVector::decode_v1(peer.as_bytes())
            .map_err(|e| DocumentError::InvalidVersionVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(Delta::from(txn.encode_diff_v1(&remote_sv)))
    }

    fn apply_delta(&self, delta: &Delta, origin: Origin) -> Result<(), DocumentError> {
        let update = Update::decode_v1(delta.as_bytes())
            .map_err(|e| DocumentError::InvalidDelta(e.to_string()))?;
        let integrated = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
            txn.encode_update_v1()
        };
        self.publish(Delta::from(integrated), origin);
        Ok(())
    }

    fn subscribe(&self, callback: UpdateCallback) -> Subscription {
        self.subscribers.subscribe(callback)
    }
}
