//! Entity store -- the single source of truth for anomalies on the client.
//!
//! The store holds an immutable, versioned [`Snapshot`] behind a
//! [`tokio::sync::watch`] channel. Every write builds a fresh list and swaps it
//! in under the channel's lock, so a write is observed either entirely or not
//! at all, and snapshots handed out earlier are never affected by later writes.
//! Subscribers are woken on every effective write.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::model::{Anomaly, AnomalyPatch};

/// A point-in-time view of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Monotonic write counter. Bumped by every effective write, including restores.
    pub version: u64,
    pub anomalies: Arc<Vec<Anomaly>>,
}

impl Snapshot {
    pub fn find(&self, id: &str) -> Option<&Anomaly> {
        self.anomalies.iter().find(|a| a.id == id)
    }
}

/// Shared handle to the anomaly cache. Cloning yields another handle to the
/// same store.
#[derive(Clone)]
pub struct EntityStore {
    inner: Arc<watch::Sender<Snapshot>>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot {
            version: 0,
            anomalies: Arc::new(Vec::new()),
        });
        Self { inner: Arc::new(tx) }
    }

    /// Build a store pre-populated with `anomalies`.
    pub fn with_anomalies(anomalies: Vec<Anomaly>) -> Self {
        let store = Self::new();
        store.set(anomalies);
        store
    }

    /// Current list of anomalies.
    pub fn get(&self) -> Arc<Vec<Anomaly>> {
        Arc::clone(&self.inner.borrow().anomalies)
    }

    /// Current snapshot, including its version.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    pub fn find(&self, id: &str) -> Option<Anomaly> {
        self.inner.borrow().find(id).cloned()
    }

    /// Receive a notification after every effective write.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.subscribe()
    }

    /// Replace the whole content. Duplicate ids collapse onto the first
    /// position, keeping the last record seen for that id.
    pub fn set(&self, anomalies: Vec<Anomaly>) {
        let mut deduped: Vec<Anomaly> = Vec::with_capacity(anomalies.len());
        for anomaly in anomalies {
            match deduped.iter_mut().find(|a| a.id == anomaly.id) {
                Some(existing) => {
                    warn!(anomaly_id = %anomaly.id, "duplicate anomaly id in store replace");
                    *existing = anomaly;
                }
                None => deduped.push(anomaly),
            }
        }

        self.inner.send_modify(|snap| {
            snap.version += 1;
            snap.anomalies = Arc::new(deduped);
            debug!(version = snap.version, count = snap.anomalies.len(), "store replaced");
        });
    }

    /// Patch the record with `id`, returning the snapshot as it was before the
    /// patch. A no-op (and no version bump) when `id` is absent.
    pub fn update_one(&self, id: &str, patch: &AnomalyPatch) -> Snapshot {
        self.apply_patch(id, patch).0
    }

    /// Like [`EntityStore::update_one`], additionally returning the version
    /// the store holds right after this call.
    pub(crate) fn apply_patch(&self, id: &str, patch: &AnomalyPatch) -> (Snapshot, u64) {
        let mut previous = None;
        let mut version = 0;
        self.inner.send_if_modified(|snap| {
            previous = Some(snap.clone());
            version = snap.version;

            let Some(idx) = snap.anomalies.iter().position(|a| a.id == id) else {
                debug!(anomaly_id = %id, "patch for unknown anomaly ignored");
                return false;
            };

            let mut next = snap.anomalies.as_ref().clone();
            next[idx] = patch.apply(&next[idx]);
            snap.anomalies = Arc::new(next);
            snap.version += 1;
            version = snap.version;
            true
        });

        // The closure always runs, so `previous` is always populated.
        let previous = previous.unwrap_or_else(|| self.snapshot());
        (previous, version)
    }

    /// Replace the content with a previously captured snapshot.
    pub fn restore(&self, snapshot: &Snapshot) {
        self.inner.send_modify(|snap| {
            snap.version += 1;
            snap.anomalies = Arc::clone(&snapshot.anomalies);
            debug!(
                version = snap.version,
                restored_from = snapshot.version,
                "store restored"
            );
        });
    }

    /// Restore `snapshot` only if the store is still at `expected_version`.
    /// Returns whether the restore happened.
    pub fn restore_if_unchanged(&self, snapshot: &Snapshot, expected_version: u64) -> bool {
        self.inner.send_if_modified(|snap| {
            if snap.version != expected_version {
                return false;
            }
            snap.version += 1;
            snap.anomalies = Arc::clone(&snapshot.anomalies);
            true
        })
    }
}
