//! Capture coordinator -- optimistic update, confirmation or rollback, then
//! reconciliation.
//!
//! Each invocation walks the state machine
//!
//! ```text
//! Idle -> OptimisticApplied -> (Confirmed | RolledBack) -> Settled
//! ```
//!
//! and carries its own [`MutationContext`] captured at invocation time.
//! Captures of different ids run independently; a second capture of an id
//! that is still in flight is refused without touching the store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{ClientError, ValidationError};
use crate::gateway::AnomalyApi;
use crate::model::{Anomaly, AnomalyPatch, AnomalyStatus};
use crate::notify::{NotificationKind, NotificationSink};
use crate::store::{EntityStore, Snapshot};

/// Phase of a single capture invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MutationPhase {
    Idle,
    OptimisticApplied,
    Confirmed,
    RolledBack,
    Settled,
}

impl MutationPhase {
    pub fn can_advance_to(self, next: MutationPhase) -> bool {
        use MutationPhase::*;
        matches!(
            (self, next),
            (Idle, OptimisticApplied)
                | (OptimisticApplied, Confirmed)
                | (OptimisticApplied, RolledBack)
                | (Confirmed, Settled)
                | (RolledBack, Settled)
        )
    }
}

/// How a capture invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The server accepted the capture; the optimistic write stands.
    Confirmed(Anomaly),
    /// The capture failed and the optimistic write was undone.
    RolledBack(ClientError),
    /// A capture of the same id was already in flight. Nothing happened.
    AlreadyPending,
}

impl CaptureOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, CaptureOutcome::Confirmed(_))
    }
}

/// Rollback information for one in-flight capture.
#[derive(Debug)]
struct MutationContext {
    anomaly_id: String,
    /// Full store snapshot taken immediately before the optimistic write.
    snapshot: Snapshot,
    /// Store version produced by our own optimistic write.
    applied_version: u64,
    /// Status of the anomaly before the optimistic write, if it was present.
    prior_status: Option<AnomalyStatus>,
    phase: MutationPhase,
}

impl MutationContext {
    fn advance(&mut self, next: MutationPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal capture transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(anomaly_id = %self.anomaly_id, from = ?self.phase, to = ?next, "capture transition");
        self.phase = next;
    }
}

/// Removes the id from the in-flight set however the invocation ends.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    anomaly_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.anomaly_id);
    }
}

/// Executes the capture action against the store, the remote API and the
/// notification sink it was built with.
#[derive(Clone)]
pub struct CaptureCoordinator {
    store: EntityStore,
    api: Arc<dyn AnomalyApi>,
    sink: Arc<dyn NotificationSink>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl CaptureCoordinator {
    pub fn new(store: EntityStore, api: Arc<dyn AnomalyApi>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            api,
            sink,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Ids with a capture currently in flight.
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_pending(&self, anomaly_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(anomaly_id)
    }

    /// Capture `anomaly_id`.
    ///
    /// The store shows the anomaly as captured before the remote call is
    /// made. On any failure the write is undone and an error notification is
    /// emitted. Either way the store is then reconciled with a fresh fetch.
    pub async fn capture(&self, anomaly_id: &str) -> CaptureOutcome {
        let Some(_guard) = self.claim(anomaly_id) else {
            debug!(anomaly_id = %anomaly_id, "capture already in flight");
            return CaptureOutcome::AlreadyPending;
        };

        let mut ctx = self.apply_optimistic(anomaly_id);

        let outcome = match self.remote_capture(anomaly_id).await {
            Ok(anomaly) => {
                ctx.advance(MutationPhase::Confirmed);
                info!(anomaly_id = %anomaly_id, "capture confirmed");
                self.sink.notify(
                    NotificationKind::Success,
                    &format!("{} has been captured!", anomaly.name),
                );
                CaptureOutcome::Confirmed(anomaly)
            }
            Err(e) => {
                ctx.advance(MutationPhase::RolledBack);
                warn!(anomaly_id = %anomaly_id, error = %e, "capture failed, rolling back");
                self.rollback(&ctx);
                self.sink.notify(
                    NotificationKind::Error,
                    &format!("Failed to capture: {}", e.user_message()),
                );
                CaptureOutcome::RolledBack(e)
            }
        };

        ctx.advance(MutationPhase::Settled);
        self.reconcile().await;
        outcome
    }

    fn claim(&self, anomaly_id: &str) -> Option<InFlightGuard> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(anomaly_id.to_string());

        inserted.then(|| InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            anomaly_id: anomaly_id.to_string(),
        })
    }

    fn apply_optimistic(&self, anomaly_id: &str) -> MutationContext {
        let (snapshot, applied_version) = self
            .store
            .apply_patch(anomaly_id, &AnomalyPatch::status(AnomalyStatus::Captured));
        let prior_status = snapshot.find(anomaly_id).map(|a| a.status);

        let mut ctx = MutationContext {
            anomaly_id: anomaly_id.to_string(),
            snapshot,
            applied_version,
            prior_status,
            phase: MutationPhase::Idle,
        };
        ctx.advance(MutationPhase::OptimisticApplied);
        ctx
    }

    async fn remote_capture(&self, anomaly_id: &str) -> Result<Anomaly, ClientError> {
        let anomaly = self.api.capture(anomaly_id).await?;
        if anomaly.id != anomaly_id {
            return Err(ValidationError::new(
                "capture result",
                format!("expected anomaly '{}', got '{}'", anomaly_id, anomaly.id),
            )
            .into());
        }
        Ok(anomaly)
    }

    /// Undo the optimistic write.
    ///
    /// If nothing else wrote to the store since our optimistic write, the full
    /// pre-mutation snapshot is restored. Otherwise only the `status` of the
    /// captured id is put back, so interleaved writes survive.
    fn rollback(&self, ctx: &MutationContext) {
        if self.store.restore_if_unchanged(&ctx.snapshot, ctx.applied_version) {
            debug!(anomaly_id = %ctx.anomaly_id, "restored pre-capture snapshot");
            return;
        }

        match ctx.prior_status {
            Some(status) => {
                debug!(anomaly_id = %ctx.anomaly_id, "store moved on, reverting status only");
                self.store.update_one(&ctx.anomaly_id, &AnomalyPatch::status(status));
            }
            None => debug!(anomaly_id = %ctx.anomaly_id, "anomaly was not cached, nothing to revert"),
        }
    }

    async fn reconcile(&self) {
        match self.api.fetch_all().await {
            Ok(anomalies) => {
                debug!(count = anomalies.len(), "reconciled store after capture");
                self.store.set(anomalies);
            }
            Err(e) => warn!(error = %e, "reconciliation fetch failed, keeping local state"),
        }
    }
}
