//! Optimistic update tracking.
//!
//! The UI applies a mutation locally before the task store confirms it.
//! [`OptimisticTracker`] remembers, per attempt, what the state looked like
//! before the local apply so a failed store call can be undone exactly.
//!
//! Each [`TrackingId`] ends in exactly one of three ways:
//!
//! | Event | Effect |
//! |---|---|
//! | [`confirm_update`](OptimisticTracker::confirm_update) | `on_success(server_data)`, entry removed |
//! | [`rollback_update`](OptimisticTracker::rollback_update) | `on_error(error, original)`, original returned, entry removed |
//! | expiry | entry removed; under [`ExpiryPolicy::Rollback`] also `on_error` |
//!
//! Anything arriving after the entry is gone is a silent no-op. Expiry only
//! frees bookkeeping; it does not cancel the underlying store call. Under
//! [`ExpiryPolicy::Discard`] the payloads are dropped at once; under
//! [`ExpiryPolicy::Rollback`] they are held until
//! [`expire_stale`](OptimisticTracker::expire_stale) or
//! [`forget`](OptimisticTracker::forget) takes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::OptimisticConfig;
use crate::error::ErrorCode;
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Identifiers and policy
// ---------------------------------------------------------------------------

/// Opaque handle tying a local change to its eventual server outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(String);

impl TrackingId {
    /// `opt-<unix millis>-<8 hex chars>`. Unique within a session, not
    /// cryptographically.
    #[must_use]
    pub fn generate(now: DateTime<Utc>) -> Self {
        Self(format!(
            "opt-{}-{:08x}",
            now.timestamp_millis(),
            rand::random::<u32>()
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackingId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TrackingId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happens when a pending update outlives the expiry window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryPolicy {
    /// Drop the bookkeeping only. The UI keeps showing the desired state.
    #[default]
    Discard,
    /// Treat expiry as a failure: fire `on_error` and hand the original
    /// back through [`OptimisticTracker::expire_stale`] for restoration.
    Rollback,
}

/// Error delivered to `on_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("change {tracking_id} was not confirmed within {after_secs}s")]
    Expired {
        tracking_id: TrackingId,
        after_secs: i64,
    },
}

impl UpdateError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Store(err) => err.code(),
            Self::Expired { .. } => ErrorCode::PendingUpdateExpired,
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks and entries
// ---------------------------------------------------------------------------

type SuccessFn<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorFn<T> = Box<dyn FnOnce(&UpdateError, &T) + Send>;

/// Optional hooks fired on the terminal event of a tracked update.
pub struct UpdateCallbacks<T> {
    on_success: Option<SuccessFn<T>>,
    on_error: Option<ErrorFn<T>>,
}

impl<T> UpdateCallbacks<T> {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }

    /// Called with the server's authoritative data on confirm.
    #[must_use]
    pub fn on_success(mut self, f: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Called with the failure and the original snapshot on rollback.
    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(&UpdateError, &T) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl<T> Default for UpdateCallbacks<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> fmt::Debug for UpdateCallbacks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// A local mutation shown ahead of server confirmation.
///
/// Immutable once tracked; it leaves the tracker only by removal.
#[derive(Debug)]
pub struct PendingUpdate<T> {
    tracking_id: TrackingId,
    original: T,
    desired: T,
    created_at: DateTime<Utc>,
    callbacks: UpdateCallbacks<T>,
}

impl<T> PendingUpdate<T> {
    #[must_use]
    pub const fn tracking_id(&self) -> &TrackingId {
        &self.tracking_id
    }

    #[must_use]
    pub const fn original(&self) -> &T {
        &self.original
    }

    #[must_use]
    pub const fn desired(&self) -> &T {
        &self.desired
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// An entry expired under [`ExpiryPolicy::Rollback`], waiting for the
/// caller to restore `original`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredUpdate<T> {
    pub tracking_id: TrackingId,
    pub original: T,
    pub desired: T,
}

// ---------------------------------------------------------------------------
// OptimisticTracker
// ---------------------------------------------------------------------------

/// Pending optimistic updates keyed by tracking id.
///
/// Single owner; all mutation goes through `&mut self`.
#[derive(Debug)]
pub struct OptimisticTracker<T> {
    pending: HashMap<TrackingId, PendingUpdate<T>>,
    /// Rolled-back entries swept during another call, waiting for
    /// `expire_stale`. Always empty under `Discard`.
    swept: Vec<ExpiredUpdate<T>>,
    clock: Arc<dyn Clock>,
    expiry: chrono::Duration,
    policy: ExpiryPolicy,
}

impl<T: Clone> OptimisticTracker<T> {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: &OptimisticConfig) -> Self {
        let expiry =
            chrono::Duration::from_std(config.expiry()).unwrap_or_else(|_| chrono::Duration::weeks(52));
        Self {
            pending: HashMap::new(),
            swept: Vec::new(),
            clock,
            expiry,
            policy: config.on_expiry,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    #[must_use]
    pub fn generate_tracking_id(&self) -> TrackingId {
        TrackingId::generate(self.clock.now())
    }

    /// Start tracking a local change. Re-using a live id replaces the old
    /// entry without firing its callbacks.
    pub fn track_update(
        &mut self,
        tracking_id: TrackingId,
        original: T,
        desired: T,
        callbacks: UpdateCallbacks<T>,
    ) {
        self.sweep();
        let entry = PendingUpdate {
            tracking_id: tracking_id.clone(),
            original,
            desired,
            created_at: self.clock.now(),
            callbacks,
        };
        if self.pending.insert(tracking_id.clone(), entry).is_some() {
            tracing::warn!(%tracking_id, "tracking id reused; previous pending update dropped");
        }
    }

    /// The server accepted the change. Returns whether anything was pending.
    pub fn confirm_update(&mut self, tracking_id: &TrackingId, server_data: &T) -> bool {
        self.sweep();
        let Some(entry) = self.pending.remove(tracking_id) else {
            tracing::debug!(%tracking_id, "confirm for unknown tracking id ignored");
            return false;
        };
        if let Some(on_success) = entry.callbacks.on_success {
            on_success(server_data);
        }
        true
    }

    /// The server refused the change. Returns the snapshot to restore, or
    /// `None` when there is nothing to restore.
    pub fn rollback_update(&mut self, tracking_id: &TrackingId, error: &UpdateError) -> Option<T> {
        self.sweep();
        let Some(entry) = self.pending.remove(tracking_id) else {
            tracing::debug!(%tracking_id, "rollback for unknown tracking id ignored");
            return None;
        };
        if let Some(on_error) = entry.callbacks.on_error {
            on_error(error, &entry.original);
        }
        Some(entry.original)
    }

    #[must_use]
    pub fn is_pending(&self, tracking_id: &TrackingId) -> bool {
        self.live(tracking_id).is_some()
    }

    #[must_use]
    pub fn original_data(&self, tracking_id: &TrackingId) -> Option<&T> {
        self.live(tracking_id).map(PendingUpdate::original)
    }

    #[must_use]
    pub fn desired_data(&self, tracking_id: &TrackingId) -> Option<&T> {
        self.live(tracking_id).map(PendingUpdate::desired)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        let now = self.clock.now();
        self.pending
            .values()
            .filter(|entry| !self.is_expired(entry, now))
            .count()
    }

    /// Remove every entry past the expiry window and apply the expiry
    /// policy. Returns the rolled-back entries, including ones swept by
    /// earlier calls; empty under [`ExpiryPolicy::Discard`].
    pub fn expire_stale(&mut self) -> Vec<ExpiredUpdate<T>> {
        self.sweep();
        std::mem::take(&mut self.swept)
    }

    /// Drop a rolled-back entry that has not been collected yet, because
    /// its outcome arrived and was handled after all. Returns whether one
    /// was held.
    pub fn forget(&mut self, tracking_id: &TrackingId) -> bool {
        self.sweep();
        let before = self.swept.len();
        self.swept.retain(|entry| entry.tracking_id != *tracking_id);
        before != self.swept.len()
    }

    /// Drop all bookkeeping without firing callbacks.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.swept.clear();
    }

    fn live(&self, tracking_id: &TrackingId) -> Option<&PendingUpdate<T>> {
        let now = self.clock.now();
        self.pending
            .get(tracking_id)
            .filter(|entry| !self.is_expired(entry, now))
    }

    fn is_expired(&self, entry: &PendingUpdate<T>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.created_at) >= self.expiry
    }

    fn sweep(&mut self) {
        let now = self.clock.now();
        let stale: Vec<TrackingId> = self
            .pending
            .values()
            .filter(|entry| self.is_expired(entry, now))
            .map(|entry| entry.tracking_id.clone())
            .collect();

        for tracking_id in stale {
            let Some(entry) = self.pending.remove(&tracking_id) else {
                continue;
            };
            if self.policy == ExpiryPolicy::Discard {
                tracing::debug!(%tracking_id, "pending update expired; bookkeeping discarded");
                continue;
            }

            tracing::info!(%tracking_id, "pending update expired; rolling back");
            if let Some(on_error) = entry.callbacks.on_error {
                let error = UpdateError::Expired {
                    tracking_id: tracking_id.clone(),
                    after_secs: self.expiry.num_seconds(),
                };
                on_error(&error, &entry.original);
            }
            self.swept.push(ExpiredUpdate {
                tracking_id,
                original: entry.original,
                desired: entry.desired,
            });
        }
    }
}
