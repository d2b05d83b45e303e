//! Weight Lock Coordinator
//!
//! Freezes the current weight while an external identity check completes a
//! transaction.
//!
//! ```text
//!              lock()                      begin_submission()
//!  Unlocked ───────────▶ Locked ─────────────────────────────▶ Locked+Submitting
//!     ▲                    │                                          │
//!     │     unlock(_)      │          finish_submission() /           │
//!     └────────────────────┴───────────── unlock(force = true) ───────┘
//! ```
//!
//! While locked, [`WeightLockCoordinator::submission_weight`] returns the
//! exact value stored by `lock()`. Nothing the scale sends can change it.

use crate::domain::errors::LockError;
use crate::domain::stream::{PauseSource, WeightStream};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Decimal places kept in a locked weight
pub const LOCK_PRECISION: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockState {
    pub locked_value_kg: f64,
    pub locked_at: DateTime<Utc>,
}

#[derive(Default)]
struct LockInner {
    lock: Option<LockState>,
    submitting: bool,
}

pub struct WeightLockCoordinator {
    stream: Arc<WeightStream>,
    inner: Mutex<LockInner>,
}

pub fn round_weight(value: f64) -> f64 {
    let factor = 10f64.powi(LOCK_PRECISION);
    (value * factor).round() / factor
}

impl WeightLockCoordinator {
    pub fn new(stream: Arc<WeightStream>) -> Self {
        Self {
            stream,
            inner: Mutex::new(LockInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, LockInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Freeze the best current weight and pause delivery.
    ///
    /// Prefers the newest parsed reading (even one held back by throttling),
    /// then the last delivered one. Locking twice returns the value already
    /// locked.
    pub fn lock(&self) -> Result<f64, LockError> {
        let mut inner = self.inner();
        if let Some(existing) = inner.lock {
            return Ok(existing.locked_value_kg);
        }

        // Rounding can take a tiny positive reading to zero, so filter after it
        let frozen = self.stream.freeze(|candidate| {
            candidate
                .map(|r| r.value_kg())
                .filter(|kg| kg.is_finite())
                .map(round_weight)
                .filter(|kg| *kg > 0.0)
        });

        let Some(locked_value_kg) = frozen else {
            warn!("Lock refused: no valid weight");
            return Err(LockError::NoValidWeight);
        };

        inner.lock = Some(LockState {
            locked_value_kg,
            locked_at: Utc::now(),
        });

        info!(kg = locked_value_kg, "Weight locked");
        Ok(locked_value_kg)
    }

    /// The weight a transaction must record.
    ///
    /// An explicit override (the value `lock()` just returned) wins, then the
    /// locked value, then the newest unlocked reading.
    pub fn submission_weight(&self, override_kg: Option<f64>) -> Option<f64> {
        if let Some(kg) = override_kg.filter(|kg| kg.is_finite()) {
            return Some(kg);
        }
        if let Some(lock) = self.inner().lock {
            return Some(lock.locked_value_kg);
        }
        self.stream
            .latest()
            .or_else(|| self.stream.last_delivered())
            .map(|r| r.value_kg())
    }

    /// Mark the start of the collaborator's commit. Requires a lock.
    pub fn begin_submission(&self) -> Result<f64, LockError> {
        let mut inner = self.inner();
        let lock = inner.lock.ok_or(LockError::NotLocked)?;
        inner.submitting = true;
        Ok(lock.locked_value_kg)
    }

    /// End of the commit, successful or not. Always releases the lock.
    pub fn finish_submission(&self) {
        self.release();
    }

    /// Release the lock. Refused during a submission unless `force`.
    pub fn unlock(&self, force: bool) -> Result<(), LockError> {
        {
            let inner = self.inner();
            if inner.submitting && !force {
                warn!("Unlock refused: submission in progress");
                return Err(LockError::LockedDuringSubmission);
            }
        }
        self.release();
        Ok(())
    }

    fn release(&self) {
        let released = {
            let mut inner = self.inner();
            inner.submitting = false;
            inner.lock.take()
        };
        // Resume even without a lock so a stray pause cannot wedge delivery
        self.stream.resume(PauseSource::Lock);
        if let Some(lock) = released {
            info!(kg = lock.locked_value_kg, "Weight unlocked");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner().lock.is_some()
    }

    pub fn is_submitting(&self) -> bool {
        self.inner().submitting
    }

    pub fn lock_state(&self) -> Option<LockState> {
        self.inner().lock
    }
}
