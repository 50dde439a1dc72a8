//! Shared ledger context and the per-student mutual exclusion registry.
//!
//! Every public engine operation receives a [`LedgerContext`]. Operations that
//! read and then rewrite a student's package hours or class linkage hold that
//! student's lock from [`StudentLocks`] for their whole transaction.

use crate::{config::billing::BillingSettings, core::notification::NotificationDispatcher};
use sea_orm::DatabaseConnection;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed async mutex: one lock per student id.
///
/// Locks are not re-entrant. Public operations acquire them; the
/// connection-generic helpers they call never do. A student's entry is
/// removed once the last guard is released and nobody is waiting for it.
#[derive(Debug, Clone, Default)]
pub struct StudentLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl StudentLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to the student's ledger.
    pub async fn acquire(&self, student_id: i64) -> StudentGuard {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(student_id).or_default())
        };
        StudentGuard {
            student_id,
            guard: Some(lock.lock_owned().await),
            registry: Arc::clone(&self.inner),
        }
    }

    /// Number of students with a held or awaited lock.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive access to one student's ledger, released on drop.
#[derive(Debug)]
pub struct StudentGuard {
    student_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
    registry: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl Drop for StudentGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the registry still references the mutex: no holder, no waiter
        if locks
            .get(&self.student_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.student_id);
        }
    }
}

/// Everything an engine operation needs besides its arguments.
pub struct LedgerContext {
    /// Database connection for all ledger reads and writes
    pub database: DatabaseConnection,
    /// Outbound channel for payment requests
    pub notifier: Arc<dyn NotificationDispatcher>,
    /// Per-student mutual exclusion
    pub locks: StudentLocks,
    /// Billing defaults and payment URL settings
    pub settings: BillingSettings,
}

impl LedgerContext {
    /// Creates a context with a fresh lock registry.
    #[must_use]
    pub fn new(
        database: DatabaseConnection,
        notifier: Arc<dyn NotificationDispatcher>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            database,
            notifier,
            locks: StudentLocks::new(),
            settings,
        }
    }
}
