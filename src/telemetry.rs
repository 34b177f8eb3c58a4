// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// [`Telemetry`] provides statistics data and aggregated views on the lock manager internals.
#[derive(Debug, Default)]
pub struct Telemetry {
    granted: AtomicU64,
    waited: AtomicU64,
    deadlocks: AtomicU64,
    interrupts: AtomicU64,
    timeouts: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    store_rollback_failures: AtomicU64,
}

/// A point-in-time copy of the [`Telemetry`] counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    /// Number of granted lock requests.
    pub granted: u64,

    /// Number of granted lock requests that had to wait.
    pub waited: u64,

    /// Number of transactions aborted as deadlock victims.
    pub deadlocks: u64,

    /// Number of lock requests aborted by an interrupt.
    pub interrupts: u64,

    /// Number of lock requests that timed out.
    pub timeouts: u64,

    /// Number of committed transactions.
    pub commits: u64,

    /// Number of rolled back transactions.
    pub rollbacks: u64,

    /// Number of store rollback calls that failed.
    pub store_rollback_failures: u64,
}

impl Telemetry {
    /// Takes a [`Statistics`] snapshot.
    ///
    /// The counters are read individually, and they are not guaranteed to be mutually
    /// consistent.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> Statistics {
        Statistics {
            granted: self.granted.load(Relaxed),
            waited: self.waited.load(Relaxed),
            deadlocks: self.deadlocks.load(Relaxed),
            interrupts: self.interrupts.load(Relaxed),
            timeouts: self.timeouts.load(Relaxed),
            commits: self.commits.load(Relaxed),
            rollbacks: self.rollbacks.load(Relaxed),
            store_rollback_failures: self.store_rollback_failures.load(Relaxed),
        }
    }

    pub(crate) fn record_grant(&self, waited: bool) {
        self.granted.fetch_add(1, Relaxed);
        if waited {
            self.waited.fetch_add(1, Relaxed);
        }
    }

    pub(crate) fn record_lock_failure(&self, error: &super::Error) {
        let counter = match error {
            super::Error::Deadlock => &self.deadlocks,
            super::Error::Interrupted => &self.interrupts,
            super::Error::Timeout => &self.timeouts,
            _ => return,
        };
        counter.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_store_rollback_failure(&self) {
        self.store_rollback_failures.fetch_add(1, Relaxed);
    }
}
