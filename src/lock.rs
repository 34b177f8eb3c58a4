// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::{Error, Transaction, TransactionId, WaitForGraph};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Lock modes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LockMode {
    /// Any number of transactions may hold the lock at the same time.
    Shared,

    /// A single transaction holds the lock.
    Exclusive,
}

/// [`Lock`] serializes access to a single entity.
///
/// Requesters wait on a condition variable until the lock state allows them to proceed, and
/// they register themselves in the supplied [`WaitForGraph`] before every wait so that a request
/// that would close a wait cycle is rejected instead of blocked.
#[derive(Debug, Default)]
pub struct Lock {
    /// The lock state.
    holders: Mutex<Holders>,

    /// Notified whenever the lock state may allow a waiter to proceed.
    changed: Condvar,
}

#[derive(Debug, Default)]
struct Holders {
    /// The granted mode; only meaningful if `owners` is not empty.
    mode: Option<LockMode>,

    /// Transactions holding the lock.
    ///
    /// There is exactly one owner if `mode` is [`LockMode::Exclusive`].
    owners: BTreeSet<TransactionId>,

    /// Transactions that gave up their shared hold to upgrade it.
    ///
    /// They take precedence over fresh requests.
    upgraders: BTreeSet<TransactionId>,

    /// Number of requesters parked on the condition variable since the last notification.
    parked: usize,

    /// Incremented on every notification.
    epoch: u64,
}

/// The kind of request being waited for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Request {
    Shared,
    Exclusive,
    Upgrade,
}

impl Lock {
    /// Acquires the lock in the specified mode.
    ///
    /// Returns `true` if the request had to wait. Requesting a mode that the transaction already
    /// holds, or a weaker one, is a no-op, and requesting [`LockMode::Exclusive`] while holding
    /// [`LockMode::Shared`] upgrades the lock.
    ///
    /// # Errors
    ///
    /// * [`Error::Deadlock`] if waiting would close a cycle in the [`WaitForGraph`].
    /// * [`Error::Interrupted`] if the transaction has been interrupted, even if it already holds
    ///   the lock.
    /// * [`Error::Timeout`] if the deadline was reached.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{Lock, LockMode, TransactionManager, WaitForGraph};
    /// use std::sync::Arc;
    ///
    /// let manager = TransactionManager::default();
    /// let graph = WaitForGraph::default();
    /// let lock = Arc::new(Lock::default());
    /// let transaction = manager.begin();
    /// assert_eq!(lock.acquire(&transaction, LockMode::Shared, &graph, None), Ok(false));
    /// assert_eq!(lock.mode(), Some(LockMode::Shared));
    /// lock.release(transaction.id(), &graph);
    /// assert!(lock.mode().is_none());
    /// ```
    #[inline]
    pub fn acquire(
        self: &Arc<Self>,
        transaction: &Transaction<'_>,
        mode: LockMode,
        wait_for_graph: &WaitForGraph,
        deadline: Option<Instant>,
    ) -> Result<bool, Error> {
        let id = transaction.id();
        if transaction.anchor().is_interrupted() {
            return Err(Error::Interrupted);
        }
        let request = {
            let holders = self.holders.lock();
            match (holders.mode_of(id), mode) {
                (Some(_), LockMode::Shared) | (Some(LockMode::Exclusive), _) => return Ok(false),
                (Some(LockMode::Shared), LockMode::Exclusive) => Request::Upgrade,
                (None, LockMode::Shared) => Request::Shared,
                (None, LockMode::Exclusive) => Request::Exclusive,
            }
        };
        self.wait_and_grant(transaction, request, wait_for_graph, deadline)
    }

    /// Upgrades the shared lock held by the transaction to an exclusive lock.
    ///
    /// The shared hold is given up while waiting, however no other transaction can be granted
    /// the lock in the meantime unless it is upgrading as well. It is a no-op if the transaction
    /// already holds the lock exclusively.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Lock::acquire`]; the shared hold is lost if the upgrade fails.
    #[inline]
    pub fn upgrade_to_exclusive(
        self: &Arc<Self>,
        transaction: &Transaction<'_>,
        wait_for_graph: &WaitForGraph,
        deadline: Option<Instant>,
    ) -> Result<bool, Error> {
        if transaction.anchor().is_interrupted() {
            return Err(Error::Interrupted);
        }
        if self.holders.lock().mode_of(transaction.id()) == Some(LockMode::Exclusive) {
            return Ok(false);
        }
        self.wait_and_grant(transaction, Request::Upgrade, wait_for_graph, deadline)
    }

    /// Releases the lock held by the transaction.
    ///
    /// Releasing a lock that the transaction does not hold is a no-op. The transaction is removed
    /// from the [`WaitForGraph`], and every waiter is woken up.
    #[inline]
    pub fn release(&self, transaction: TransactionId, wait_for_graph: &WaitForGraph) {
        let mut holders = self.holders.lock();
        holders.owners.remove(&transaction);
        holders.upgraders.remove(&transaction);
        if holders.owners.is_empty() {
            holders.mode = None;
        }
        wait_for_graph.remove(transaction);
        self.notify(&mut holders);
    }

    /// Returns the currently granted mode, or `None` if nobody holds the lock.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> Option<LockMode> {
        let holders = self.holders.lock();
        if holders.owners.is_empty() {
            None
        } else {
            holders.mode
        }
    }

    /// Returns the mode in which the transaction holds the lock.
    #[inline]
    #[must_use]
    pub fn mode_of(&self, transaction: TransactionId) -> Option<LockMode> {
        self.holders.lock().mode_of(transaction)
    }

    /// Returns the transactions holding the lock.
    #[inline]
    #[must_use]
    pub fn owners(&self) -> Vec<TransactionId> {
        self.holders.lock().owners.iter().copied().collect()
    }

    /// Wakes up every waiter so that they re-evaluate their state, e.g., after an interrupt.
    pub(crate) fn wake_all(&self) {
        let mut holders = self.holders.lock();
        self.notify(&mut holders);
    }

    fn notify(&self, holders: &mut MutexGuard<Holders>) {
        holders.epoch = holders.epoch.wrapping_add(1);
        holders.parked = 0;
        self.changed.notify_all();
    }

    /// Waits until the request can be granted, and grants it.
    fn wait_and_grant(
        self: &Arc<Self>,
        transaction: &Transaction<'_>,
        request: Request,
        wait_for_graph: &WaitForGraph,
        deadline: Option<Instant>,
    ) -> Result<bool, Error> {
        let id = transaction.id();
        transaction.anchor().park(self.clone());
        let mut holders = self.holders.lock();
        if request == Request::Upgrade {
            holders.owners.remove(&id);
            holders.upgraders.insert(id);
            if holders.owners.is_empty() {
                holders.mode = None;
            }
        }

        let mut waited = false;
        let result = loop {
            if transaction.anchor().is_interrupted() {
                break Err(Error::Interrupted);
            }
            if holders.grantable(id, request) {
                break Ok(waited);
            }
            if deadline.map_or(false, |d| d <= Instant::now()) {
                break Err(Error::Timeout);
            }
            if let Err(error) =
                wait_for_graph.add_and_abort_if_deadlock(id, holders.blockers(id, request))
            {
                break Err(error);
            }

            tracing::trace!(transaction = id, ?request, "waiting for lock");
            waited = true;
            let epoch = holders.epoch;
            holders.parked += 1;
            if let Some(deadline) = deadline {
                self.changed.wait_until(&mut holders, deadline);
            } else {
                self.changed.wait(&mut holders);
            }
            if holders.epoch == epoch {
                // Not notified: spurious wake-up or timeout.
                holders.parked -= 1;
            }
        };

        if waited {
            wait_for_graph.stop_waiting(id);
        }
        match result {
            Ok(_) => {
                holders.upgraders.remove(&id);
                if request == Request::Shared {
                    holders.mode = Some(LockMode::Shared);
                } else {
                    holders.owners.clear();
                    holders.mode = Some(LockMode::Exclusive);
                }
                holders.owners.insert(id);
            }
            Err(_) => {
                if holders.upgraders.remove(&id) {
                    self.notify(&mut holders);
                }
            }
        }
        drop(holders);
        transaction.anchor().unpark();
        result
    }
}

impl Holders {
    fn mode_of(&self, transaction: TransactionId) -> Option<LockMode> {
        if self.owners.contains(&transaction) {
            self.mode
        } else {
            None
        }
    }

    fn grantable(&self, transaction: TransactionId, request: Request) -> bool {
        match request {
            Request::Shared => {
                (self.owners.is_empty() || self.mode == Some(LockMode::Shared))
                    && self.upgraders.is_empty()
                    && self.parked == 0
            }
            Request::Exclusive => self.owners.is_empty() && self.upgraders.is_empty(),
            Request::Upgrade => {
                self.owners.is_empty()
                    || (self.owners.len() == 1 && self.owners.contains(&transaction))
            }
        }
    }

    /// Returns the transactions that the requester has to wait for.
    ///
    /// Pending upgraders block fresh requests, whereas competing upgraders only wait for the
    /// remaining owners.
    fn blockers(&self, transaction: TransactionId, request: Request) -> Vec<TransactionId> {
        let upgraders = if request == Request::Upgrade {
            None
        } else {
            Some(self.upgraders.iter())
        };
        self.owners
            .iter()
            .chain(upgraders.into_iter().flatten())
            .copied()
            .filter(|o| *o != transaction)
            .collect()
    }
}
