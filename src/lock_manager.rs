// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::transaction::Anchor;
use super::{
    Config, EntityId, Error, Granularity, Hierarchical, Lock, LockMode, State, Telemetry,
    Transaction, TransactionId, WaitForGraph,
};
use scc::HashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// [`LockManager`] maps entities to their [`Lock`] and acquires locks on behalf of transactions.
///
/// A [`Lock`] is created when the entity is locked for the first time, and it is kept in the
/// table afterwards.
#[derive(Debug)]
pub struct LockManager {
    /// The lock table.
    table: HashMap<EntityId, Arc<Lock>>,

    /// Waiting transactions.
    wait_for_graph: WaitForGraph,

    /// Decides which containers are implicitly locked.
    granularity: Box<dyn Granularity>,

    /// The configuration.
    config: Config,

    /// Lock and transaction statistics.
    telemetry: Telemetry,
}

impl LockManager {
    /// Creates a new [`LockManager`] locking containers along [`EntityId`] paths.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{Config, LockManager, LockMode, TransactionManager};
    /// use std::sync::Arc;
    ///
    /// let config = Config::default();
    /// let lock_manager = Arc::new(LockManager::new(&config));
    /// let manager = TransactionManager::new(lock_manager.clone(), config);
    /// let transaction = manager.begin();
    /// assert!(lock_manager.lock(&"sales.orders".into(), &transaction, LockMode::Exclusive).is_ok());
    /// assert_eq!(lock_manager.mode(&"sales".into()), Some(LockMode::Shared));
    /// assert_eq!(lock_manager.mode(&"sales.orders".into()), Some(LockMode::Exclusive));
    /// ```
    #[inline]
    #[must_use]
    pub fn new(config: &Config) -> LockManager {
        Self::with_granularity(config, Box::new(Hierarchical))
    }

    /// Creates a new [`LockManager`] with the supplied [`Granularity`].
    #[inline]
    #[must_use]
    pub fn with_granularity(config: &Config, granularity: Box<dyn Granularity>) -> LockManager {
        LockManager {
            table: HashMap::default(),
            wait_for_graph: WaitForGraph::default(),
            granularity,
            config: config.clone(),
            telemetry: Telemetry::default(),
        }
    }

    /// Locks the entity in the specified mode on behalf of the transaction.
    ///
    /// The containers of the entity are locked in [`LockMode::Shared`] beforehand, outermost
    /// first.
    ///
    /// # Errors
    ///
    /// If the transaction is not active, [`Error::UnexpectedState`] is returned, or
    /// [`Error::Interrupted`] if it was removed from its
    /// [`TransactionManager`](super::TransactionManager). Otherwise, if any lock could not be
    /// acquired, the transaction is rolled back, and the cause is returned.
    #[inline]
    pub fn lock(
        &self,
        entity: &EntityId,
        transaction: &Transaction<'_>,
        mode: LockMode,
    ) -> Result<(), Error> {
        self.check_active(transaction)?;
        let deadline = self.config.lock_deadline();
        self.lock_hierarchy(entity, transaction, mode, deadline)
            .map_err(|error| self.abort(transaction, error))
    }

    /// Locks a set of entities on behalf of the transaction.
    ///
    /// Duplicate requests are merged into the strongest mode, and the entities are locked in
    /// ascending order.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`LockManager::lock`].
    #[inline]
    pub fn lock_all<I: IntoIterator<Item = (EntityId, LockMode)>>(
        &self,
        requests: I,
        transaction: &Transaction<'_>,
    ) -> Result<(), Error> {
        self.check_active(transaction)?;
        let mut merged: BTreeMap<EntityId, LockMode> = BTreeMap::new();
        for (entity, mode) in requests {
            let current = merged.entry(entity).or_insert(mode);
            *current = (*current).max(mode);
        }
        let deadline = self.config.lock_deadline();
        for (entity, mode) in &merged {
            self.lock_hierarchy(entity, transaction, *mode, deadline)
                .map_err(|error| self.abort(transaction, error))?;
        }
        Ok(())
    }

    /// Releases every lock held by the transaction.
    ///
    /// It never fails, and calling it repeatedly is harmless.
    #[inline]
    pub fn unlock_all(&self, transaction: &Transaction<'_>) {
        self.release(transaction.anchor());
    }

    /// Releases every lock held by the transaction, and removes it from the [`WaitForGraph`].
    #[inline]
    pub fn remove_transaction(&self, transaction: &Transaction<'_>) {
        self.remove(transaction.anchor());
    }

    /// Returns the mode in which the entity is currently locked.
    #[inline]
    #[must_use]
    pub fn mode(&self, entity: &EntityId) -> Option<LockMode> {
        self.get(entity).and_then(|lock| lock.mode())
    }

    /// Returns the transactions holding a lock on the entity.
    #[inline]
    #[must_use]
    pub fn holders(&self, entity: &EntityId) -> Vec<TransactionId> {
        self.get(entity).map_or_else(Vec::new, |lock| lock.owners())
    }

    /// Returns the [`Lock`] of the entity if it has ever been locked.
    #[inline]
    #[must_use]
    pub fn get(&self, entity: &EntityId) -> Option<Arc<Lock>> {
        self.table.read(entity, |_, lock| lock.clone())
    }

    /// Returns the number of entities in the lock table.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if no entity has ever been locked.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns a reference to the [`WaitForGraph`].
    #[inline]
    #[must_use]
    pub fn wait_for_graph(&self) -> &WaitForGraph {
        &self.wait_for_graph
    }

    /// Returns a reference to the [`Telemetry`].
    #[inline]
    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Returns a reference to the [`Config`].
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Releases the locks recorded in the [`Anchor`], innermost first.
    pub(crate) fn release(&self, anchor: &Anchor) {
        let locks = anchor.take_locks();
        for lock in locks.values().rev() {
            lock.release(anchor.id(), &self.wait_for_graph);
        }
    }

    /// Releases the locks, and removes the transaction from the [`WaitForGraph`].
    pub(crate) fn remove(&self, anchor: &Anchor) {
        self.release(anchor);
        self.wait_for_graph.remove(anchor.id());
    }

    fn check_active(&self, transaction: &Transaction<'_>) -> Result<(), Error> {
        match transaction.state() {
            State::Active => Ok(()),
            State::Aborting | State::Aborted if transaction.is_interrupted() => {
                Err(Error::Interrupted)
            }
            state => Err(Error::UnexpectedState(state)),
        }
    }

    fn lock_hierarchy(
        &self,
        entity: &EntityId,
        transaction: &Transaction<'_>,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        for container in self.granularity.ancestors(entity) {
            self.acquire(&container, transaction, LockMode::Shared, deadline)?;
        }
        self.acquire(entity, transaction, mode, deadline)
    }

    fn acquire(
        &self,
        entity: &EntityId,
        transaction: &Transaction<'_>,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        let lock = self
            .table
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(Lock::default()))
            .get()
            .clone();
        let waited = lock.acquire(transaction, mode, &self.wait_for_graph, deadline)?;
        if !transaction.anchor().record_lock(entity, lock.clone()) {
            // Rolled back by another thread while the request was being granted.
            lock.release(transaction.id(), &self.wait_for_graph);
            return Err(Error::Interrupted);
        }
        self.telemetry.record_grant(waited);
        tracing::trace!(transaction = transaction.id(), %entity, ?mode, waited, "lock granted");
        Ok(())
    }

    /// Aborts the transaction after a failed lock request, and returns the cause.
    fn abort(&self, transaction: &Transaction<'_>, error: Error) -> Error {
        self.telemetry.record_lock_failure(&error);
        if error == Error::Deadlock {
            tracing::debug!(transaction = transaction.id(), "deadlock victim");
        }
        transaction.abort(&error);
        error
    }
}
