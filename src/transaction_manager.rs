// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::transaction::Anchor;
use super::{Config, Error, LockManager, State, Telemetry, Transaction, TransactionId};
use scc::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// [`TransactionManager`] creates transactions and keeps track of the active ones.
///
/// # Examples
///
/// ```
/// use polylock::{LockMode, TransactionManager};
///
/// let manager = TransactionManager::default();
/// let mut transaction = manager.begin();
/// assert!(manager.is_active(transaction.id()));
/// assert!(transaction.lock("inventory.items", LockMode::Exclusive).is_ok());
/// assert!(transaction.commit().is_ok());
/// assert!(manager.is_empty());
/// ```
#[derive(Debug)]
pub struct TransactionManager {
    /// The [`LockManager`] shared by every transaction.
    lock_manager: Arc<LockManager>,

    /// The configuration.
    config: Config,

    /// The last assigned transaction identifier.
    sequencer: AtomicU64,

    /// Transactions that have not ended yet.
    transactions: HashMap<TransactionId, Arc<Anchor>>,
}

impl TransactionManager {
    /// Creates a new [`TransactionManager`] on top of the supplied [`LockManager`].
    #[inline]
    #[must_use]
    pub fn new(lock_manager: Arc<LockManager>, config: Config) -> TransactionManager {
        TransactionManager {
            lock_manager,
            config,
            sequencer: AtomicU64::new(0),
            transactions: HashMap::default(),
        }
    }

    /// Creates a new [`TransactionManager`] along with a dedicated [`LockManager`].
    #[inline]
    #[must_use]
    pub fn with_config(config: Config) -> TransactionManager {
        let lock_manager = Arc::new(LockManager::new(&config));
        Self::new(lock_manager, config)
    }

    /// Begins a new [`Transaction`].
    #[inline]
    pub fn begin(&self) -> Transaction<'_> {
        let id = self.sequencer.fetch_add(1, Relaxed) + 1;
        let anchor = Arc::new(Anchor::new(id));
        let inserted = self.transactions.insert(id, anchor.clone());
        debug_assert!(inserted.is_ok());
        tracing::trace!(transaction = id, "begin");
        Transaction::new(self, anchor)
    }

    /// Interrupts the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the transaction is not registered.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{Error, TransactionManager};
    ///
    /// let manager = TransactionManager::default();
    /// let mut transaction = manager.begin();
    /// assert!(manager.interrupt(transaction.id()).is_ok());
    /// assert_eq!(transaction.commit(), Err(Error::Interrupted));
    /// assert_eq!(manager.interrupt(transaction.id()), Err(Error::NotFound));
    /// ```
    #[inline]
    pub fn interrupt(&self, transaction: TransactionId) -> Result<(), Error> {
        let anchor = self.anchor(transaction)?;
        anchor.interrupt();
        Ok(())
    }

    /// Forcibly rolls back the transaction on behalf of its owner.
    ///
    /// The involved stores are rolled back before any lock is released, and the transaction is
    /// deregistered. A lock wait of the transaction is then cancelled, and the owner of the
    /// [`Transaction`] observes [`Error::Interrupted`] on its next lock request or commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the transaction is not registered, and
    /// [`Error::UnexpectedState`] if it is being committed or rolled back.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{Error, LockMode, Phase, State, TransactionManager, VolatileStore};
    /// use std::sync::Arc;
    ///
    /// let manager = TransactionManager::default();
    /// let store = Arc::new(VolatileStore::new("rows"));
    /// let transaction = manager.begin();
    /// assert!(transaction.register_store(store.clone()).is_ok());
    /// assert!(manager.remove_transaction(transaction.id()).is_ok());
    /// assert_eq!(transaction.state(), State::Aborted);
    /// assert_eq!(store.phases_of(transaction.id()), vec![Phase::Rollback]);
    /// assert_eq!(transaction.lock("orders", LockMode::Shared), Err(Error::Interrupted));
    /// ```
    #[inline]
    pub fn remove_transaction(&self, transaction: TransactionId) -> Result<(), Error> {
        let anchor = self.anchor(transaction)?;
        anchor
            .transition(&[State::Active], State::Aborting)
            .map_err(Error::UnexpectedState)?;
        anchor.raise_interrupt();
        self.rollback(&anchor);
        anchor.wake();
        tracing::debug!(transaction, "removed");
        Ok(())
    }

    /// Returns the state of a registered transaction.
    #[inline]
    #[must_use]
    pub fn state(&self, transaction: TransactionId) -> Option<State> {
        self.transactions
            .read(&transaction, |_, anchor| anchor.state())
    }

    /// Returns `true` if the transaction is registered and active.
    #[inline]
    #[must_use]
    pub fn is_active(&self, transaction: TransactionId) -> bool {
        self.state(transaction) == Some(State::Active)
    }

    /// Returns the identifiers of the registered transactions in ascending order.
    #[inline]
    #[must_use]
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        let mut ids = Vec::with_capacity(self.transactions.len());
        self.transactions.scan(|id, _| ids.push(*id));
        ids.sort_unstable();
        ids
    }

    /// Returns the number of registered transactions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Returns `true` if no transactions are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Returns a reference to the [`LockManager`].
    #[inline]
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Returns a reference to the [`Config`].
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a reference to the [`Telemetry`] of the [`LockManager`].
    #[inline]
    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        self.lock_manager.telemetry()
    }

    /// Releases the resources of an ended transaction, and deregisters it.
    pub(crate) fn finish(&self, anchor: &Anchor) {
        self.lock_manager.remove(anchor);
        self.transactions.remove(&anchor.id());
    }

    /// Rolls back every involved store, and then releases the locks.
    ///
    /// The transaction must be in [`State::Aborting`].
    pub(crate) fn rollback(&self, anchor: &Anchor) {
        let id = anchor.id();
        for store in anchor.stores() {
            if let Err(error) = store.rollback(id) {
                tracing::warn!(transaction = id, store = store.name(), %error, "rollback failed");
                self.telemetry().record_store_rollback_failure();
            }
        }
        anchor.set_state(State::Aborted);
        self.finish(anchor);
        self.telemetry().record_rollback();
        tracing::debug!(transaction = id, "rolled back");
    }

    fn anchor(&self, transaction: TransactionId) -> Result<Arc<Anchor>, Error> {
        self.transactions
            .read(&transaction, |_, anchor| anchor.clone())
            .ok_or(Error::NotFound)
    }
}

impl Default for TransactionManager {
    #[inline]
    fn default() -> Self {
        Self::with_config(Config::default())
    }
}
