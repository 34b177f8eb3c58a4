// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::{EntityId, Error, Lock, LockMode, Store, TransactionManager};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicU8};
use std::sync::Arc;

/// [`Transaction`] is the atomic unit of work spanning any number of [`Store`] instances.
///
/// A [`Transaction`] accumulates locks on the entities it touches and the stores it involves, and
/// releases every lock when it is committed or rolled back. A [`Transaction`] that is dropped
/// without being committed is rolled back.
#[derive(Debug)]
pub struct Transaction<'m> {
    /// The transaction refers to the [`TransactionManager`] that created it.
    manager: &'m TransactionManager,

    /// A piece of data that is shared between the [`Transaction`] and the
    /// [`TransactionManager`].
    anchor: Arc<Anchor>,
}

/// The type of transaction identifiers.
///
/// Identifiers are assigned in increasing order, and they are never reused by the same
/// [`TransactionManager`].
pub type ID = u64;

/// Possible [`Transaction`] states.
#[derive(Clone, Copy, Eq, Debug, Ord, PartialEq, PartialOrd)]
pub enum State {
    /// The transaction is active.
    Active,

    /// The transaction is being committed.
    Committing,

    /// The transaction is committed.
    Committed,

    /// The transaction is being rolled back.
    Aborting,

    /// The transaction is rolled back.
    Aborted,
}

/// [`Interrupter`] cancels the lock wait of a [`Transaction`] from another thread.
///
/// The transaction is aborted by the thread waiting for the lock, or at commit if it was not
/// waiting.
#[derive(Clone, Debug)]
pub struct Interrupter {
    anchor: Arc<Anchor>,
}

/// [`Anchor`] contains data that is shared with the [`TransactionManager`] and other threads.
#[derive(Debug)]
pub(crate) struct Anchor {
    /// The transaction identifier.
    id: ID,

    /// The transaction state.
    ///
    /// An integer represents a transaction state.
    ///  * 0: active.
    ///  * 1: commit started.
    ///  * 2: committed.
    ///  * 3: abort started.
    ///  * 4: aborted.
    state: AtomicU8,

    /// Acquired locks.
    locks: Mutex<BTreeMap<EntityId, Arc<Lock>>>,

    /// Involved stores in registration order.
    stores: Mutex<Vec<Arc<dyn Store>>>,

    /// Set when the transaction has been interrupted.
    interrupted: AtomicBool,

    /// The lock that the transaction is waiting for.
    waiting_on: Mutex<Option<Arc<Lock>>>,
}

impl<'m> Transaction<'m> {
    /// The transaction identifier.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::TransactionManager;
    ///
    /// let manager = TransactionManager::default();
    /// let t1 = manager.begin();
    /// let t2 = manager.begin();
    /// assert!(t1.id() < t2.id());
    /// ```
    #[inline]
    #[must_use]
    pub fn id(&self) -> ID {
        self.anchor.id
    }

    /// Returns the current state of the [`Transaction`].
    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.anchor.state()
    }

    /// Locks the entity in the specified mode.
    ///
    /// The containers of the entity are locked in [`LockMode::Shared`] beforehand.
    ///
    /// # Errors
    ///
    /// If the lock could not be acquired, the transaction is rolled back and an [`Error`] is
    /// returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{EntityId, LockMode, State, TransactionManager};
    ///
    /// let manager = TransactionManager::default();
    /// let mut transaction = manager.begin();
    /// assert!(transaction.lock("public.orders", LockMode::Exclusive).is_ok());
    /// assert_eq!(
    ///     transaction.locked_entities(),
    ///     vec![EntityId::from("public"), EntityId::from("public.orders")]
    /// );
    /// assert!(transaction.commit().is_ok());
    /// assert_eq!(transaction.state(), State::Committed);
    /// assert!(transaction.locked_entities().is_empty());
    /// ```
    #[inline]
    pub fn lock<E: Into<EntityId>>(&self, entity: E, mode: LockMode) -> Result<(), Error> {
        self.manager
            .lock_manager()
            .lock(&entity.into(), self, mode)
    }

    /// Locks a set of entities in canonical order.
    ///
    /// # Errors
    ///
    /// If any of the locks could not be acquired, the transaction is rolled back and an
    /// [`Error`] is returned.
    #[inline]
    pub fn lock_all<I: IntoIterator<Item = (EntityId, LockMode)>>(
        &self,
        requests: I,
    ) -> Result<(), Error> {
        self.manager.lock_manager().lock_all(requests, self)
    }

    /// Registers a [`Store`] that the transaction has touched.
    ///
    /// Returns `false` if the store was already registered.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the transaction is not active.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{TransactionManager, VolatileStore};
    /// use std::sync::Arc;
    ///
    /// let manager = TransactionManager::default();
    /// let transaction = manager.begin();
    /// let store = Arc::new(VolatileStore::new("relational"));
    /// assert_eq!(transaction.register_store(store.clone()), Ok(true));
    /// assert_eq!(transaction.register_store(store), Ok(false));
    /// assert_eq!(transaction.stores().len(), 1);
    /// ```
    #[inline]
    pub fn register_store(&self, store: Arc<dyn Store>) -> Result<bool, Error> {
        let state = self.state();
        if state != State::Active {
            return Err(Error::UnexpectedState(state));
        }
        let mut stores = self.anchor.stores.lock();
        let target = Arc::as_ptr(&store).cast::<()>();
        if stores.iter().any(|s| Arc::as_ptr(s).cast::<()>() == target) {
            return Ok(false);
        }
        stores.push(store);
        Ok(true)
    }

    /// Returns the involved stores in registration order.
    #[inline]
    #[must_use]
    pub fn stores(&self) -> Vec<Arc<dyn Store>> {
        self.anchor.stores.lock().clone()
    }

    /// Returns the entities currently locked by the transaction.
    #[inline]
    #[must_use]
    pub fn locked_entities(&self) -> Vec<EntityId> {
        self.anchor.locks.lock().keys().cloned().collect()
    }

    /// Returns `true` if the transaction has been interrupted.
    #[inline]
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.anchor.is_interrupted()
    }

    /// Returns an [`Interrupter`] that can be sent to other threads.
    #[inline]
    #[must_use]
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            anchor: self.anchor.clone(),
        }
    }

    /// Commits the [`Transaction`].
    ///
    /// Every involved store is asked to prepare the transaction if two-phase commit is enabled,
    /// and then to commit it in registration order. All the locks are released afterwards.
    ///
    /// # Errors
    ///
    /// If a store fails to prepare or commit, every store is asked to roll back the transaction,
    /// the locks are released, and an [`Error`] is returned. [`Error::Interrupted`] is returned if
    /// the transaction has been interrupted or removed from its [`TransactionManager`].
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{Phase, TransactionManager, VolatileStore};
    /// use std::sync::Arc;
    ///
    /// let manager = TransactionManager::default();
    /// let mut transaction = manager.begin();
    /// let store = Arc::new(VolatileStore::new("graph"));
    /// assert!(transaction.register_store(store.clone()).is_ok());
    /// assert!(transaction.commit().is_ok());
    /// assert_eq!(store.phases_of(transaction.id()), vec![Phase::Prepare, Phase::Commit]);
    /// ```
    #[inline]
    pub fn commit(&mut self) -> Result<(), Error> {
        let state = self.state();
        if self.is_interrupted() && state != State::Committed {
            self.rollback_internal();
            return Err(Error::Interrupted);
        }
        if state != State::Active {
            return Err(Error::UnexpectedState(state));
        }

        self.anchor.set_state(State::Committing);
        let stores = self.stores();
        if let Err(error) = self.commit_stores(&stores) {
            tracing::debug!(transaction = self.id(), %error, "commit failed");
            self.rollback_internal();
            return Err(error);
        }

        self.anchor.set_state(State::Committed);
        self.manager.finish(&self.anchor);
        self.manager.telemetry().record_commit();
        tracing::debug!(transaction = self.id(), stores = stores.len(), "committed");
        Ok(())
    }

    /// Rolls back the [`Transaction`].
    ///
    /// Every involved store is asked to roll back the transaction; failures are logged, and they
    /// do not prevent the locks from being released. It is a no-op if the transaction has already
    /// ended.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{LockMode, State, TransactionManager};
    ///
    /// let manager = TransactionManager::default();
    /// let mut transaction = manager.begin();
    /// assert!(transaction.lock("orders", LockMode::Shared).is_ok());
    /// transaction.rollback();
    /// assert_eq!(transaction.state(), State::Aborted);
    /// assert!(manager.lock_manager().holders(&"orders".into()).is_empty());
    /// ```
    #[inline]
    pub fn rollback(&mut self) {
        self.rollback_internal();
    }

    /// Creates a new [`Transaction`].
    pub(crate) fn new(manager: &'m TransactionManager, anchor: Arc<Anchor>) -> Transaction<'m> {
        Transaction { manager, anchor }
    }

    /// Returns a reference to its [`Anchor`].
    pub(crate) fn anchor(&self) -> &Arc<Anchor> {
        &self.anchor
    }

    /// Aborts the transaction after a failed lock request.
    pub(crate) fn abort(&self, cause: &Error) {
        tracing::debug!(transaction = self.id(), %cause, "aborting");
        self.rollback_internal();
    }

    /// Runs the prepare and commit phases.
    fn commit_stores(&self, stores: &[Arc<dyn Store>]) -> Result<(), Error> {
        let id = self.id();
        if self.manager.config().two_phase_commit() {
            for store in stores {
                let reason = match store.prepare(id) {
                    Ok(true) => continue,
                    Ok(false) => "voted to abort".to_string(),
                    Err(error) => error.to_string(),
                };
                return Err(Error::PrepareFailed {
                    store: store.name().to_string(),
                    reason,
                });
            }
        }
        for store in stores {
            store.commit(id).map_err(|error| Error::CommitFailed {
                store: store.name().to_string(),
                reason: error.to_string(),
            })?;
        }
        Ok(())
    }

    /// Rolls back every involved store, and releases all the locks.
    fn rollback_internal(&self) {
        if self
            .anchor
            .transition(&[State::Active, State::Committing], State::Aborting)
            .is_ok()
        {
            self.manager.rollback(&self.anchor);
        }
    }
}

impl<'m> Drop for Transaction<'m> {
    #[inline]
    fn drop(&mut self) {
        let state = self.state();
        if state == State::Active || state == State::Committing {
            self.rollback_internal();
        }
    }
}

impl Interrupter {
    /// Returns the identifier of the target transaction.
    #[inline]
    #[must_use]
    pub fn transaction_id(&self) -> ID {
        self.anchor.id
    }

    /// Interrupts the transaction.
    #[inline]
    pub fn interrupt(&self) {
        self.anchor.interrupt();
    }
}

impl From<State> for u8 {
    #[inline]
    fn from(v: State) -> u8 {
        match v {
            State::Active => 0,
            State::Committing => 1,
            State::Committed => 2,
            State::Aborting => 3,
            State::Aborted => 4,
        }
    }
}

impl From<u8> for State {
    #[inline]
    fn from(v: u8) -> State {
        match v {
            0 => State::Active,
            1 => State::Committing,
            2 => State::Committed,
            3 => State::Aborting,
            _ => State::Aborted,
        }
    }
}

impl Anchor {
    pub(crate) fn new(id: ID) -> Anchor {
        Anchor {
            id,
            state: AtomicU8::new(State::Active.into()),
            locks: Mutex::default(),
            stores: Mutex::default(),
            interrupted: AtomicBool::new(false),
            waiting_on: Mutex::default(),
        }
    }

    pub(crate) fn id(&self) -> ID {
        self.id
    }

    pub(crate) fn state(&self) -> State {
        self.state.load(Acquire).into()
    }

    pub(crate) fn set_state(&self, state: State) {
        debug_assert!(!matches!(self.state(), State::Committed | State::Aborted));
        self.state.store(state.into(), Release);
    }

    /// Atomically moves the state to `to` if the current state is one of `from`.
    ///
    /// Returns the current state on failure.
    pub(crate) fn transition(&self, from: &[State], to: State) -> Result<(), State> {
        self.state
            .fetch_update(AcqRel, Acquire, |s| {
                from.contains(&State::from(s)).then_some(to.into())
            })
            .map(|_| ())
            .map_err(State::from)
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Acquire)
    }

    /// Interrupts the transaction, and wakes up the lock it is waiting for.
    pub(crate) fn interrupt(&self) {
        self.raise_interrupt();
        self.wake();
    }

    /// Sets the interrupt flag without waking up the transaction.
    pub(crate) fn raise_interrupt(&self) {
        self.interrupted.store(true, Release);
    }

    /// Wakes up the lock the transaction is waiting for.
    pub(crate) fn wake(&self) {
        let waiting_on = self.waiting_on.lock().clone();
        if let Some(lock) = waiting_on {
            lock.wake_all();
        }
    }

    /// Marks the transaction as waiting for the lock.
    ///
    /// It must not be called while the lock's internal mutex is held.
    pub(crate) fn park(&self, lock: Arc<Lock>) {
        self.waiting_on.lock().replace(lock);
    }

    pub(crate) fn unpark(&self) {
        self.waiting_on.lock().take();
    }

    /// Records a granted lock.
    ///
    /// Returns `false` if the transaction is no longer active, in which case the lock set may
    /// already have been released, and the caller has to release the lock by itself.
    pub(crate) fn record_lock(&self, entity: &EntityId, lock: Arc<Lock>) -> bool {
        let mut locks = self.locks.lock();
        if self.state() != State::Active {
            return false;
        }
        locks.entry(entity.clone()).or_insert(lock);
        true
    }

    pub(crate) fn stores(&self) -> Vec<Arc<dyn Store>> {
        self.stores.lock().clone()
    }

    /// Takes all the recorded locks, leaving the lock set empty.
    pub(crate) fn take_locks(&self) -> BTreeMap<EntityId, Arc<Lock>> {
        std::mem::take(&mut *self.locks.lock())
    }
}
