// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::TransactionId;
use parking_lot::Mutex;
use std::fmt::Debug;

/// The [`Store`] trait defines the interface between a [`Transaction`](super::Transaction) and
/// a physical data store involved in it.
///
/// The calls may be slow, and they may fail; they are never retried.
pub trait Store: 'static + Debug + Send + Sync {
    /// Returns the name of the store.
    fn name(&self) -> &str;

    /// Prepares the transaction for commit.
    ///
    /// Returns `false` if the store votes to abort the transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store could not process the request.
    fn prepare(&self, transaction: TransactionId) -> Result<bool, StoreError>;

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the changes could not be committed.
    fn commit(&self, transaction: TransactionId) -> Result<(), StoreError>;

    /// Rolls back the transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the changes could not be rolled back; the error is only
    /// logged by the caller.
    fn rollback(&self, transaction: TransactionId) -> Result<(), StoreError>;
}

/// [`StoreError`] is reported by a [`Store`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

/// Commit protocol phases observed by a [`VolatileStore`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// [`Store::prepare`] was called.
    Prepare,

    /// [`Store::commit`] was called.
    Commit,

    /// [`Store::rollback`] was called.
    Rollback,
}

/// In-memory [`Store`] that accepts every request and keeps a journal of them.
#[derive(Debug)]
pub struct VolatileStore {
    name: String,
    journal: Mutex<Vec<(TransactionId, Phase)>>,
}

impl StoreError {
    /// Creates a new [`StoreError`].
    #[inline]
    pub fn new<M: Into<String>>(message: M) -> StoreError {
        StoreError {
            message: message.into(),
        }
    }
}

impl VolatileStore {
    /// Creates a new [`VolatileStore`].
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{Phase, Store, VolatileStore};
    ///
    /// let store = VolatileStore::new("documents");
    /// assert_eq!(store.prepare(7), Ok(true));
    /// assert!(store.commit(7).is_ok());
    /// assert_eq!(store.phases_of(7), vec![Phase::Prepare, Phase::Commit]);
    /// ```
    #[inline]
    pub fn new<N: Into<String>>(name: N) -> VolatileStore {
        VolatileStore {
            name: name.into(),
            journal: Mutex::default(),
        }
    }

    /// Returns every recorded request in arrival order.
    #[inline]
    #[must_use]
    pub fn journal(&self) -> Vec<(TransactionId, Phase)> {
        self.journal.lock().clone()
    }

    /// Returns the phases recorded for the transaction.
    #[inline]
    #[must_use]
    pub fn phases_of(&self, transaction: TransactionId) -> Vec<Phase> {
        self.journal
            .lock()
            .iter()
            .filter_map(|(t, p)| (*t == transaction).then_some(*p))
            .collect()
    }

    fn record(&self, transaction: TransactionId, phase: Phase) {
        self.journal.lock().push((transaction, phase));
    }
}

impl Store for VolatileStore {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn prepare(&self, transaction: TransactionId) -> Result<bool, StoreError> {
        self.record(transaction, Phase::Prepare);
        Ok(true)
    }

    #[inline]
    fn commit(&self, transaction: TransactionId) -> Result<(), StoreError> {
        self.record(transaction, Phase::Commit);
        Ok(())
    }

    #[inline]
    fn rollback(&self, transaction: TransactionId) -> Result<(), StoreError> {
        self.record(transaction, Phase::Rollback);
        Ok(())
    }
}
