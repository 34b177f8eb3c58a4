// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::transaction::State;

/// [`Error`] defines all the error codes used by the concurrency control core.
///
/// Lock release and store rollback never fail, therefore no error code is defined for them.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// Waiting for the lock would close a cycle in the wait-for graph.
    ///
    /// The requesting transaction is the victim, and it has been aborted.
    #[error("transaction aborted to avoid a deadlock")]
    Deadlock,

    /// The transaction was interrupted while waiting for a lock, or before committing.
    #[error("transaction interrupted")]
    Interrupted,

    /// The lock could not be acquired before the configured deadline.
    #[error("lock wait timed out")]
    Timeout,

    /// A store failed to prepare the transaction, or voted to abort it.
    #[error("store `{store}` failed to prepare: {reason}")]
    PrepareFailed {
        /// The name of the store.
        store: String,

        /// The reason reported by the store.
        reason: String,
    },

    /// A store failed to commit the transaction.
    #[error("store `{store}` failed to commit: {reason}")]
    CommitFailed {
        /// The name of the store.
        store: String,

        /// The reason reported by the store.
        reason: String,
    },

    /// The transaction is not in a state that allows the operation.
    #[error("unexpected transaction state: {0:?}")]
    UnexpectedState(State),

    /// The transaction could not be found.
    #[error("transaction not found")]
    NotFound,
}

impl Error {
    /// Returns `true` if the transaction was aborted because of a conflict with others.
    ///
    /// Such a transaction can safely be retried from scratch, whereas store failures may require
    /// investigation.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::Error;
    ///
    /// assert!(Error::Deadlock.is_retryable());
    /// assert!(!Error::CommitFailed {
    ///     store: "documents".to_string(),
    ///     reason: "disk full".to_string()
    /// }
    /// .is_retryable());
    /// ```
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Deadlock | Error::Interrupted | Error::Timeout)
    }

    /// Returns `true` if the error originates from a store adapter.
    #[inline]
    #[must_use]
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::PrepareFailed { .. } | Error::CommitFailed { .. })
    }
}
