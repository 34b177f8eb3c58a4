// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// [`Config`] holds the tunable parameters of a [`LockManager`](super::LockManager) and a
/// [`TransactionManager`](super::TransactionManager).
///
/// # Examples
///
/// ```
/// use polylock::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_two_phase_commit(false)
///     .with_lock_wait_timeout(Some(Duration::from_secs(5)));
/// assert!(!config.two_phase_commit());
/// assert_eq!(config.lock_wait_timeout(), Some(Duration::from_secs(5)));
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Stores are asked to prepare the transaction before any of them is asked to commit.
    two_phase_commit: bool,

    /// The maximum time a single lock request may wait.
    ///
    /// `None` means that the request waits until granted, and only deadlock detection or an
    /// interrupt can abort it.
    lock_wait_timeout: Option<Duration>,
}

impl Config {
    /// Enables or disables the prepare phase at commit.
    #[inline]
    #[must_use]
    pub fn with_two_phase_commit(mut self, enabled: bool) -> Self {
        self.two_phase_commit = enabled;
        self
    }

    /// Sets the upper bound of a single lock wait.
    #[inline]
    #[must_use]
    pub fn with_lock_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Returns `true` if two-phase commit is enabled.
    #[inline]
    #[must_use]
    pub fn two_phase_commit(&self) -> bool {
        self.two_phase_commit
    }

    /// Returns the lock wait timeout.
    #[inline]
    #[must_use]
    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout
    }

    /// Computes the deadline of a lock request issued now.
    pub(crate) fn lock_deadline(&self) -> Option<Instant> {
        self.lock_wait_timeout.map(|t| Instant::now() + t)
    }
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Config {
            two_phase_commit: true,
            lock_wait_timeout: None,
        }
    }
}
