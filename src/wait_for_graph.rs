// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::{Error, TransactionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// [`WaitForGraph`] records which transactions are waiting for which others.
///
/// An edge `T1 -> T2` means that `T1` is waiting for a lock held by `T2`. Cycles are detected
/// when an edge is about to be inserted, and the inserting transaction is told to abort instead
/// of waiting, therefore the graph never contains a cycle.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// Outgoing edges of every waiting transaction.
    edges: Mutex<BTreeMap<TransactionId, BTreeSet<TransactionId>>>,
}

impl WaitForGraph {
    /// Registers `requester` as waiting for `blockers`.
    ///
    /// The previous outgoing edges of `requester` are replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deadlock`] without adding any edge if one of the blockers is, directly or
    /// transitively, waiting for `requester`.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::{Error, WaitForGraph};
    ///
    /// let graph = WaitForGraph::default();
    /// assert!(graph.add_and_abort_if_deadlock(1, [2]).is_ok());
    /// assert!(graph.add_and_abort_if_deadlock(2, [3]).is_ok());
    /// assert_eq!(graph.add_and_abort_if_deadlock(3, [1]), Err(Error::Deadlock));
    /// assert!(graph.waits_for(3).is_empty());
    /// ```
    #[inline]
    pub fn add_and_abort_if_deadlock<I: IntoIterator<Item = TransactionId>>(
        &self,
        requester: TransactionId,
        blockers: I,
    ) -> Result<(), Error> {
        let blockers: BTreeSet<TransactionId> =
            blockers.into_iter().filter(|b| *b != requester).collect();
        let mut edges = self.edges.lock();
        edges.remove(&requester);
        if blockers.is_empty() {
            return Ok(());
        }
        if Self::reaches(&edges, &blockers, requester) {
            return Err(Error::Deadlock);
        }
        edges.insert(requester, blockers);
        Ok(())
    }

    /// Drops the outgoing edges of the transaction as it is no longer waiting.
    #[inline]
    pub fn stop_waiting(&self, transaction: TransactionId) {
        self.edges.lock().remove(&transaction);
    }

    /// Drops every edge incident to the transaction.
    #[inline]
    pub fn remove(&self, transaction: TransactionId) {
        let mut edges = self.edges.lock();
        edges.remove(&transaction);
        edges.retain(|_, blockers| {
            blockers.remove(&transaction);
            !blockers.is_empty()
        });
    }

    /// Returns the transactions that the transaction is waiting for.
    #[inline]
    #[must_use]
    pub fn waits_for(&self, transaction: TransactionId) -> Vec<TransactionId> {
        self.edges
            .lock()
            .get(&transaction)
            .map_or_else(Vec::new, |b| b.iter().copied().collect())
    }

    /// Returns the number of waiting transactions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.lock().len()
    }

    /// Returns `true` if no transactions are waiting.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.lock().is_empty()
    }

    /// Checks if `target` is reachable from any of `sources`.
    fn reaches(
        edges: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
        sources: &BTreeSet<TransactionId>,
        target: TransactionId,
    ) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<TransactionId> = sources.iter().copied().collect();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = edges.get(&current) {
                stack.extend(next.iter().filter(|n| !visited.contains(*n)));
            }
        }
        false
    }

    #[cfg(test)]
    fn has_cycle(&self) -> bool {
        let edges = self.edges.lock();
        edges.iter().any(|(from, to)| Self::reaches(&edges, to, *from))
    }
}
