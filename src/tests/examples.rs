// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use crate::{
    EntityId, Error, Interrupter, LockMode, Phase, State, Store, StoreError, TransactionId,
    TransactionManager, VolatileStore,
};
use static_assertions::assert_impl_all;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

assert_impl_all!(TransactionManager: Send, Sync);
assert_impl_all!(Interrupter: Clone, Send, Sync);
assert_impl_all!(Error: Send, Sync, std::error::Error);

/// Fails to commit, and records every request.
#[derive(Debug)]
struct BrokenCommit(VolatileStore);

/// Votes to abort every transaction.
#[derive(Debug)]
struct Reluctant(VolatileStore);

impl Store for BrokenCommit {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn prepare(&self, transaction: TransactionId) -> Result<bool, StoreError> {
        self.0.prepare(transaction)
    }
    fn commit(&self, transaction: TransactionId) -> Result<(), StoreError> {
        let _ = self.0.commit(transaction);
        Err(StoreError::new("disk full"))
    }
    fn rollback(&self, transaction: TransactionId) -> Result<(), StoreError> {
        self.0.rollback(transaction)
    }
}

impl Store for Reluctant {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn prepare(&self, transaction: TransactionId) -> Result<bool, StoreError> {
        let _ = self.0.prepare(transaction);
        Ok(false)
    }
    fn commit(&self, transaction: TransactionId) -> Result<(), StoreError> {
        self.0.commit(transaction)
    }
    fn rollback(&self, transaction: TransactionId) -> Result<(), StoreError> {
        self.0.rollback(transaction)
    }
}

#[test]
fn mutual_exclusion() {
    let manager = TransactionManager::default();
    let num_threads = 8;
    let num_iterations = 256;
    let barrier = Barrier::new(num_threads);
    let readers = AtomicUsize::new(0);
    let writers = AtomicUsize::new(0);
    thread::scope(|s| {
        for thread_id in 0..num_threads {
            let (manager, barrier, readers, writers) = (&manager, &barrier, &readers, &writers);
            s.spawn(move || {
                barrier.wait();
                for i in 0..num_iterations {
                    let mut transaction = manager.begin();
                    if (thread_id + i) % 3 == 0 {
                        assert!(transaction.lock("bank.vault", LockMode::Exclusive).is_ok());
                        assert_eq!(writers.fetch_add(1, Relaxed), 0);
                        assert_eq!(readers.load(Relaxed), 0);
                        writers.fetch_sub(1, Relaxed);
                    } else {
                        assert!(transaction.lock("bank.vault", LockMode::Shared).is_ok());
                        readers.fetch_add(1, Relaxed);
                        assert_eq!(writers.load(Relaxed), 0);
                        readers.fetch_sub(1, Relaxed);
                    }
                    assert!(transaction.commit().is_ok());
                }
            });
        }
    });
    assert!(manager.is_empty());
    assert!(manager.lock_manager().mode(&"bank.vault".into()).is_none());
    assert!(manager.lock_manager().wait_for_graph().is_empty());
    assert_eq!(
        manager.telemetry().snapshot().commits,
        (num_threads * num_iterations) as u64
    );
}

#[test]
fn deadlock() {
    let manager = TransactionManager::default();
    let barrier = Barrier::new(2);
    let results: Vec<(Result<(), Error>, State)> = thread::scope(|s| {
        let handles: Vec<_> = [("A", "B"), ("B", "A")]
            .into_iter()
            .map(|(first, second)| {
                let (manager, barrier) = (&manager, &barrier);
                s.spawn(move || {
                    let mut transaction = manager.begin();
                    assert!(transaction.lock(first, LockMode::Exclusive).is_ok());
                    barrier.wait();
                    let result = transaction.lock(second, LockMode::Exclusive);
                    if result.is_ok() {
                        assert!(transaction.commit().is_ok());
                    }
                    (result, transaction.state())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let victims = results
        .iter()
        .filter(|(result, _)| *result == Err(Error::Deadlock))
        .count();
    assert_eq!(victims, 1);
    for (result, state) in results {
        if result.is_ok() {
            assert_eq!(state, State::Committed);
        } else {
            assert_eq!(state, State::Aborted);
        }
    }
    let statistics = manager.telemetry().snapshot();
    assert_eq!(statistics.deadlocks, 1);
    assert_eq!(statistics.commits, 1);
    assert!(manager.lock_manager().wait_for_graph().is_empty());
}

#[test]
fn simple_conflict() {
    let manager = TransactionManager::default();
    let store = Arc::new(VolatileStore::new("rows"));
    let mut t1 = manager.begin();
    assert!(t1.lock("orders", LockMode::Exclusive).is_ok());
    assert!(t1.register_store(store.clone()).is_ok());

    let granted = AtomicBool::new(false);
    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut t2 = manager.begin();
            assert!(t2.lock("orders", LockMode::Shared).is_ok());
            granted.store(true, Release);
            assert!(t2.register_store(store.clone()).is_ok());
            assert!(t2.commit().is_ok());
            t2.id()
        });
        while manager.lock_manager().wait_for_graph().is_empty() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        assert!(!granted.load(Acquire));

        t1.rollback();
        let t2 = reader.join().unwrap();
        assert_eq!(
            store.journal(),
            vec![
                (t1.id(), Phase::Rollback),
                (t2, Phase::Prepare),
                (t2, Phase::Commit)
            ]
        );
    });
    assert!(granted.load(Acquire));
    assert_eq!(manager.telemetry().snapshot().waited, 1);
}

#[test]
fn release_completeness() {
    let manager = TransactionManager::default();
    let entities = ["ns.a", "ns.b", "ns.b.p0", "other"];
    let mut committed = manager.begin();
    let mut rolled_back = manager.begin();
    for entity in entities {
        assert!(committed.lock(entity, LockMode::Shared).is_ok());
        assert!(rolled_back.lock(entity, LockMode::Shared).is_ok());
    }
    assert_eq!(committed.locked_entities().len(), 5);

    assert!(committed.commit().is_ok());
    rolled_back.rollback();
    for transaction in [&committed, &rolled_back] {
        assert!(transaction.locked_entities().is_empty());
    }
    for entity in ["ns", "ns.a", "ns.b", "ns.b.p0", "other"] {
        assert!(manager.lock_manager().holders(&entity.into()).is_empty());
    }
    assert_eq!(manager.lock_manager().len(), 5);
}

#[test]
fn commit_with_store_failure() {
    let manager = TransactionManager::default();
    let s1 = Arc::new(VolatileStore::new("s1"));
    let s2 = Arc::new(BrokenCommit(VolatileStore::new("s2")));
    let mut transaction = manager.begin();
    assert!(transaction.lock("ns.orders", LockMode::Exclusive).is_ok());
    assert!(transaction.register_store(s1.clone()).is_ok());
    assert!(transaction.register_store(s2.clone()).is_ok());

    let result = transaction.commit();
    assert_eq!(
        result,
        Err(Error::CommitFailed {
            store: "s2".to_string(),
            reason: "disk full".to_string()
        })
    );
    assert!(result.is_err_and(|e| e.is_store_failure() && !e.is_retryable()));
    assert_eq!(transaction.state(), State::Aborted);
    assert_eq!(
        s1.phases_of(transaction.id()),
        vec![Phase::Prepare, Phase::Commit, Phase::Rollback]
    );
    assert_eq!(
        s2.0.phases_of(transaction.id()),
        vec![Phase::Prepare, Phase::Commit, Phase::Rollback]
    );
    assert!(transaction.locked_entities().is_empty());
    assert!(manager.lock_manager().holders(&"ns".into()).is_empty());
    assert!(manager.lock_manager().holders(&"ns.orders".into()).is_empty());
    assert!(manager.is_empty());
}

#[test]
fn prepare_vote_aborts() {
    let manager = TransactionManager::default();
    let s1 = Arc::new(VolatileStore::new("s1"));
    let s2 = Arc::new(Reluctant(VolatileStore::new("s2")));
    let mut transaction = manager.begin();
    assert!(transaction.register_store(s1.clone()).is_ok());
    assert!(transaction.register_store(s2.clone()).is_ok());
    assert_eq!(
        transaction.commit(),
        Err(Error::PrepareFailed {
            store: "s2".to_string(),
            reason: "voted to abort".to_string()
        })
    );
    assert_eq!(
        s1.phases_of(transaction.id()),
        vec![Phase::Prepare, Phase::Rollback]
    );
    assert_eq!(
        s2.0.phases_of(transaction.id()),
        vec![Phase::Prepare, Phase::Rollback]
    );
}

#[test]
fn namespace_lock() {
    let manager = TransactionManager::default();
    let mut writer = manager.begin();
    assert!(writer.lock("sales.orders", LockMode::Exclusive).is_ok());

    // Writers inside the same namespace are compatible.
    let mut neighbour = manager.begin();
    assert!(neighbour.lock("sales.customers", LockMode::Exclusive).is_ok());
    assert!(neighbour.commit().is_ok());

    let dropped = AtomicBool::new(false);
    thread::scope(|s| {
        let admin = s.spawn(|| {
            let mut admin = manager.begin();
            assert!(admin.lock("sales", LockMode::Exclusive).is_ok());
            assert!(dropped.load(Acquire));
            assert!(admin.commit().is_ok());
        });
        while manager.lock_manager().wait_for_graph().is_empty() {
            thread::yield_now();
        }
        dropped.store(true, Release);
        assert!(writer.commit().is_ok());
        assert!(admin.join().is_ok());
    });
}

#[test]
fn competing_upgrades() {
    let manager = TransactionManager::default();
    let barrier = Barrier::new(2);
    thread::scope(|s| {
        for _ in 0..2 {
            let (manager, barrier) = (&manager, &barrier);
            s.spawn(move || {
                let mut transaction = manager.begin();
                assert!(transaction.lock("doc", LockMode::Shared).is_ok());
                barrier.wait();
                assert!(transaction.lock("doc", LockMode::Exclusive).is_ok());
                assert_eq!(
                    manager.lock_manager().holders(&"doc".into()),
                    vec![transaction.id()]
                );
                assert!(transaction.commit().is_ok());
            });
        }
    });
    assert_eq!(manager.telemetry().snapshot().commits, 2);
}

#[test]
fn batch() {
    let manager = TransactionManager::default();
    let barrier = Barrier::new(2);
    let requests = [
        (EntityId::from("ks.b"), LockMode::Exclusive),
        (EntityId::from("ks.a"), LockMode::Exclusive),
    ];
    thread::scope(|s| {
        for reversed in [false, true] {
            let (manager, barrier) = (&manager, &barrier);
            let mut requests = requests.to_vec();
            if reversed {
                requests.reverse();
            }
            s.spawn(move || {
                barrier.wait();
                for _ in 0..64 {
                    let mut transaction = manager.begin();
                    assert!(transaction.lock_all(requests.clone()).is_ok());
                    assert!(transaction.commit().is_ok());
                }
            });
        }
    });
    assert_eq!(manager.telemetry().snapshot().deadlocks, 0);
}

#[test]
fn kill_blocked_transaction() {
    let manager = TransactionManager::default();
    let mut holder = manager.begin();
    assert!(holder.lock("jobs", LockMode::Exclusive).is_ok());
    thread::scope(|s| {
        let victim = s.spawn(|| {
            let store = Arc::new(VolatileStore::new("queue"));
            let transaction = manager.begin();
            assert!(transaction.register_store(store.clone()).is_ok());
            let result = transaction.lock("jobs", LockMode::Shared);
            (result, store.phases_of(transaction.id()))
        });
        while manager.lock_manager().wait_for_graph().is_empty() {
            thread::yield_now();
        }
        let ids = manager.transaction_ids();
        assert_eq!(ids.len(), 2);
        assert!(manager.remove_transaction(ids[1]).is_ok());
        let (result, phases) = victim.join().unwrap();
        assert_eq!(result, Err(Error::Interrupted));
        assert_eq!(phases, vec![Phase::Rollback]);
    });
    assert_eq!(manager.transaction_ids(), vec![holder.id()]);
    assert!(holder.commit().is_ok());
}

#[test]
fn kill_rolls_back_before_release() {
    let manager = TransactionManager::default();
    let store = Arc::new(VolatileStore::new("rows"));
    let victim = manager.begin();
    assert!(victim.lock("orders", LockMode::Exclusive).is_ok());
    assert!(victim.register_store(store.clone()).is_ok());
    assert!(manager.remove_transaction(victim.id()).is_ok());
    assert_eq!(victim.state(), State::Aborted);
    assert_eq!(store.phases_of(victim.id()), vec![Phase::Rollback]);

    let mut other = manager.begin();
    assert!(other.lock("orders", LockMode::Exclusive).is_ok());
    assert!(other.register_store(store.clone()).is_ok());
    assert!(other.commit().is_ok());
    assert_eq!(
        store.journal(),
        vec![
            (victim.id(), Phase::Rollback),
            (other.id(), Phase::Prepare),
            (other.id(), Phase::Commit)
        ]
    );
    assert_eq!(victim.lock("orders", LockMode::Shared), Err(Error::Interrupted));
    assert!(victim.register_store(store.clone()).is_err());
}

#[test]
fn interrupted_holder_is_aborted() {
    let manager = TransactionManager::default();
    let mut transaction = manager.begin();
    assert!(transaction.lock("orders", LockMode::Exclusive).is_ok());
    transaction.interrupter().interrupt();
    assert_eq!(
        transaction.lock("orders", LockMode::Exclusive),
        Err(Error::Interrupted)
    );
    assert_eq!(transaction.state(), State::Aborted);
    assert!(manager.lock_manager().holders(&"orders".into()).is_empty());
    assert_eq!(transaction.commit(), Err(Error::Interrupted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn async_stress() {
    let manager = Arc::new(TransactionManager::default());
    let num_tasks = 16;
    let num_iterations = 64;
    let mut tasks = Vec::with_capacity(num_tasks);
    for task_id in 0..num_tasks {
        let manager = manager.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let mut aborted = 0;
            for i in 0..num_iterations {
                let mut transaction = manager.begin();
                let first = format!("db.t{}", (task_id + i) % 4);
                let second = format!("db.t{}", (task_id + i + 1) % 4);
                let result = transaction
                    .lock(first.as_str(), LockMode::Exclusive)
                    .and_then(|()| transaction.lock(second.as_str(), LockMode::Exclusive));
                match result {
                    Ok(()) => assert!(transaction.commit().is_ok()),
                    Err(error) => {
                        assert!(error.is_retryable());
                        assert_eq!(transaction.state(), State::Aborted);
                        aborted += 1;
                    }
                }
            }
            aborted
        }));
    }
    let aborted: usize = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .sum();
    let statistics = manager.telemetry().snapshot();
    assert_eq!(statistics.deadlocks, aborted as u64);
    assert_eq!(
        statistics.commits + statistics.rollbacks,
        (num_tasks * num_iterations) as u64
    );
    assert!(manager.is_empty());
    assert!(manager.lock_manager().wait_for_graph().is_empty());
}
