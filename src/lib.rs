// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Pessimistic concurrency control for transactions spanning heterogeneous data stores.
//!
//! Transactions acquire shared or exclusive locks on hierarchical entities through a
//! [`LockManager`], deadlocks are detected on a [`WaitForGraph`] when a request is about to wait,
//! and the involved [`Store`] instances are driven through prepare, commit, and rollback by the
//! [`Transaction`].

mod config;
mod entity;
mod error;
mod lock;
mod lock_manager;
mod store;
mod telemetry;
mod transaction;
mod transaction_manager;
mod wait_for_graph;

pub use config::Config;
pub use entity::{EntityId, Flat, Granularity, Hierarchical};
pub use error::Error;
pub use lock::{Lock, LockMode};
pub use lock_manager::LockManager;
pub use store::{Phase, Store, StoreError, VolatileStore};
pub use telemetry::{Statistics, Telemetry};
pub use transaction::{Interrupter, State, Transaction, ID as TransactionId};
pub use transaction_manager::TransactionManager;
pub use wait_for_graph::WaitForGraph;
