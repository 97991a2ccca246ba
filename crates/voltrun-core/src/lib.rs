// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VoltRun Core - function and execution records
//!
//! This crate holds the data model of the VoltRun execution engine and the
//! durable stores behind it:
//!
//! - [`model`]: functions, runtimes, execution statuses and error kinds
//! - [`persistence`]: the [`persistence::ExecutionStore`] and
//!   [`persistence::FunctionStore`] traits with SQLite and PostgreSQL backends
//!
//! # Execution lifecycle
//!
//! ```text
//! pending ──► running ──► success
//!                   └───► failed
//! ```
//!
//! Every status change goes through [`persistence::ExecutionStore::transition`],
//! a compare-and-set keyed on the expected current status. A writer that loses
//! the race receives [`error::StoreError::Conflict`] and its payload is
//! discarded, so a terminal row is written exactly once.

pub mod error;
pub mod model;
pub mod persistence;

pub use error::StoreError;
