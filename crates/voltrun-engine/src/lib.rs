// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VoltRun Engine - Function Execution
//!
//! Runs user functions (Node.js, Python, Go) inside isolated, resource-bounded
//! sandboxes and records every invocation as a durable execution.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        REST API (axum)                           │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │ invoke
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Execution Coordinator                        │
//! │   validate ─► record ─► acquire ─► run ─► finalize ─► release    │
//! └───────┬───────────────────────┬──────────────────────┬───────────┘
//!         │                       │                      │
//!         ▼                       ▼                      ▼
//! ┌───────────────┐   ┌──────────────────────┐   ┌──────────────────┐
//! │ Sandbox Pool  │──►│ Lifecycle Controller │──►│ Runtime Adapters │
//! │ (per class)   │   │ (limits, kill)       │   │ (node/python/go) │
//! └───────────────┘   └──────────┬───────────┘   └──────────────────┘
//!                                ▼
//!                        ┌───────────────┐
//!                        │ SandboxDriver │ process | mock
//!                        └───────────────┘
//!
//!         voltrun-core store (SQLite / PostgreSQL) ◄── Watchdog
//! ```
//!
//! # Guarantees
//!
//! - A sandbox hosts at most one execution at a time and is only reused
//!   within its (runtime, memory) class.
//! - Every accepted execution reaches exactly one terminal state; status
//!   changes are compare-and-set in the store.
//! - A run is killed when it passes its timeout or memory limit.
//! - Logs are capped; a truncation marker is appended when bytes are dropped.
//! - A client going away never cancels a run.
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.

/// Runtime adapters: stage code, bootstrap it, collect its result.
pub mod adapter;

/// Bounded log capture.
pub mod capture;

/// Configuration loaded from environment variables.
pub mod config;

/// Validates invocations and drives them to a terminal state.
pub mod coordinator;

/// Error types for engine operations.
pub mod error;

/// Embeddable runtime wiring the engine together.
pub mod runtime;

/// Sandboxes, their drivers, lifecycle and pool.
pub mod sandbox;

/// REST API.
pub mod server;

/// Background reconciliation of executions that never finished.
pub mod watchdog;

pub use error::{Error, Result};
