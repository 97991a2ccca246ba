// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by the store and the engine.

mod execution;
mod function;

pub use execution::{
    ErrorKind, ExecutionError, ExecutionFilter, ExecutionRecord, ExecutionStatus, NewExecution,
    TransitionPayload,
};
pub use function::{
    DEFAULT_ENTRY_POINT, DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT_SEC, EntryPoint, Function,
    FunctionSpec, FunctionStatus, FunctionUpdate, FunctionValidationError, MEMORY_MB_MAX,
    MEMORY_MB_MIN, NewFunction, Runtime, RuntimeFamily, TIMEOUT_SEC_MAX, TIMEOUT_SEC_MIN,
    UnknownRuntime,
};
