// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod fail;
pub mod limits;
pub mod logging;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::{
    Mutex,
    MutexGuard,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Acquires a mutex, recovering the inner state if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
