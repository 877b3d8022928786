// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::sync::{
    Once,
    OnceLock,
};

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the lifetime of the process.
static LOG_HANDLE: OnceLock<LoggerHandle> = OnceLock::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features.
///
/// The log specification is taken from `RUST_LOG`, falling back to `warn`.
pub fn initialize() {
    INIT_LOG.call_once(|| match Logger::try_with_env_or_str("warn").and_then(|logger| logger.start()) {
        Ok(handle) => {
            let _ = LOG_HANDLE.set(handle);
        },
        Err(e) => eprintln!("initialize(): failed to start logger ({:?})", e),
    });
}
