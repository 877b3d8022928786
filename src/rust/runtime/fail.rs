// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::libc::{
    c_int,
    EIO,
};
use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure of a scheduler or device operation.
///
/// The errno is what a driver entry point would hand back to its caller: `EINVAL` for a malformed request, `EBUSY`
/// while a core is stopped or a CU is held, `EIO` when the scheduler is gone.
#[derive(Clone, PartialEq, Eq)]
pub struct Fail {
    pub errno: c_int,
    /// Human readable cause, logged at the failure site.
    pub cause: String,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Fail {
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Keeps the OS error code when there is one, e.g. `ENOENT` for a missing configuration file.
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: format!("I/O error: {}", e),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ::anyhow::Result;

    #[test]
    fn io_errors_keep_their_errno() -> Result<()> {
        let missing: Fail = Fail::from(io::Error::from_raw_os_error(libc::ENOENT));
        crate::ensure_eq!(missing.errno, libc::ENOENT);
        let other: Fail = Fail::from(io::Error::new(io::ErrorKind::Other, "short read"));
        crate::ensure_eq!(other.errno, EIO);
        crate::ensure_eq!(other.to_string().contains("short read"), true);
        Ok(())
    }
}
