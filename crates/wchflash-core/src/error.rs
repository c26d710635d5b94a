//! Error types for wchflash-core
//!
//! This module provides a no_std compatible error type that can be used
//! throughout the crate.

use core::fmt;

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Target state errors
    /// Target CPU is not halted; flash operations require a halted core
    NotHalted,
    /// Flash bank geometry has not been probed yet
    NotProbed,

    // Controller errors
    /// Status register busy bit never cleared within the operation timeout
    ///
    /// This usually means the flash controller locked up; an external
    /// reset is the only recovery.
    BusyTimeout,
    /// Key sequence written but the lock bit never cleared
    ///
    /// The controller ignores further key writes until the next reset, so
    /// this is not retried.
    LockedUp,
    /// Write-protect error bit was set during an operation
    ProtectionViolation,

    // Resource errors
    /// Not enough target scratch RAM for the resident write routine
    ///
    /// Internal: the write engine converts this into the slow fallback
    /// path, it never reaches a caller of [`crate::write::write`].
    ResourceUnavailable,

    // Identification errors
    /// Device ID register does not match any known CH32F2x family
    UnknownDevice,

    // Request errors
    /// Sector range or address range outside the flash bank
    InvalidRange,
    /// Address or length not aligned to the halfword program unit
    InvalidAlignment,

    // I/O errors
    /// Communication with the debug probe or target failed
    Link,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotHalted => write!(f, "target not halted"),
            Self::NotProbed => write!(f, "flash bank not probed"),
            Self::BusyTimeout => {
                write!(f, "timed out waiting for flash, reset may be required")
            }
            Self::LockedUp => write!(
                f,
                "flash registers did not unlock, controller locked up until reset"
            ),
            Self::ProtectionViolation => write!(f, "flash region is write protected"),
            Self::ResourceUnavailable => write!(f, "no target working area available"),
            Self::UnknownDevice => write!(f, "cannot identify target as a CH32F2x"),
            Self::InvalidRange => write!(f, "request outside flash bank bounds"),
            Self::InvalidAlignment => write!(f, "address or length not halfword aligned"),
            Self::Link => write!(f, "debug link I/O failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
