//! Worker Error Handling
//!
//! This module provides the error type shared by every layer of the worker using `thiserror`.
//!
//! # Error Categories
//! - **Protocol errors**: malformed framing, unknown job types, version mismatches,
//!   out-of-range lengths, oversized constant names
//! - **I/O errors**: output writes, input deletes, include materialization
//! - **Plugin errors**: console support or host compiler libraries that fail to load
//! - **Config errors**: unreadable or malformed worker configuration
//!
//! Compile failures are *not* errors. They are ordinary job output and never
//! reach this type.
//!
//! Every variant carries the [`SourceLocation`] where it was raised so the
//! parent engine sees the file and line in the error record it receives.

use std::fmt;
use std::panic::Location;
use thiserror::Error;

/// Source location for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: &'static str, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }

    /// Location of the caller of the enclosing `#[track_caller]` function.
    #[track_caller]
    #[inline]
    pub fn caller() -> Self {
        let location: &'static Location<'static> = Location::caller();
        Self::new(location.file(), location.line(), location.column())
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Fatal worker error.
///
/// Any value of this type that escapes a job ends the worker: the message is
/// serialized into the error record the parent is polling for and the process
/// exits with a nonzero status.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Malformed batch framing or job payload.
    #[error("Protocol error at {location}: {message}")]
    Protocol {
        message: String,
        location: SourceLocation,
    },

    /// File system failure that the worker cannot recover from.
    #[error("I/O error at {location}: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
        location: SourceLocation,
    },

    /// Console support or host compiler library failure.
    #[error("Plugin error at {location}: {message}")]
    Plugin {
        message: String,
        location: SourceLocation,
    },

    /// Worker configuration failure.
    #[error("Configuration error at {location}: {message}")]
    Config {
        message: String,
        location: SourceLocation,
    },
}

impl WorkerError {
    /// Create a protocol error at the caller's location.
    #[cold]
    #[track_caller]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            location: SourceLocation::caller(),
        }
    }

    /// Create an I/O error at the caller's location, keeping the OS error as the source.
    #[cold]
    #[track_caller]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(source),
            location: SourceLocation::caller(),
        }
    }

    /// Create an I/O error that has no underlying OS error.
    #[cold]
    #[track_caller]
    pub fn io_message(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
            location: SourceLocation::caller(),
        }
    }

    /// Create a plugin error at the caller's location.
    #[cold]
    #[track_caller]
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::Plugin {
            message: message.into(),
            location: SourceLocation::caller(),
        }
    }

    /// Create a configuration error at the caller's location.
    #[cold]
    #[track_caller]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            location: SourceLocation::caller(),
        }
    }

    /// Where the error was raised.
    pub fn location(&self) -> SourceLocation {
        match self {
            Self::Protocol { location, .. }
            | Self::Io { location, .. }
            | Self::Plugin { location, .. }
            | Self::Config { location, .. } => *location,
        }
    }

    /// Bare message without the location prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Protocol { message, .. }
            | Self::Io { message, .. }
            | Self::Plugin { message, .. }
            | Self::Config { message, .. } => message,
        }
    }
}

/// Fail with a protocol error unless `condition` holds.
///
/// Mirrors the engine's `check`/`verify` assertions: both route to the same
/// fatal channel and both report the caller's file and line.
#[track_caller]
#[inline]
pub fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), WorkerError> {
    if condition {
        Ok(())
    } else {
        Err(WorkerError::protocol(message()))
    }
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_points_at_caller() {
        let err = WorkerError::protocol("bad frame");
        assert_eq!(err.location().file, file!());
        assert!(err.to_string().contains("bad frame"));
        assert!(err.to_string().contains(file!()));
    }

    #[test]
    fn test_ensure() {
        assert!(ensure(true, || "unused".to_string()).is_ok());
        let err = ensure(false, || "version 3 != 0".to_string()).unwrap_err();
        assert_eq!(err.message(), "version 3 != 0");
    }

    #[test]
    fn test_io_keeps_source() {
        let os = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = WorkerError::io("Couldn't delete input", os);
        assert!(std::error::Error::source(&err).is_some());
    }
}
