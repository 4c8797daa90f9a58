//! Error codes surfaced by device control methods.
//!
//! Success is expressed through `Ok`; [`ErrorCode`] carries the failure
//! classes only. Every setter reports synchronously and independently,
//! there is no global error state.

use std::fmt;

/// The failure classes returned by device control methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Device not connected or the transport failed unrecoverably.
    Connection,
    /// Operation not valid for the connected model.
    Unsupported,
    /// Argument out of range; no settings were changed.
    Parameter,
    /// Operating-system access to the device was refused.
    Access,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Connection => write!(f, "device not connected"),
            ErrorCode::Unsupported => write!(f, "operation not supported by this model"),
            ErrorCode::Parameter => write!(f, "parameter out of range"),
            ErrorCode::Access => write!(f, "access to the device was refused"),
        }
    }
}

impl std::error::Error for ErrorCode {}

/// Crate-level Result alias for device control methods.
pub type Result<T> = std::result::Result<T, ErrorCode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_connection() {
        assert_eq!(ErrorCode::Connection.to_string(), "device not connected");
    }

    #[test]
    fn display_parameter() {
        assert_eq!(ErrorCode::Parameter.to_string(), "parameter out of range");
    }

    #[test]
    fn codes_are_comparable() {
        assert_eq!(ErrorCode::Unsupported, ErrorCode::Unsupported);
        assert_ne!(ErrorCode::Unsupported, ErrorCode::Access);
    }
}
