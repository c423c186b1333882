//! Error codes shared between the daemon and clients.

use {std::fmt, thiserror::Error};

/// A POSIX-adjacent error code carried by `core.error` events and by
/// fallible graph operations.
///
/// The numeric representation is negative, matching the convention of
/// returning `-errno` from operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// Malformed payload, unknown method, bad port id.
    InvalidArgument,
    /// The underlying node does not implement the feature.
    NotSupported,
    /// An allocation failed.
    NoMemory,
    /// The access policy denied the operation.
    NoPermission,
    /// The object is busy with an async operation.
    Busy,
    /// A global from a different generation was referenced.
    Stale,
    /// The transport is dead.
    Io,
    /// Format negotiation failed.
    Format,
}

impl ErrorCode {
    pub fn to_raw(self) -> i32 {
        match self {
            ErrorCode::InvalidArgument => -22,
            ErrorCode::NotSupported => -95,
            ErrorCode::NoMemory => -12,
            ErrorCode::NoPermission => -1,
            ErrorCode::Busy => -16,
            ErrorCode::Stale => -116,
            ErrorCode::Io => -5,
            ErrorCode::Format => -71,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        let code = match raw {
            -22 => ErrorCode::InvalidArgument,
            -95 => ErrorCode::NotSupported,
            -12 => ErrorCode::NoMemory,
            -1 => ErrorCode::NoPermission,
            -16 => ErrorCode::Busy,
            -116 => ErrorCode::Stale,
            -5 => ErrorCode::Io,
            -71 => ErrorCode::Format,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::NotSupported => "not supported",
            ErrorCode::NoMemory => "no memory",
            ErrorCode::NoPermission => "no permission",
            ErrorCode::Busy => "busy",
            ErrorCode::Stale => "stale object generation",
            ErrorCode::Io => "transport error",
            ErrorCode::Format => "format negotiation failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorCode {}

/// An error surfaced on a bound object, as carried by `core.error`.
#[derive(Debug, Error)]
#[error("error on object {id}: {message}")]
pub struct ObjectError {
    /// The id of the object the error occurred on, in the id space of
    /// the client that observes it.
    pub id: u32,
    /// The raw error code, see [`ErrorCode::to_raw`].
    pub res: i32,
    pub message: String,
}

impl ObjectError {
    pub fn new(id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            res: code.to_raw(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_raw(self.res)
    }
}
