//! Crate-wide error type.
//!
//! Every fallible operation returns [`VfsResult`]. The variants mirror the
//! outcomes the embedded engine can observe: a file that cannot be opened, a
//! read past the end of the file, a lock that could not be acquired without
//! blocking, and unexpected store failures. Anything that does not fit those
//! buckets is an internal invariant breach and is reported as such. When the
//! breach means the caller handed us a file handle we never opened, it is a
//! panic instead, since masking it would corrupt data.

use crate::vfs;

pub type VfsResult<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The file does not exist and CREATE was not requested, or the backing
    /// store refused to open (schema mismatch, connect failure).
    CannotOpen(String),

    /// A read extended past the logical file size. The untouched tail of the
    /// caller's buffer has been zero-filled before this is returned.
    ShortRead,

    /// A lock escalation was denied without blocking other progress.
    Busy,

    /// The backing store failed mid-transaction. Never retried locally.
    Io(String),

    /// Malformed persisted data (record payloads, purge maps).
    Parse(String),

    /// The store reports a schema version this build cannot upgrade from.
    Schema { found: u32, supported: u32 },

    /// A broken invariant that is not attributable to the caller's data.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::CannotOpen(what) => write!(f, "cannot open {what}"),
            Error::ShortRead => write!(f, "short read"),
            Error::Busy => write!(f, "lock busy"),
            Error::Io(cause) => write!(f, "i/o error: {cause}"),
            Error::Parse(cause) => write!(f, "parse error: {cause}"),
            Error::Schema { found, supported } => {
                write!(f, "unsupported schema version {found}, this build supports {supported}")
            }
            Error::Internal(cause) => write!(f, "internal error: {cause}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Maps the error onto the engine-facing status integer. Called at the
    /// façade boundary only; internal code keeps the typed error.
    pub fn status(&self) -> i32 {
        match self {
            Error::CannotOpen(_) | Error::Schema { .. } => vfs::CANTOPEN,
            Error::ShortRead => vfs::IOERR_SHORT_READ,
            Error::Busy => vfs::BUSY,
            _ => vfs::IOERR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::CannotOpen(err.to_string())
    }
}
