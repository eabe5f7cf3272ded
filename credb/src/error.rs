use serde_derive::{Deserialize, Serialize};

/// All errors that operation handlers can surface to their callers.
///
/// Reads and writes recover locally only from `NotFound` and
/// `PolicyRejected` (the caller sees an invalid event id). Everything else
/// aborts the operation and releases its lock handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Key, path or index does not exist.
    NotFound,

    /// Malformed key, unknown opcode, or an unsupported predicate.
    InvalidArgument(String),

    /// The policy evaluator returned false or failed.
    /// The object appears absent to the caller; no partial write happens.
    PolicyRejected,

    /// A loaded page is older than the version the caller expected.
    Staleness(String),

    /// Non-blocking lock acquisition failed during transaction prepare.
    /// The client may retry the whole transaction.
    LockContention,

    /// Prepare failed (validation or contention) or a child peer aborted.
    TransactionAborted(String),

    /// Invariant violation, e.g. a broken object reference or an invalid
    /// block state. In production the enclave terminates on these.
    Internal(String),

    /// I/O failure talking to the untrusted page store.
    Io(String),

    /// Encoding or decoding failure.
    Serialization(String),
}

pub type CResult<T> = Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::InvalidArgument(s) => write!(f, "invalid argument: {}", s),
            Error::PolicyRejected => write!(f, "rejected by security policy"),
            Error::Staleness(s) => write!(f, "stale data detected: {}", s),
            Error::LockContention => write!(f, "lock contention"),
            Error::TransactionAborted(s) => write!(f, "transaction aborted: {}", s),
            Error::Internal(s) => write!(f, "internal error: {}", s),
            Error::Io(s) => write!(f, "io error: {}", s),
            Error::Serialization(s) => write!(f, "serialization error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Error::NotFound.to_string(), "not found");
        assert_eq!(
            Error::TransactionAborted("lock contention".into()).to_string(),
            "transaction aborted: lock contention"
        );
    }

    #[test]
    fn from_io() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err, Error::Io("boom".into()));
    }
}
