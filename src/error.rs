use std::io;
use std::os::raw::c_int;
use std::result;

use thiserror::Error;

/// Custom result type for environment, transaction and database operations
pub type Result<T> = result::Result<T, Error>;

/// Successful result
pub const MDB_SUCCESS: c_int = 0;
/// Key/data pair already exists
pub const MDB_KEYEXIST: c_int = -30799;
/// No matching key/data pair found
pub const MDB_NOTFOUND: c_int = -30798;
/// Requested page not found
pub const MDB_PAGE_NOTFOUND: c_int = -30797;
/// Located page was wrong type
pub const MDB_CORRUPTED: c_int = -30796;
/// Update of meta page failed or environment had fatal error
pub const MDB_PANIC: c_int = -30795;
/// Environment version mismatch
pub const MDB_VERSION_MISMATCH: c_int = -30794;
/// File is not a valid environment file
pub const MDB_INVALID: c_int = -30793;
/// Environment mapsize reached
pub const MDB_MAP_FULL: c_int = -30792;
/// Environment maxdbs reached
pub const MDB_DBS_FULL: c_int = -30791;
/// Environment maxreaders reached
pub const MDB_READERS_FULL: c_int = -30790;
/// Transaction has too many dirty pages
pub const MDB_TXN_FULL: c_int = -30788;
/// Operation and database incompatible
pub const MDB_INCOMPATIBLE: c_int = -30784;
/// Transaction must abort, has a child, or is invalid
pub const MDB_BAD_TXN: c_int = -30782;
/// Unsupported size of key/DB name/data
pub const MDB_BAD_VALSIZE: c_int = -30781;
/// The specified DBI was changed unexpectedly
pub const MDB_BAD_DBI: c_int = -30780;

/// Permission denied
pub const EACCES: c_int = 13;
/// Invalid argument
pub const EINVAL: c_int = 22;

/// Coarse classification of an [`Error`], for retry and fallback decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Misuse of a closed environment or a finished transaction. Not retryable.
    State,
    /// A configured capacity was exhausted. Retry only after reconfiguring.
    Capacity,
    /// An expected miss or conflict on a key.
    Data,
    /// Any other engine or operating system failure.
    Native,
}

/// Errors returned by the transaction and database-handle layer
#[derive(Debug, Error)]
pub enum Error {
    /// Environment has not been opened, or has been closed
    #[error("environment is not open")]
    NotOpen,
    /// Environment was already opened once
    #[error("environment is already open")]
    AlreadyOpen,
    /// Transaction was already committed
    #[error("transaction has already been committed")]
    AlreadyCommitted,
    /// Transaction was already aborted
    #[error("transaction has already been aborted")]
    AlreadyAborted,
    /// Transaction has an active child, or cannot be used this way
    #[error("transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Write attempted through a read-only environment or transaction
    #[error("environment or transaction is read-only")]
    ReadOnly,
    /// Database handle is not registered for this environment.
    ///
    /// Also returned for a handle whose registration was rolled back because
    /// the transaction that created it aborted or failed to commit. The code
    /// is `MDB_BAD_DBI`, not `EINVAL`.
    #[error("database handle is not valid for this environment")]
    BadDbi,
    /// Environment maxdbs limit reached
    #[error("environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// Environment mapsize limit reached
    #[error("environment mapsize limit reached")]
    MapFull,
    /// No matching key/data pair found
    #[error("no matching key/data pair found")]
    NotFound,
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// File is not a valid environment file
    #[error("file is not a valid environment file")]
    Invalid,
    /// Environment file was written by an incompatible version
    #[error("environment version mismatch")]
    VersionMismatch,
    /// Operating system error while creating or accessing the environment
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Any other engine result code
    #[error("engine error {code}: {}", strerror(.code))]
    Engine { code: c_int },
}

impl Error {
    /// The numeric result code behind this error, if it has one
    pub fn code(&self) -> Option<c_int> {
        match self {
            Error::NotOpen | Error::AlreadyOpen | Error::AlreadyCommitted | Error::AlreadyAborted => {
                None
            }
            Error::BadTxn => Some(MDB_BAD_TXN),
            Error::ReadOnly => Some(EACCES),
            Error::BadDbi => Some(MDB_BAD_DBI),
            Error::DbsFull => Some(MDB_DBS_FULL),
            Error::ReadersFull => Some(MDB_READERS_FULL),
            Error::MapFull => Some(MDB_MAP_FULL),
            Error::NotFound => Some(MDB_NOTFOUND),
            Error::KeyExist => Some(MDB_KEYEXIST),
            Error::Invalid => Some(MDB_INVALID),
            Error::VersionMismatch => Some(MDB_VERSION_MISMATCH),
            Error::Io(err) => err.raw_os_error(),
            Error::Engine { code } => Some(*code),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::NotOpen
            | Error::AlreadyOpen
            | Error::AlreadyCommitted
            | Error::AlreadyAborted
            | Error::BadTxn
            | Error::ReadOnly
            | Error::BadDbi => ErrorCategory::State,
            Error::DbsFull | Error::ReadersFull | Error::MapFull => ErrorCategory::Capacity,
            Error::NotFound | Error::KeyExist => ErrorCategory::Data,
            Error::Invalid | Error::VersionMismatch | Error::Io(_) | Error::Engine { .. } => {
                ErrorCategory::Native
            }
        }
    }
}

impl From<c_int> for Error {
    fn from(err: c_int) -> Error {
        match err {
            MDB_KEYEXIST => Error::KeyExist,
            MDB_NOTFOUND => Error::NotFound,
            MDB_VERSION_MISMATCH => Error::VersionMismatch,
            MDB_INVALID => Error::Invalid,
            MDB_MAP_FULL => Error::MapFull,
            MDB_DBS_FULL => Error::DbsFull,
            MDB_READERS_FULL => Error::ReadersFull,
            MDB_BAD_TXN => Error::BadTxn,
            MDB_BAD_DBI => Error::BadDbi,
            EACCES => Error::ReadOnly,
            code => Error::Engine { code },
        }
    }
}

/// Message for a numeric result code
pub fn strerror(code: &c_int) -> &'static str {
    match *code {
        MDB_SUCCESS => "Successful return",
        MDB_KEYEXIST => "Key/data pair already exists",
        MDB_NOTFOUND => "No matching key/data pair found",
        MDB_PAGE_NOTFOUND => "Requested page not found",
        MDB_CORRUPTED => "Located page was wrong type",
        MDB_PANIC => "Update of meta page failed or environment had fatal error",
        MDB_VERSION_MISMATCH => "Database environment version mismatch",
        MDB_INVALID => "File is not an LMDB file",
        MDB_MAP_FULL => "Environment mapsize limit reached",
        MDB_DBS_FULL => "Environment maxdbs limit reached",
        MDB_READERS_FULL => "Environment maxreaders limit reached",
        MDB_TXN_FULL => "Transaction has too many dirty pages",
        MDB_INCOMPATIBLE => "Operation and DB incompatible, or DB flags changed",
        MDB_BAD_TXN => "Transaction must abort, has a child, or is invalid",
        MDB_BAD_VALSIZE => "Unsupported size of key/DB name/data, or wrong DUPFIXED size",
        MDB_BAD_DBI => "The specified DBI handle was closed/changed unexpectedly",
        EACCES => "Permission denied",
        EINVAL => "Invalid argument",
        _ => "Unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_codes_round_trip() {
        for code in [
            MDB_KEYEXIST,
            MDB_NOTFOUND,
            MDB_MAP_FULL,
            MDB_DBS_FULL,
            MDB_READERS_FULL,
            MDB_BAD_TXN,
            MDB_BAD_DBI,
            MDB_INVALID,
            MDB_VERSION_MISMATCH,
            EACCES,
        ] {
            let err = Error::from(code);
            assert!(!matches!(err, Error::Engine { .. }), "{code} fell through");
            assert_eq!(err.code(), Some(code));
        }
    }

    #[test]
    fn unknown_codes_keep_their_number() {
        let err = Error::from(MDB_BAD_VALSIZE);
        assert!(matches!(err, Error::Engine { code: MDB_BAD_VALSIZE }));
        assert_eq!(err.code(), Some(MDB_BAD_VALSIZE));
        assert_eq!(err.category(), ErrorCategory::Native);
        assert!(err.to_string().contains("-30781"));

        let err = Error::from(EINVAL);
        assert_eq!(err.code(), Some(EINVAL));
    }

    #[test]
    fn categories() {
        assert_eq!(Error::NotOpen.category(), ErrorCategory::State);
        assert_eq!(Error::AlreadyAborted.category(), ErrorCategory::State);
        assert_eq!(Error::DbsFull.category(), ErrorCategory::Capacity);
        assert_eq!(Error::ReadersFull.category(), ErrorCategory::Capacity);
        assert_eq!(Error::NotFound.category(), ErrorCategory::Data);
        assert_eq!(Error::AlreadyCommitted.code(), None);
    }

    #[test]
    fn io_errors_keep_os_code() {
        let err = Error::from(io::Error::from_raw_os_error(2));
        assert_eq!(err.code(), Some(2));
        assert_eq!(err.category(), ErrorCategory::Native);
    }
}
