// We want a few things here:
// 1. A way to create a new error with a backtrace and a coarse kind that
//    callers can match on (bad queries vs. broken invariants vs. IO).
// 2. A way to centralize setting a breakpoint to trap any error in the system
//    fairly soon after it's created (or at least when it's propagated from a
//    library we use back to us).
// 3. Same but for logging / emitting error messages into the tracing/logging
//    system.

use backtrace_error::DynBacktraceError;
use std::borrow::Cow;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Coarse classification of index failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Value type not indexable, or a value the index refuses to store (NaN).
    Unsupported,
    /// Malformed operator set handed to the range translator.
    BadQuery,
    /// Internal bound miscomputation.
    OutOfRange,
    /// The backing store failed.
    Io,
    /// An index invariant broke mid-operation; the index needs a rebuild.
    Assertion,
    /// Scratch-area creation or cleanup failed; optimization aborted.
    Scratch,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    #[allow(dead_code)]
    inner: DynBacktraceError,
}

pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new(ErrorKind::Io, err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Error {
        error!(target: "sortidx", "{:?}: {:?}", kind, err);
        let dbe = DynBacktraceError::from(err);
        Error { kind, inner: dbe }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub fn err(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::new(kind, err)
}

#[test]
fn test_error_kind() {
    let e = err(ErrorKind::BadQuery, "test error");
    assert_eq!(e.kind(), ErrorKind::BadQuery);
}

#[test]
fn test_io_error_kind() {
    let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
    assert_eq!(e.kind(), ErrorKind::Io);
}
