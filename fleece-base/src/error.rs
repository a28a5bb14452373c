// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A small fixed taxonomy of error kinds that callers can match on without downcasting

use std::borrow::Cow;
use std::fmt;

use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// The fixed error taxonomy carried through the read and write paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Allocation failure.
    MemoryError,
    /// Array index or buffer offset beyond bounds.
    OutOfRange,
    /// Malformed Fleece buffer discovered during untrusted validation.
    InvalidData,
    /// Misuse of the encoder grammar (unbalanced begin/end, stray write_key, ...).
    EncodeError,
    /// Malformed JSON input, or a value kind that cannot be JSON-encoded.
    JSONError,
    /// Validated data with a tag this build doesn't recognize.
    UnknownValue,
    /// Malformed path expression or JSON Pointer.
    PathSyntaxError,
    /// Invariant violation; a programming bug rather than bad input.
    InternalError,
    /// SharedKeys decode miss.
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MemoryError => "MemoryError",
            ErrorKind::OutOfRange => "OutOfRange",
            ErrorKind::InvalidData => "InvalidData",
            ErrorKind::EncodeError => "EncodeError",
            ErrorKind::JSONError => "JSONError",
            ErrorKind::UnknownValue => "UnknownValue",
            ErrorKind::PathSyntaxError => "PathSyntaxError",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: DynBacktraceError,
}
pub type Result<T> = std::result::Result<T, Error>;

struct KindErr(ErrorKind, Cow<'static, str>);
impl fmt::Debug for KindErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.1)
    }
}
impl fmt::Display for KindErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.1)
    }
}
impl std::error::Error for KindErr {
    fn description(&self) -> &str {
        &self.1
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(ErrorKind::InternalError, err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Error {
        error!(target: "fleece", kind = %kind, "{:?}", err);
        let inner = DynBacktraceError::from(err);
        Error { kind, inner }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.inner)
    }
}

pub fn err(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let e = KindErr(kind, msg.into());
    Error::new(kind, e)
}

#[test]
fn test_error() {
    let e = err(ErrorKind::PathSyntaxError, "bad path");
    assert_eq!(e.kind(), ErrorKind::PathSyntaxError);
    assert!(format!("{}", e).contains("bad path"));
}
